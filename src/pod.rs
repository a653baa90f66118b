use serde::{Deserialize, Serialize};

/// Quality-of-service class assigned to the pod by the admission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

/// A container as seen by the CPU manager: its name and its pre-validated
/// whole-CPU request. Fractional requests arrive here as `0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub cpus: usize,
}

impl Container {
    pub fn new(name: impl Into<String>, cpus: usize) -> Self {
        Self {
            name: name.into(),
            cpus,
        }
    }
}

/// A pod with the fields the CPU manager consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub qos_class: QosClass,
    #[serde(default)]
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
}

impl Pod {
    /// A Guaranteed pod in the `default` namespace.
    pub fn guaranteed(uid: impl Into<String>, containers: Vec<Container>) -> Self {
        let uid = uid.into();
        Self {
            name: format!("pod-{uid}"),
            uid,
            namespace: "default".to_string(),
            qos_class: QosClass::Guaranteed,
            init_containers: Vec::new(),
            containers,
        }
    }

    pub fn with_init_containers(mut self, init_containers: Vec<Container>) -> Self {
        self.init_containers = init_containers;
        self
    }

    pub fn with_qos_class(mut self, qos_class: QosClass) -> Self {
        self.qos_class = qos_class;
        self
    }

    /// Init containers first, in start order, then app containers.
    pub fn all_containers(&self) -> impl Iterator<Item = &Container> {
        self.init_containers.iter().chain(self.containers.iter())
    }

    pub fn find_container(&self, name: &str) -> Option<&Container> {
        self.all_containers().find(|c| c.name == name)
    }

    /// Exclusive CPUs a container qualifies for; 0 when it does not qualify.
    #[must_use]
    pub fn guaranteed_cpus(&self, container: &Container) -> usize {
        if self.qos_class != QosClass::Guaranteed {
            return 0;
        }
        container.cpus
    }

    /// Exclusive CPUs the whole pod needs at its peak: init containers run
    /// one at a time before the app containers, which run together.
    #[must_use]
    pub fn pod_guaranteed_cpus(&self) -> usize {
        if self.qos_class != QosClass::Guaranteed {
            return 0;
        }
        let init_max = self.init_containers.iter().map(|c| c.cpus).max().unwrap_or(0);
        let app_sum: usize = self.containers.iter().map(|c| c.cpus).sum();
        init_max.max(app_sum)
    }

    /// `namespace/name` for log lines.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guaranteed_cpus() {
        let pod = Pod::guaranteed("p1", vec![Container::new("app", 2)]);
        assert_eq!(pod.guaranteed_cpus(&pod.containers[0]), 2);

        let burstable = pod.clone().with_qos_class(QosClass::Burstable);
        assert_eq!(burstable.guaranteed_cpus(&burstable.containers[0]), 0);
    }

    #[test]
    fn test_pod_guaranteed_cpus() {
        let pod = Pod::guaranteed("p1", vec![Container::new("a", 2), Container::new("b", 1)])
            .with_init_containers(vec![Container::new("init", 4)]);
        assert_eq!(pod.pod_guaranteed_cpus(), 4);
        assert_eq!(pod.all_containers().count(), 3);
        assert_eq!(pod.find_container("b").map(|c| c.cpus), Some(1));
    }
}
