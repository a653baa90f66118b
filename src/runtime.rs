//! # Container Runtime
//!
//! How cpusets reach running containers, plus the registry of containers the
//! manager currently knows to be running.

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use os_api::OS;
use std::collections::{HashMap, HashSet};

/// A running container and the processes that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub container_id: String,
    pub pod_uid: String,
    pub container_name: String,
    pub pids: Vec<u32>,
    pub created_at: std::time::SystemTime,
}

/// Applies cpusets to containers.
pub trait ContainerRuntime: Send + Sync {
    /// Restricts every process of `container` to `cpus`.
    fn update_container_cpus(&self, container: &RunningContainer, cpus: &CpuSet) -> Result<()>;

    /// Refreshes the process list of `container`. Returns false once the
    /// container has no processes left.
    fn refresh_container(&self, container: &mut RunningContainer) -> bool;
}

/// Pins container processes with `sched_setaffinity`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessAffinityRuntime;

impl ContainerRuntime for ProcessAffinityRuntime {
    fn update_container_cpus(&self, container: &RunningContainer, cpus: &CpuSet) -> Result<()> {
        let wanted = cpus.to_vec();
        let mut failures = Vec::new();

        for &pid in &container.pids {
            // skip processes that are already pinned correctly
            if OS::get_process_affinity(pid).is_ok_and(|current| current == wanted) {
                continue;
            }
            if let Err(e) = OS::set_process_affinity(pid, &wanted) {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CpuManagerError::Runtime(format!(
                "container {}: {}",
                container.container_id,
                failures.join("; ")
            )))
        }
    }

    fn refresh_container(&self, container: &mut RunningContainer) -> bool {
        let Some(&root) = container.pids.first() else {
            return false;
        };
        OS::find_all_descendants(root, &mut container.pids);
        container.pids.retain(|&pid| OS::is_pid_live(pid));
        !container.pids.is_empty()
    }
}

/// Running containers, keyed by container id, plus the identities that
/// were admitted but have not started yet.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    containers: HashMap<String, RunningContainer>,
    admitted: HashSet<(String, String)>,
}

impl ContainerRegistry {
    /// Marks an identity as admitted ahead of its start.
    pub fn admit(&mut self, pod_uid: &str, container_name: &str) {
        self.admitted
            .insert((pod_uid.to_string(), container_name.to_string()));
    }

    pub fn add_container(&mut self, container_id: &str, pod_uid: &str, container_name: &str, pids: Vec<u32>) {
        self.admitted
            .remove(&(pod_uid.to_string(), container_name.to_string()));
        self.containers.insert(
            container_id.to_string(),
            RunningContainer {
                container_id: container_id.to_string(),
                pod_uid: pod_uid.to_string(),
                container_name: container_name.to_string(),
                pids,
                created_at: std::time::SystemTime::now(),
            },
        );
    }

    pub fn remove_container(&mut self, container_id: &str) -> Option<RunningContainer> {
        self.containers.remove(container_id)
    }

    /// Forgets the identity and returns the ids of its containers.
    pub fn remove_by_identity(&mut self, pod_uid: &str, container_name: &str) -> Vec<String> {
        self.admitted
            .remove(&(pod_uid.to_string(), container_name.to_string()));
        let ids: Vec<String> = self
            .containers
            .values()
            .filter(|c| c.pod_uid == pod_uid && c.container_name == container_name)
            .map(|c| c.container_id.clone())
            .collect();
        for id in &ids {
            self.containers.remove(id);
        }
        ids
    }

    #[must_use]
    pub fn get(&self, container_id: &str) -> Option<&RunningContainer> {
        self.containers.get(container_id)
    }

    #[must_use]
    pub fn contains_identity(&self, pod_uid: &str, container_name: &str) -> bool {
        self.containers
            .values()
            .any(|c| c.pod_uid == pod_uid && c.container_name == container_name)
    }

    /// True if the identity is running or admitted.
    #[must_use]
    pub fn is_known(&self, pod_uid: &str, container_name: &str) -> bool {
        self.contains_identity(pod_uid, container_name)
            || self
                .admitted
                .contains(&(pod_uid.to_string(), container_name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunningContainer> {
        self.containers.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Refreshes every container's processes and drops the ones that exited.
    pub fn refresh(&mut self, runtime: &dyn ContainerRuntime) -> Vec<RunningContainer> {
        let ids: Vec<String> = self.containers.keys().cloned().collect();
        let mut exited = Vec::new();

        for id in ids {
            let alive = match self.containers.get_mut(&id) {
                Some(container) => runtime.refresh_container(container),
                None => continue,
            };
            if !alive {
                if let Some(container) = self.containers.remove(&id) {
                    tracing::debug!(
                        "container {} ({}/{}) has exited",
                        container.container_id,
                        container.pod_uid,
                        container.container_name
                    );
                    exited.push(container);
                }
            }
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_identity() {
        let mut registry = ContainerRegistry::default();
        registry.add_container("c1", "pod", "app", vec![1]);
        registry.add_container("c2", "pod", "sidecar", vec![2]);

        assert_eq!(registry.len(), 2);
        assert!(registry.contains_identity("pod", "app"));
        assert_eq!(registry.remove_by_identity("pod", "app"), vec!["c1".to_string()]);
        assert!(!registry.contains_identity("pod", "app"));
        assert_eq!(registry.get("c2").map(|c| c.pids.clone()), Some(vec![2]));
        assert!(registry.remove_container("c2").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_admitted_identity_is_known_until_removed() {
        let mut registry = ContainerRegistry::default();
        registry.admit("pod", "app");
        assert!(registry.is_known("pod", "app"));
        assert!(!registry.contains_identity("pod", "app"));

        registry.add_container("c1", "pod", "app", vec![1]);
        assert!(registry.contains_identity("pod", "app"));
        registry.remove_by_identity("pod", "app");
        assert!(!registry.is_known("pod", "app"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_refresh_drops_exited_containers() {
        let mut registry = ContainerRegistry::default();
        registry.add_container("self", "pod", "app", vec![std::process::id()]);
        registry.add_container("gone", "pod", "old", vec![u32::MAX - 1]);
        registry.add_container("empty", "pod", "none", Vec::new());

        let exited = registry.refresh(&ProcessAffinityRuntime);
        let mut ids: Vec<_> = exited.iter().map(|c| c.container_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["empty", "gone"]);
        assert!(registry.get("self").is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_own_process() {
        let pid = std::process::id();
        let current = CpuSet::from_cpus(OS::get_process_affinity(pid).unwrap());
        let container = RunningContainer {
            container_id: "self".to_string(),
            pod_uid: "pod".to_string(),
            container_name: "app".to_string(),
            pids: vec![pid],
            created_at: std::time::SystemTime::now(),
        };
        ProcessAffinityRuntime.update_container_cpus(&container, &current).unwrap();
        assert!(ProcessAffinityRuntime
            .update_container_cpus(&container, &CpuSet::new())
            .is_err());
    }
}
