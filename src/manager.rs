//! # CPU Manager
//!
//! Front door of the crate. Serialises every state mutation behind one lock,
//! answers topology-hint queries from a snapshot, and keeps the cpusets of
//! running containers in line with the allocation state.

use crate::cpuset::CpuSet;
use crate::error::Result;
use crate::metrics::CpuManagerMetrics;
use crate::policy::Policy;
use crate::pod::{Container, Pod};
use crate::runtime::{ContainerRegistry, ContainerRuntime};
use crate::state::State;
use crate::topology_hints::TopologyHint;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Outcome of one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Container ids whose cpuset was applied.
    pub success: Vec<String>,
    /// Container ids the runtime failed to update.
    pub failure: Vec<String>,
    /// `(pod uid, container name)` of assignments released as stale.
    pub stale_removed: Vec<(String, String)>,
}

pub struct CpuManager {
    policy: Arc<dyn Policy>,
    state: Mutex<Box<dyn State>>,
    registry: RwLock<ContainerRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    metrics: Arc<CpuManagerMetrics>,
    /// container id -> cpuset last pushed through the runtime
    last_applied: Mutex<HashMap<String, CpuSet>>,
    reconcile_period: Duration,
}

impl CpuManager {
    /// Starts the policy against `state` and wraps everything up.
    pub fn new(
        policy: Arc<dyn Policy>,
        mut state: Box<dyn State>,
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<CpuManagerMetrics>,
        reconcile_period: Duration,
    ) -> Result<Self> {
        policy.start(state.as_mut())?;
        tracing::info!(
            "cpu manager started with policy {}, default cpu set {}",
            policy.name(),
            state.get_default_cpu_set()
        );

        // restored assignments stay admitted until their containers re-register
        let mut registry = ContainerRegistry::default();
        for (pod_uid, containers) in state.get_cpu_assignments() {
            for name in containers.keys() {
                registry.admit(&pod_uid, name);
            }
        }

        Ok(Self {
            policy,
            state: Mutex::new(state),
            registry: RwLock::new(registry),
            runtime,
            metrics,
            last_applied: Mutex::new(HashMap::new()),
            reconcile_period,
        })
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<CpuManagerMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Admission: assigns CPUs to the container if it qualifies.
    ///
    /// Lock order everywhere is registry, then state.
    pub async fn allocate(&self, pod: &Pod, container: &Container) -> Result<()> {
        let mut registry = self.registry.write().await;
        let mut state = self.state.lock().await;
        self.policy.allocate(state.as_mut(), pod, container)?;
        registry.admit(&pod.uid, &container.name);
        Ok(())
    }

    /// Registers a started container and pins it right away.
    pub async fn add_container(
        &self,
        pod: &Pod,
        container: &Container,
        container_id: &str,
        pids: Vec<u32>,
    ) -> Result<()> {
        let running = {
            let mut registry = self.registry.write().await;
            registry.add_container(container_id, &pod.uid, &container.name, pids);
            registry.get(container_id).cloned()
        };
        let Some(running) = running else {
            return Ok(());
        };

        let cpus = self
            .state
            .lock()
            .await
            .get_cpu_set_or_default(&pod.uid, &container.name);
        self.runtime.update_container_cpus(&running, &cpus)?;
        self.last_applied
            .lock()
            .await
            .insert(container_id.to_string(), cpus);
        Ok(())
    }

    /// Teardown: releases the container's CPUs and forgets it.
    pub async fn remove_container(&self, pod_uid: &str, container_name: &str) -> Result<()> {
        let ids = {
            let mut registry = self.registry.write().await;
            let mut state = self.state.lock().await;
            self.policy
                .remove_container(state.as_mut(), pod_uid, container_name)?;
            registry.remove_by_identity(pod_uid, container_name)
        };
        let mut last_applied = self.last_applied.lock().await;
        for id in ids {
            last_applied.remove(&id);
        }
        Ok(())
    }

    pub async fn get_topology_hints(&self, pod: &Pod, container: &Container) -> Result<Option<Vec<TopologyHint>>> {
        let snapshot = self.state.lock().await.snapshot();
        self.policy.get_topology_hints(&snapshot, pod, container)
    }

    pub async fn get_pod_topology_hints(&self, pod: &Pod) -> Result<Option<Vec<TopologyHint>>> {
        let snapshot = self.state.lock().await.snapshot();
        self.policy.get_pod_topology_hints(&snapshot, pod)
    }

    /// The container's exclusive CPUs, if any.
    pub async fn get_exclusive_cpus(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.state.lock().await.get_cpu_set(pod_uid, container_name)
    }

    /// The CPUs the container may run on: its exclusive set or the shared pool.
    pub async fn get_cpus(&self, pod_uid: &str, container_name: &str) -> CpuSet {
        self.state
            .lock()
            .await
            .get_cpu_set_or_default(pod_uid, container_name)
    }

    pub async fn get_allocatable_cpus(&self) -> CpuSet {
        let state = self.state.lock().await;
        self.policy.get_allocatable_cpus(state.as_ref())
    }

    /// One reconcile pass:
    /// 1. refreshes the registry and forgets exited containers
    /// 2. releases assignments nobody is running or about to run
    /// 3. pushes each running container's cpuset if it changed
    pub async fn reconcile_state(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let running: Vec<_> = {
            let mut registry = self.registry.write().await;
            let exited = registry.refresh(self.runtime.as_ref());
            if !exited.is_empty() {
                let mut last_applied = self.last_applied.lock().await;
                for container in &exited {
                    last_applied.remove(&container.container_id);
                }
            }

            // both locks stay held so nothing can be admitted in between
            let mut state = self.state.lock().await;
            let stale: Vec<(String, String)> = state
                .get_cpu_assignments()
                .iter()
                .flat_map(|(pod, containers)| containers.keys().map(move |name| (pod.clone(), name.clone())))
                .filter(|(pod, name)| !registry.is_known(pod, name))
                .collect();
            for (pod_uid, name) in stale {
                match self.policy.remove_container(state.as_mut(), &pod_uid, &name) {
                    Ok(()) => {
                        tracing::info!("released stale cpu assignment of {}/{}", pod_uid, name);
                        report.stale_removed.push((pod_uid, name));
                    }
                    Err(e) => {
                        tracing::error!("failed to release stale assignment of {}/{}: {}", pod_uid, name, e);
                    }
                }
            }

            registry.iter().cloned().collect()
        };

        let snapshot = self.state.lock().await.snapshot();
        let mut last_applied = self.last_applied.lock().await;
        for container in running {
            let cpus = snapshot
                .get_cpu_set(&container.pod_uid, &container.container_name)
                .unwrap_or_else(|| snapshot.default_cpu_set.clone());
            if last_applied.get(&container.container_id) == Some(&cpus) {
                continue;
            }

            match self.runtime.update_container_cpus(&container, &cpus) {
                Ok(()) => {
                    tracing::debug!("applied cpus {} to container {}", cpus, container.container_id);
                    last_applied.insert(container.container_id.clone(), cpus);
                    report.success.push(container.container_id);
                }
                Err(e) => {
                    tracing::error!("failed to apply cpus {} to container {}: {}", cpus, container.container_id, e);
                    report.failure.push(container.container_id);
                }
            }
        }

        report
    }

    /// Runs [`CpuManager::reconcile_state`] every reconcile period until the
    /// returned task is aborted.
    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.reconcile_period);
            loop {
                interval.tick().await;
                let report = manager.reconcile_state().await;
                if !report.failure.is_empty() {
                    tracing::warn!(
                        "reconcile pass: {} updated, {} failed, {} stale released",
                        report.success.len(),
                        report.failure.len(),
                        report.stale_removed.len()
                    );
                }
            }
        })
    }
}
