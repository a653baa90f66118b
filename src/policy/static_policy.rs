//! # Static Policy
//!
//! Gives Guaranteed containers with an integer CPU request exclusive CPUs
//! taken from the shared pool; everything else runs on the shared pool.
//!
//! The reserved set is carved out once at construction and never handed out.
//! At any time: reserved ∪ shared pool ∪ exclusive assignments = all CPUs,
//! with all parts pairwise disjoint.

use super::{AffinityProvider, Policy};
use crate::cpu_assignment::{free_core_cpus, take_by_topology};
use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::metrics::{AlignmentClass, CpuManagerMetrics};
use crate::pod::{Container, Pod};
use crate::state::{State, StateSnapshot};
use crate::topology::CpuTopology;
use crate::topology_hints::{generate_cpu_topology_hints, NumaMask, TopologyHint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const STATIC_POLICY_NAME: &str = "static";

/// Tunables of the static policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticPolicyOptions {
    /// Only hand out whole physical cores; requests that are not a multiple
    /// of the SMT width are rejected.
    pub full_pcpus_only: bool,
    /// Ceiling on the number of exclusively assigned CPUs across the node.
    pub max_exclusive_cpus: Option<usize>,
}

pub struct StaticPolicy {
    topology: Arc<CpuTopology>,
    reserved: CpuSet,
    affinity: Arc<dyn AffinityProvider>,
    options: StaticPolicyOptions,
    metrics: Arc<CpuManagerMetrics>,
}

impl StaticPolicy {
    /// Creates the policy and settles the reserved set.
    ///
    /// An explicit `reserved_cpus` must contain exactly `num_reserved` CPUs of
    /// the topology. Otherwise `num_reserved` CPUs are picked with
    /// [`take_by_topology`] so the reservation is packed onto whole cores.
    pub fn new(
        topology: Arc<CpuTopology>,
        num_reserved: usize,
        reserved_cpus: CpuSet,
        affinity: Arc<dyn AffinityProvider>,
        options: StaticPolicyOptions,
        metrics: Arc<CpuManagerMetrics>,
    ) -> Result<Self> {
        let reserved = if reserved_cpus.is_empty() {
            if num_reserved > topology.num_cpus() {
                return Err(CpuManagerError::Config(format!(
                    "cannot reserve {num_reserved} cpus on a node with {}",
                    topology.num_cpus()
                )));
            }
            take_by_topology(&topology, topology.all_cpus(), num_reserved)?
        } else {
            if reserved_cpus.len() != num_reserved {
                return Err(CpuManagerError::Config(format!(
                    "reserved cpu set {reserved_cpus} has {} cpus, expected {num_reserved}",
                    reserved_cpus.len()
                )));
            }
            if !reserved_cpus.is_subset(topology.all_cpus()) {
                return Err(CpuManagerError::Config(format!(
                    "reserved cpu set {reserved_cpus} is not part of the node's cpus {}",
                    topology.all_cpus()
                )));
            }
            reserved_cpus
        };

        tracing::info!("static policy: reserved cpus {}", reserved);
        Ok(Self {
            topology,
            reserved,
            affinity,
            options,
            metrics,
        })
    }

    #[must_use]
    pub fn reserved_cpus(&self) -> &CpuSet {
        &self.reserved
    }

    #[must_use]
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    fn validate_state(&self, state: &dyn State) -> Result<()> {
        let default = state.get_default_cpu_set();
        let assignments = state.get_cpu_assignments();

        if !self.reserved.is_disjoint(&default) {
            return Err(CpuManagerError::IncompatibleTopology(format!(
                "default cpu set {default} overlaps reserved cpus {}",
                self.reserved
            )));
        }

        let mut seen = self.reserved.union(&default);
        for (pod_uid, containers) in &assignments {
            for (name, cpus) in containers {
                if !cpus.is_disjoint(&seen) {
                    return Err(CpuManagerError::IncompatibleTopology(format!(
                        "cpus {cpus} of container {pod_uid}/{name} overlap the default pool, \
                         the reserved set or another assignment"
                    )));
                }
                seen = seen.union(cpus);
            }
        }

        if &seen != self.topology.all_cpus() {
            return Err(CpuManagerError::IncompatibleTopology(format!(
                "restored cpus {seen} do not match the node's cpus {}",
                self.topology.all_cpus()
            )));
        }
        Ok(())
    }

    fn update_gauges(&self, state: &dyn State) {
        let snapshot = state.snapshot();
        self.metrics
            .update_pool_sizes(snapshot.default_cpu_set.len(), snapshot.assigned_cpus().len());
    }

    /// The pool exclusive CPUs are drawn from, narrowed to free whole cores
    /// when only full physical cores may be handed out.
    fn assignable_pool(&self, available: &CpuSet) -> CpuSet {
        if self.options.full_pcpus_only {
            free_core_cpus(&self.topology, available)
        } else {
            available.clone()
        }
    }

    fn check_smt_alignment(&self, available: &CpuSet, num_cpus: usize) -> Result<()> {
        let cpus_per_core = self.topology.cpus_per_core();
        let available_physical_cpus = free_core_cpus(&self.topology, available).len();
        if num_cpus % cpus_per_core != 0 || num_cpus > available_physical_cpus {
            return Err(CpuManagerError::SmtAlignment {
                requested: num_cpus,
                cpus_per_core,
                available_physical_cpus,
            });
        }
        Ok(())
    }

    fn check_exclusive_limit(&self, state: &dyn State, num_cpus: usize) -> Result<()> {
        let Some(limit) = self.options.max_exclusive_cpus else {
            return Ok(());
        };
        let in_use = state.snapshot().assigned_cpus().len();
        if in_use + num_cpus > limit {
            return Err(CpuManagerError::PolicyLimitExceeded {
                requested: num_cpus,
                in_use,
                limit,
            });
        }
        Ok(())
    }

    /// Picks `num_cpus` from `available`, starting inside the NUMA nodes of
    /// `numa_affinity` and spilling over to the rest of the pool if needed.
    fn take_cpus(&self, available: &CpuSet, num_cpus: usize, numa_affinity: Option<&NumaMask>) -> Result<CpuSet> {
        if available.len() < num_cpus {
            return Err(CpuManagerError::InsufficientResources {
                requested: num_cpus,
                available: available.len(),
            });
        }

        let mut result = CpuSet::new();
        if let Some(mask) = numa_affinity {
            let aligned = available.intersection(&self.topology.cpus_in_numa_nodes(mask.nodes().iter().copied()));
            let n = num_cpus.min(aligned.len());
            result = take_by_topology(&self.topology, &aligned, n)?;
        }

        let rest = take_by_topology(
            &self.topology,
            &available.difference(&result),
            num_cpus - result.len(),
        )?;
        Ok(result.union(&rest))
    }

    fn allocate_exclusive(&self, state: &mut dyn State, pod: &Pod, container: &Container, num_cpus: usize) -> Result<()> {
        let available = self.get_allocatable_cpus(state);
        if self.options.full_pcpus_only {
            self.check_smt_alignment(&available, num_cpus)?;
        }
        self.check_exclusive_limit(state, num_cpus)?;

        let numa_affinity = self.affinity.get_affinity(&pod.uid, &container.name);
        let cpus = self.take_cpus(&self.assignable_pool(&available), num_cpus, numa_affinity.as_ref())?;

        let new_default = state.get_default_cpu_set().difference(&cpus);
        state.commit_allocation(&pod.uid, &container.name, cpus.clone(), new_default)?;

        let class = AlignmentClass::classify(&self.topology, &cpus);
        self.metrics.record_alignment(class);
        self.update_gauges(state);

        tracing::info!(
            "static policy: allocated cpus {} to {} container {} (affinity {}, alignment {})",
            cpus,
            pod.display_name(),
            container.name,
            numa_affinity.map_or_else(|| "none".to_string(), |m| m.to_string()),
            class.label()
        );
        Ok(())
    }

    fn hints_for(&self, available: &CpuSet, reusable: &CpuSet, request: usize) -> Result<Vec<TopologyHint>> {
        generate_cpu_topology_hints(
            &self.topology,
            &self.assignable_pool(available),
            &self.assignable_pool(reusable),
            request,
        )
    }
}

impl Policy for StaticPolicy {
    fn name(&self) -> &'static str {
        STATIC_POLICY_NAME
    }

    fn start(&self, state: &mut dyn State) -> Result<()> {
        if state.get_default_cpu_set().is_empty() && state.get_cpu_assignments().is_empty() {
            let default = self.topology.all_cpus().difference(&self.reserved);
            tracing::info!("static policy: initialising default cpu set {}", default);
            state.set_default_cpu_set(default)?;
        } else {
            self.validate_state(state)?;
        }
        self.update_gauges(state);
        Ok(())
    }

    fn allocate(&self, state: &mut dyn State, pod: &Pod, container: &Container) -> Result<()> {
        let num_cpus = pod.guaranteed_cpus(container);
        if num_cpus == 0 {
            return Ok(());
        }
        if let Some(cpus) = state.get_cpu_set(&pod.uid, &container.name) {
            tracing::debug!(
                "static policy: container {} of {} already has cpus {}",
                container.name,
                pod.display_name(),
                cpus
            );
            return Ok(());
        }

        self.metrics.record_pinning_request();
        let result = self.allocate_exclusive(state, pod, container, num_cpus);
        if let Err(e) = &result {
            self.metrics.record_pinning_error();
            tracing::warn!(
                "static policy: unable to allocate {} cpus to {} container {}: {}",
                num_cpus,
                pod.display_name(),
                container.name,
                e
            );
        }
        result
    }

    fn remove_container(&self, state: &mut dyn State, pod_uid: &str, container_name: &str) -> Result<()> {
        let Some(cpus) = state.get_cpu_set(pod_uid, container_name) else {
            return Ok(());
        };
        let new_default = state
            .get_default_cpu_set()
            .union(&cpus.difference(&self.reserved));
        state.commit_release(pod_uid, container_name, new_default)?;
        self.update_gauges(state);
        tracing::info!(
            "static policy: released cpus {} of container {}/{}",
            cpus,
            pod_uid,
            container_name
        );
        Ok(())
    }

    fn get_topology_hints(
        &self,
        state: &StateSnapshot,
        pod: &Pod,
        container: &Container,
    ) -> Result<Option<Vec<TopologyHint>>> {
        let request = pod.guaranteed_cpus(container);
        if request == 0 {
            return Ok(None);
        }

        if let Some(allocated) = state.get_cpu_set(&pod.uid, &container.name) {
            if allocated.len() != request {
                tracing::warn!(
                    "static policy: container {} of {} holds {} cpus but requests {}, no hints",
                    container.name,
                    pod.display_name(),
                    allocated.len(),
                    request
                );
                return Ok(Some(Vec::new()));
            }
            return self.hints_for(&CpuSet::new(), &allocated, request).map(Some);
        }

        let available = state.default_cpu_set.difference(&self.reserved);
        self.hints_for(&available, &CpuSet::new(), request).map(Some)
    }

    fn get_pod_topology_hints(&self, state: &StateSnapshot, pod: &Pod) -> Result<Option<Vec<TopologyHint>>> {
        let request = pod.pod_guaranteed_cpus();
        if request == 0 {
            return Ok(None);
        }

        // CPUs already held by this pod's containers count as usable.
        let reusable = state
            .assignments
            .get(&pod.uid)
            .map(|containers| CpuSet::new().union_all(containers.values()))
            .unwrap_or_default();
        let available = state.default_cpu_set.difference(&self.reserved);
        self.hints_for(&available, &reusable, request).map(Some)
    }

    fn get_allocatable_cpus(&self, state: &dyn State) -> CpuSet {
        state.get_default_cpu_set().difference(&self.reserved)
    }
}
