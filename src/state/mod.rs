//! # Allocation State
//!
//! The container → CPU assignment table plus the default (shared) pool.
//!
//! [`State`] is the interface the policy works against. Allocation and
//! release are single compound mutations ([`State::commit_allocation`],
//! [`State::commit_release`]) so a durable implementation can persist the
//! table and the pool together.

mod checkpoint;

pub use checkpoint::{
    CheckpointState, CheckpointStore, CpuManagerCheckpoint, FileCheckpointStore,
    CHECKPOINT_VERSION,
};

use crate::cpuset::CpuSet;
use crate::error::Result;
use std::collections::BTreeMap;

/// pod uid -> container name -> exclusively assigned CPUs.
pub type ContainerCpuAssignments = BTreeMap<String, BTreeMap<String, CpuSet>>;

/// A copy of the whole state, also used as the in-memory representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub assignments: ContainerCpuAssignments,
    pub default_cpu_set: CpuSet,
}

impl StateSnapshot {
    #[must_use]
    pub fn get_cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.assignments
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name))
            .cloned()
    }

    /// Union of every exclusive assignment.
    #[must_use]
    pub fn assigned_cpus(&self) -> CpuSet {
        CpuSet::new().union_all(self.assignments.values().flat_map(BTreeMap::values))
    }

    fn set_cpu_set(&mut self, pod_uid: &str, container_name: &str, cpus: CpuSet) {
        self.assignments
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), cpus);
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) {
        if let Some(containers) = self.assignments.get_mut(pod_uid) {
            containers.remove(container_name);
            if containers.is_empty() {
                self.assignments.remove(pod_uid);
            }
        }
    }
}

/// Read and write access to the allocation state.
pub trait State: Send {
    fn get_cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet>;

    fn get_default_cpu_set(&self) -> CpuSet;

    fn get_cpu_assignments(&self) -> ContainerCpuAssignments;

    /// The container's exclusive CPUs, or the shared pool if it has none.
    fn get_cpu_set_or_default(&self, pod_uid: &str, container_name: &str) -> CpuSet {
        self.get_cpu_set(pod_uid, container_name)
            .unwrap_or_else(|| self.get_default_cpu_set())
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            assignments: self.get_cpu_assignments(),
            default_cpu_set: self.get_default_cpu_set(),
        }
    }

    fn set_cpu_set(&mut self, pod_uid: &str, container_name: &str, cpus: CpuSet) -> Result<()>;

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<()>;

    fn set_cpu_assignments(&mut self, assignments: ContainerCpuAssignments) -> Result<()>;

    fn delete(&mut self, pod_uid: &str, container_name: &str) -> Result<()>;

    fn clear_state(&mut self) -> Result<()>;

    /// Records `cpus` for the container and replaces the default pool, as one update.
    fn commit_allocation(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
        default_cpu_set: CpuSet,
    ) -> Result<()>;

    /// Drops the container's assignment and replaces the default pool, as one update.
    fn commit_release(&mut self, pod_uid: &str, container_name: &str, default_cpu_set: CpuSet) -> Result<()>;
}

/// Volatile state; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryState {
    data: StateSnapshot,
}

impl MemoryState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from pre-populated contents.
    #[must_use]
    pub fn with_contents(assignments: ContainerCpuAssignments, default_cpu_set: CpuSet) -> Self {
        Self {
            data: StateSnapshot {
                assignments,
                default_cpu_set,
            },
        }
    }
}

impl State for MemoryState {
    fn get_cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.data.get_cpu_set(pod_uid, container_name)
    }

    fn get_default_cpu_set(&self) -> CpuSet {
        self.data.default_cpu_set.clone()
    }

    fn get_cpu_assignments(&self) -> ContainerCpuAssignments {
        self.data.assignments.clone()
    }

    fn set_cpu_set(&mut self, pod_uid: &str, container_name: &str, cpus: CpuSet) -> Result<()> {
        self.data.set_cpu_set(pod_uid, container_name, cpus);
        Ok(())
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<()> {
        self.data.default_cpu_set = cpus;
        Ok(())
    }

    fn set_cpu_assignments(&mut self, assignments: ContainerCpuAssignments) -> Result<()> {
        self.data.assignments = assignments;
        Ok(())
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) -> Result<()> {
        self.data.delete(pod_uid, container_name);
        Ok(())
    }

    fn clear_state(&mut self) -> Result<()> {
        self.data = StateSnapshot::default();
        Ok(())
    }

    fn commit_allocation(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
        default_cpu_set: CpuSet,
    ) -> Result<()> {
        self.data.set_cpu_set(pod_uid, container_name, cpus);
        self.data.default_cpu_set = default_cpu_set;
        Ok(())
    }

    fn commit_release(&mut self, pod_uid: &str, container_name: &str, default_cpu_set: CpuSet) -> Result<()> {
        self.data.delete(pod_uid, container_name);
        self.data.default_cpu_set = default_cpu_set;
        Ok(())
    }
}
