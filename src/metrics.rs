//! # CPU Manager Metrics
//!
//! Counters and gauges kept in-process (so callers and tests can read them
//! back) and mirrored to the `metrics` facade for whatever recorder the host
//! process installs.

use crate::cpuset::CpuSet;
use crate::topology::{CpuTopology, TopologyLevel};
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};

/// `scope` label of the alignment counter for per-container allocations.
pub const ALIGN_SCOPE_CONTAINER: &str = "container";

pub const ALIGNED_RESOURCES_METRIC: &str = "cpu_manager_aligned_resources_total";
pub const PINNING_REQUESTS_METRIC: &str = "cpu_manager_pinning_requests_total";
pub const PINNING_ERRORS_METRIC: &str = "cpu_manager_pinning_errors_total";
pub const SHARED_POOL_SIZE_METRIC: &str = "cpu_manager_shared_pool_size_cpus";
pub const EXCLUSIVE_CPUS_METRIC: &str = "cpu_manager_exclusive_cpus_allocated";

/// Tightest hardware boundary an allocation fits inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignmentClass {
    PhysicalCpu,
    UncoreCache,
    NumaNode,
    Socket,
    Unaligned,
}

impl AlignmentClass {
    pub const ALL: [AlignmentClass; 5] = [
        AlignmentClass::PhysicalCpu,
        AlignmentClass::UncoreCache,
        AlignmentClass::NumaNode,
        AlignmentClass::Socket,
        AlignmentClass::Unaligned,
    ];

    /// `boundary` label value.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            AlignmentClass::PhysicalCpu => "physical_cpu",
            AlignmentClass::UncoreCache => "uncore_cache",
            AlignmentClass::NumaNode => "numa_node",
            AlignmentClass::Socket => "socket",
            AlignmentClass::Unaligned => "unaligned",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Classifies `cpus`: whole cores first, then the smallest single
    /// enclosing cache domain, NUMA node or socket.
    #[must_use]
    pub fn classify(topo: &CpuTopology, cpus: &CpuSet) -> Self {
        if topo.is_whole_cores(cpus) {
            return AlignmentClass::PhysicalCpu;
        }
        let within_one = |level| topo.groups_spanned(cpus, level).len() == 1;
        if within_one(TopologyLevel::UncoreCache) {
            AlignmentClass::UncoreCache
        } else if within_one(TopologyLevel::NumaNode) {
            AlignmentClass::NumaNode
        } else if within_one(TopologyLevel::Socket) {
            AlignmentClass::Socket
        } else {
            AlignmentClass::Unaligned
        }
    }
}

/// Metric values owned by one CPU manager instance.
#[derive(Debug, Default)]
pub struct CpuManagerMetrics {
    aligned: [AtomicU64; 5],
    pinning_requests: AtomicU64,
    pinning_errors: AtomicU64,
    shared_pool_size: AtomicU64,
    exclusive_cpus: AtomicU64,
}

impl CpuManagerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one successful allocation under its alignment class.
    pub fn record_alignment(&self, class: AlignmentClass) {
        self.aligned[class.index()].fetch_add(1, Ordering::Relaxed);
        counter!(
            ALIGNED_RESOURCES_METRIC,
            "scope" => ALIGN_SCOPE_CONTAINER,
            "boundary" => class.label()
        )
        .increment(1);
    }

    #[must_use]
    pub fn aligned_count(&self, class: AlignmentClass) -> u64 {
        self.aligned[class.index()].load(Ordering::Relaxed)
    }

    pub fn record_pinning_request(&self) {
        self.pinning_requests.fetch_add(1, Ordering::Relaxed);
        counter!(PINNING_REQUESTS_METRIC).increment(1);
    }

    pub fn record_pinning_error(&self) {
        self.pinning_errors.fetch_add(1, Ordering::Relaxed);
        counter!(PINNING_ERRORS_METRIC).increment(1);
    }

    #[must_use]
    pub fn pinning_requests(&self) -> u64 {
        self.pinning_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pinning_errors(&self) -> u64 {
        self.pinning_errors.load(Ordering::Relaxed)
    }

    /// Publishes the current shared pool and exclusive CPU totals.
    pub fn update_pool_sizes(&self, shared_pool: usize, exclusive: usize) {
        self.shared_pool_size.store(shared_pool as u64, Ordering::Relaxed);
        self.exclusive_cpus.store(exclusive as u64, Ordering::Relaxed);
        gauge!(SHARED_POOL_SIZE_METRIC).set(shared_pool as f64);
        gauge!(EXCLUSIVE_CPUS_METRIC).set(exclusive as f64);
    }

    #[must_use]
    pub fn shared_pool_size(&self) -> u64 {
        self.shared_pool_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn exclusive_cpus(&self) -> u64 {
        self.exclusive_cpus.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::presets::topology_for_preset;

    fn set(s: &str) -> CpuSet {
        CpuSet::parse(s).unwrap()
    }

    #[test]
    fn test_classify() {
        let topo = topology_for_preset("dual-socket-multi-numa-ht").unwrap();
        assert_eq!(AlignmentClass::classify(&topo, &set("0,16")), AlignmentClass::PhysicalCpu);
        assert_eq!(AlignmentClass::classify(&topo, &set("0-1")), AlignmentClass::UncoreCache);
        assert_eq!(AlignmentClass::classify(&topo, &set("0,31")), AlignmentClass::Unaligned);

        let topo = topology_for_preset("dual-socket-ht").unwrap();
        assert_eq!(AlignmentClass::classify(&topo, &set("0-1")), AlignmentClass::UncoreCache);
        assert_eq!(AlignmentClass::classify(&topo, &set("0,4")), AlignmentClass::Unaligned);
    }

    #[test]
    fn test_counters() {
        let m = CpuManagerMetrics::new();
        m.record_alignment(AlignmentClass::PhysicalCpu);
        m.record_alignment(AlignmentClass::PhysicalCpu);
        m.record_alignment(AlignmentClass::Socket);
        m.record_pinning_request();
        m.record_pinning_error();
        m.update_pool_sizes(12, 4);

        assert_eq!(m.aligned_count(AlignmentClass::PhysicalCpu), 2);
        assert_eq!(m.aligned_count(AlignmentClass::Socket), 1);
        assert_eq!(m.aligned_count(AlignmentClass::Unaligned), 0);
        assert_eq!(m.pinning_requests(), 1);
        assert_eq!(m.pinning_errors(), 1);
        assert_eq!((m.shared_pool_size(), m.exclusive_cpus()), (12, 4));
    }

    #[test]
    fn test_labels() {
        let labels: Vec<_> = AlignmentClass::ALL.iter().map(|c| c.label()).collect();
        assert_eq!(labels, ["physical_cpu", "uncore_cache", "numa_node", "socket", "unaligned"]);
    }
}
