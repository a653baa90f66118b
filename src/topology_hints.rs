//! # Topology Hints
//!
//! Candidate NUMA placements offered to the cross-resource topology
//! coordinator before it settles on an affinity for a container.

use crate::cpu_assignment::take_by_topology;
use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::topology::{CpuTopology, TopologyLevel};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hint enumeration walks every combination of NUMA nodes, so it is capped.
pub const MAX_NUMA_NODES: usize = 8;

/// A set of NUMA node ids, kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NumaMask {
    nodes: Vec<usize>,
}

impl NumaMask {
    pub fn from_nodes<I: IntoIterator<Item = usize>>(nodes: I) -> Self {
        let mut nodes: Vec<usize> = nodes.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();
        Self { nodes }
    }

    #[must_use]
    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn contains(&self, node: usize) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for NumaMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.nodes.iter().join(","))
    }
}

/// One candidate placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyHint {
    /// NUMA nodes the placement is confined to.
    pub numa_affinity: NumaMask,
    /// The CPUs that would be picked inside those nodes.
    pub cpus: CpuSet,
    /// True if the mask spans the fewest NUMA nodes able to hold the request.
    pub preferred: bool,
}

/// Enumerates NUMA-aligned candidates for a request of `request` CPUs.
///
/// Masks are visited by size, then lexicographically. `preferred` is decided
/// against the smallest mask whose *total* CPUs could hold the request, so a
/// busy node does not make a wider mask look preferred.
pub fn generate_cpu_topology_hints(
    topo: &CpuTopology,
    available: &CpuSet,
    reusable: &CpuSet,
    request: usize,
) -> Result<Vec<TopologyHint>> {
    let numa_nodes: Vec<usize> = topo.group_ids(TopologyLevel::NumaNode).collect();
    if numa_nodes.len() > MAX_NUMA_NODES {
        return Err(CpuManagerError::TooManyNumaNodes {
            found: numa_nodes.len(),
            max: MAX_NUMA_NODES,
        });
    }

    let candidates = available.union(reusable);
    let mut min_affinity_size = numa_nodes.len();
    let mut hints = Vec::new();

    for size in 1..=numa_nodes.len() {
        for combo in numa_nodes.iter().copied().combinations(size) {
            let mask = NumaMask::from_nodes(combo);
            let mask_cpus = topo.cpus_in_numa_nodes(mask.nodes().iter().copied());

            if mask_cpus.len() >= request && mask.count() < min_affinity_size {
                min_affinity_size = mask.count();
            }

            let usable = candidates.intersection(&mask_cpus);
            if usable.len() < request {
                continue;
            }

            let cpus = take_by_topology(topo, &usable, request)?;
            hints.push(TopologyHint {
                numa_affinity: mask,
                cpus,
                preferred: false,
            });
        }
    }

    for hint in &mut hints {
        hint.preferred = hint.numa_affinity.count() == min_affinity_size;
    }

    tracing::debug!(
        "generated {} topology hints for {} cpus (min affinity size {})",
        hints.len(),
        request,
        min_affinity_size
    );
    Ok(hints)
}
