//! # Topology-Aware CPU Assignment
//!
//! Picks `n` CPUs out of an available set, packing whole units first:
//!
//! 1. whole free sockets that fit in what is still needed
//! 2. whole free NUMA nodes
//! 3. whole free uncore caches
//! 4. whole free physical cores
//! 5. single CPUs, preferring partially used cores
//!
//! Within a level, candidates are ranked by how many free CPUs their
//! enclosing groups have (fewest first, so partially used sockets and nodes
//! are filled before untouched ones), then by their own free count, then by
//! id. Every ranking ends in an id comparison, so the result only depends on
//! the inputs.

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::topology::{CpuTopology, TopologyLevel};
use std::collections::BTreeMap;

/// Sort key: `(free cpus, group id)` for each level, outermost first.
type RankKey = Vec<(usize, usize)>;

/// Free-CPU counts per group, one map per level.
type FreeCounts = [BTreeMap<usize, usize>; 4];

struct CpuAccumulator<'a> {
    topo: &'a CpuTopology,
    available: CpuSet,
    needed: usize,
    result: CpuSet,
}

impl<'a> CpuAccumulator<'a> {
    fn new(topo: &'a CpuTopology, available: &CpuSet, num_cpus: usize) -> Self {
        Self {
            topo,
            available: available.intersection(topo.all_cpus()),
            needed: num_cpus,
            result: CpuSet::new(),
        }
    }

    fn take(&mut self, cpus: &CpuSet) {
        self.result = self.result.union(cpus);
        self.available = self.available.difference(cpus);
        self.needed -= cpus.len();
    }

    fn is_satisfied(&self) -> bool {
        self.needed == 0
    }

    fn is_failed(&self) -> bool {
        self.needed > self.available.len()
    }

    fn free_counts(&self) -> FreeCounts {
        let mut counts: FreeCounts = Default::default();
        for cpu in &self.available {
            for level in TopologyLevel::ALL {
                if let Some(id) = self.topo.group_of(cpu, level) {
                    *counts[level.index()].entry(id).or_default() += 1;
                }
            }
        }
        counts
    }

    /// Rank key of the group containing `cpu` at `level`, ancestors first.
    fn rank_key(&self, counts: &FreeCounts, cpu: usize, level: TopologyLevel) -> RankKey {
        let mut key = RankKey::with_capacity(4);
        for l in TopologyLevel::ALL {
            let id = self.topo.group_of(cpu, l).unwrap_or(usize::MAX);
            key.push((counts[l.index()].get(&id).copied().unwrap_or(0), id));
            if l == level {
                break;
            }
        }
        key
    }

    /// Takes every fully free group at `level` that still fits.
    fn take_full_groups(&mut self, level: TopologyLevel) {
        let counts = self.free_counts();
        let level_counts = &counts[level.index()];

        let mut candidates: Vec<(RankKey, usize)> = self
            .topo
            .group_ids(level)
            .filter(|&id| {
                let size = self.topo.group_size(level, id);
                size > 0 && level_counts.get(&id).copied() == Some(size)
            })
            .filter_map(|id| {
                let first = self.topo.cpus_in(level, id).iter().next()?;
                Some((self.rank_key(&counts, first, level), id))
            })
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            if self.is_satisfied() {
                break;
            }
            let cpus = self.topo.cpus_in(level, id);
            if cpus.len() <= self.needed {
                tracing::trace!("taking whole {} {}: cpus {}", level.name(), id, cpus);
                self.take(&cpus);
            }
        }
    }

    /// Takes single CPUs for whatever is left.
    fn take_remaining_cpus(&mut self) {
        let counts = self.free_counts();
        let mut ranked: Vec<(RankKey, usize)> = self
            .available
            .iter()
            .map(|cpu| (self.rank_key(&counts, cpu, TopologyLevel::Core), cpu))
            .collect();
        ranked.sort();

        let picked: CpuSet = ranked
            .into_iter()
            .take(self.needed)
            .map(|(_, cpu)| cpu)
            .collect();
        self.take(&picked);
    }
}

/// Selects exactly `num_cpus` CPUs from `available`.
///
/// CPUs of `available` that are not part of `topo` are ignored. Fails with
/// [`CpuManagerError::InsufficientResources`] before selecting anything when
/// the pool is too small.
pub fn take_by_topology(topo: &CpuTopology, available: &CpuSet, num_cpus: usize) -> Result<CpuSet> {
    let mut acc = CpuAccumulator::new(topo, available, num_cpus);
    let pool = acc.available.len();
    if acc.is_satisfied() {
        return Ok(acc.result);
    }
    if acc.is_failed() {
        return Err(CpuManagerError::InsufficientResources {
            requested: num_cpus,
            available: pool,
        });
    }

    for level in TopologyLevel::ALL {
        acc.take_full_groups(level);
        if acc.is_satisfied() {
            return Ok(acc.result);
        }
    }

    acc.take_remaining_cpus();
    if acc.is_satisfied() {
        return Ok(acc.result);
    }

    Err(CpuManagerError::InsufficientResources {
        requested: num_cpus,
        available: pool,
    })
}

/// CPUs of `available` that sit on cores whose every thread is available.
#[must_use]
pub fn free_core_cpus(topo: &CpuTopology, available: &CpuSet) -> CpuSet {
    topo.groups_spanned(available, TopologyLevel::Core)
        .into_iter()
        .map(|core| topo.cpus_in_core(core))
        .filter(|cpus| cpus.is_subset(available))
        .fold(CpuSet::new(), |acc, cpus| acc.union(&cpus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::presets::topology_for_preset;

    fn set(s: &str) -> CpuSet {
        CpuSet::parse(s).unwrap()
    }

    #[test]
    fn test_zero_request() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        assert!(take_by_topology(&topo, topo.all_cpus(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_single_core_on_socket_zero() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        let got = take_by_topology(&topo, topo.all_cpus(), 2).unwrap();
        assert_eq!(got, set("0,8"));
    }

    #[test]
    fn test_packs_partially_used_socket() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        let available = topo.all_cpus().difference(&set("0,8"));
        let got = take_by_topology(&topo, &available, 2).unwrap();
        assert_eq!(got, set("1,9"));
    }

    #[test]
    fn test_whole_socket_then_core() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        let got = take_by_topology(&topo, topo.all_cpus(), 10).unwrap();
        assert_eq!(got, set("0-4,8-12"));
    }

    #[test]
    fn test_whole_free_socket_beats_partial_one() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        // socket 1 untouched, socket 0 lost core 0
        let available = topo.all_cpus().difference(&set("0,8"));
        let got = take_by_topology(&topo, &available, 8).unwrap();
        assert_eq!(got, set("4-7,12-15"));
    }

    #[test]
    fn test_remainder_prefers_partial_core() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        // cpu 8 (sibling of 0) is gone, so cpu 0 is a stranded thread
        let available = topo.all_cpus().difference(&set("8"));
        let got = take_by_topology(&topo, &available, 1).unwrap();
        assert_eq!(got, set("0"));
    }

    #[test]
    fn test_odd_request_stays_on_socket() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        let got = take_by_topology(&topo, topo.all_cpus(), 3).unwrap();
        assert_eq!(got, set("0-1,8"));
    }

    #[test]
    fn test_uncore_cache_taken_whole() {
        let topo = topology_for_preset("single-socket-multi-ccx-ht").unwrap();
        let got = take_by_topology(&topo, topo.all_cpus(), 8).unwrap();
        assert_eq!(got, topo.cpus_in_uncore_cache(0));
    }

    #[test]
    fn test_numa_node_taken_whole() {
        let topo = topology_for_preset("dual-socket-multi-numa-ht").unwrap();
        let got = take_by_topology(&topo, topo.all_cpus(), 8).unwrap();
        assert_eq!(got, topo.cpus_in_numa_node(0));
    }

    #[test]
    fn test_insufficient() {
        let topo = topology_for_preset("dual-socket-ht").unwrap();
        let err = take_by_topology(&topo, &set("3"), 2).unwrap_err();
        assert!(matches!(
            err,
            CpuManagerError::InsufficientResources {
                requested: 2,
                available: 1
            }
        ));

        // cpus outside the topology do not count as available
        let err = take_by_topology(&topo, &set("3,100-101"), 2).unwrap_err();
        assert!(matches!(
            err,
            CpuManagerError::InsufficientResources {
                requested: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn test_exact_size_subset_and_deterministic() {
        for preset in ["single-socket-ht", "dual-socket-ht", "dual-socket-multi-numa-ht", "single-socket-multi-ccx-ht"] {
            let topo = topology_for_preset(preset).unwrap();
            let available = topo.all_cpus().filter(|cpu| cpu % 3 != 1);
            for n in 0..=available.len() {
                let first = take_by_topology(&topo, &available, n).unwrap();
                assert_eq!(first.len(), n, "{preset} n={n}");
                assert!(first.is_subset(&available), "{preset} n={n}");
                assert_eq!(take_by_topology(&topo, &available, n).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_free_core_cpus() {
        let topo = topology_for_preset("single-socket-ht").unwrap();
        // core 0 = {0,4}, core 1 = {1,5}
        assert_eq!(free_core_cpus(&topo, &set("0,1,4")), set("0,4"));
    }
}
