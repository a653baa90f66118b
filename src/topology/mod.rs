//! # CPU Topology
//!
//! Read-only description of the node's logical CPUs and their containment
//! hierarchy:
//!
//! ```text
//! socket ─┬─ NUMA node ─┬─ uncore cache ─┬─ core ─┬─ cpu (thread)
//!         │             │                │        └─ cpu (sibling)
//!         │             │                └─ core ...
//!         │             └─ uncore cache ...
//!         └─ NUMA node ...
//! ```
//!
//! Containment is a strict tree: a core never straddles two cache domains, a
//! cache domain never straddles two NUMA nodes and a NUMA node never straddles
//! two sockets. [`CpuTopology::new`] rejects anything else.
//!
//! Topologies come from three places:
//! - [`discovery::discover`] reads Linux sysfs
//! - [`presets`] builds one of the embedded named layouts
//! - [`CpuTopology::new`] takes raw per-CPU records

pub mod discovery;
pub mod presets;

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A level of the containment tree, largest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TopologyLevel {
    Socket,
    NumaNode,
    UncoreCache,
    Core,
}

impl TopologyLevel {
    /// All levels from the largest unit down to the physical core.
    pub const ALL: [TopologyLevel; 4] = [
        TopologyLevel::Socket,
        TopologyLevel::NumaNode,
        TopologyLevel::UncoreCache,
        TopologyLevel::Core,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// The enclosing levels, largest first.
    #[must_use]
    pub fn ancestors(self) -> &'static [TopologyLevel] {
        use TopologyLevel::*;
        match self {
            Socket => &[],
            NumaNode => &[Socket],
            UncoreCache => &[Socket, NumaNode],
            Core => &[Socket, NumaNode, UncoreCache],
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TopologyLevel::Socket => "socket",
            TopologyLevel::NumaNode => "numa node",
            TopologyLevel::UncoreCache => "uncore cache",
            TopologyLevel::Core => "core",
        }
    }
}

/// Hardware placement of one logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub socket_id: usize,
    pub numa_node_id: usize,
    pub uncore_cache_id: usize,
    pub core_id: usize,
}

impl CpuInfo {
    /// Id of the group this CPU belongs to at `level`.
    #[must_use]
    pub fn id_at(&self, level: TopologyLevel) -> usize {
        match level {
            TopologyLevel::Socket => self.socket_id,
            TopologyLevel::NumaNode => self.numa_node_id,
            TopologyLevel::UncoreCache => self.uncore_cache_id,
            TopologyLevel::Core => self.core_id,
        }
    }
}

/// Shape summary recorded alongside durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyFingerprint {
    pub cpus: usize,
    pub cores: usize,
    pub uncore_caches: usize,
    pub numa_nodes: usize,
    pub sockets: usize,
}

impl fmt::Display for TopologyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpus={},cores={},uncore={},numa={},sockets={}",
            self.cpus, self.cores, self.uncore_caches, self.numa_nodes, self.sockets
        )
    }
}

/// Immutable CPU topology of the node.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    cpu_details: BTreeMap<usize, CpuInfo>,
    /// Per level (indexed by `TopologyLevel::index`): group id -> member CPUs.
    groups: [BTreeMap<usize, CpuSet>; 4],
    all_cpus: CpuSet,
}

impl CpuTopology {
    /// Builds the containment tree from raw per-CPU records.
    ///
    /// Fails with [`CpuManagerError::TopologyInconsistent`] on an empty input,
    /// a duplicated CPU id, or a group that is split across two parents.
    pub fn new<I>(cpus: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, CpuInfo)>,
    {
        let mut cpu_details = BTreeMap::new();
        for (cpu, info) in cpus {
            if cpu_details.insert(cpu, info).is_some() {
                return Err(CpuManagerError::TopologyInconsistent(format!(
                    "cpu {cpu} listed more than once"
                )));
            }
        }
        if cpu_details.is_empty() {
            return Err(CpuManagerError::TopologyInconsistent(
                "topology has no cpus".to_string(),
            ));
        }

        // child level -> (child id -> parent id)
        let mut parents: [BTreeMap<usize, usize>; 4] = Default::default();
        let mut groups: [BTreeMap<usize, BTreeSet<usize>>; 4] = Default::default();

        for (&cpu, info) in &cpu_details {
            for level in TopologyLevel::ALL {
                groups[level.index()]
                    .entry(info.id_at(level))
                    .or_default()
                    .insert(cpu);

                let Some(&parent_level) = level.ancestors().last() else {
                    continue;
                };
                let child = info.id_at(level);
                let parent = info.id_at(parent_level);
                match parents[level.index()].insert(child, parent) {
                    Some(previous) if previous != parent => {
                        return Err(CpuManagerError::TopologyInconsistent(format!(
                            "{} {child} belongs to {} {previous} and {} {parent}",
                            level.name(),
                            parent_level.name(),
                            parent_level.name(),
                        )));
                    }
                    _ => {}
                }
            }
        }

        let groups: [BTreeMap<usize, CpuSet>; 4] = groups.map(|level_groups| {
            level_groups
                .into_iter()
                .map(|(id, cpus)| (id, cpus.into_iter().collect()))
                .collect()
        });
        let all_cpus = cpu_details.keys().copied().collect();

        Ok(Self {
            cpu_details,
            groups,
            all_cpus,
        })
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.cpu_details.len()
    }

    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.num_groups(TopologyLevel::Core)
    }

    #[must_use]
    pub fn num_uncore_caches(&self) -> usize {
        self.num_groups(TopologyLevel::UncoreCache)
    }

    #[must_use]
    pub fn num_numa_nodes(&self) -> usize {
        self.num_groups(TopologyLevel::NumaNode)
    }

    #[must_use]
    pub fn num_sockets(&self) -> usize {
        self.num_groups(TopologyLevel::Socket)
    }

    /// Number of groups at `level`.
    #[must_use]
    pub fn num_groups(&self, level: TopologyLevel) -> usize {
        self.groups[level.index()].len()
    }

    /// SMT width: the largest number of threads found on one core.
    #[must_use]
    pub fn cpus_per_core(&self) -> usize {
        self.groups[TopologyLevel::Core.index()]
            .values()
            .map(CpuSet::len)
            .max()
            .unwrap_or(1)
    }

    #[must_use]
    pub fn cpu_info(&self, cpu: usize) -> Option<&CpuInfo> {
        self.cpu_details.get(&cpu)
    }

    /// The group containing `cpu` at `level`, if the CPU exists.
    #[must_use]
    pub fn group_of(&self, cpu: usize, level: TopologyLevel) -> Option<usize> {
        self.cpu_details.get(&cpu).map(|info| info.id_at(level))
    }

    /// Group ids present at `level`, ascending.
    pub fn group_ids(&self, level: TopologyLevel) -> impl Iterator<Item = usize> + '_ {
        self.groups[level.index()].keys().copied()
    }

    /// CPUs of group `id` at `level`; empty if there is no such group.
    #[must_use]
    pub fn cpus_in(&self, level: TopologyLevel, id: usize) -> CpuSet {
        self.groups[level.index()]
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Size of group `id` at `level`.
    #[must_use]
    pub fn group_size(&self, level: TopologyLevel, id: usize) -> usize {
        self.groups[level.index()].get(&id).map_or(0, CpuSet::len)
    }

    #[must_use]
    pub fn cpus_in_core(&self, core_id: usize) -> CpuSet {
        self.cpus_in(TopologyLevel::Core, core_id)
    }

    #[must_use]
    pub fn cpus_in_uncore_cache(&self, uncore_id: usize) -> CpuSet {
        self.cpus_in(TopologyLevel::UncoreCache, uncore_id)
    }

    #[must_use]
    pub fn cpus_in_numa_node(&self, node: usize) -> CpuSet {
        self.cpus_in(TopologyLevel::NumaNode, node)
    }

    #[must_use]
    pub fn cpus_in_socket(&self, socket: usize) -> CpuSet {
        self.cpus_in(TopologyLevel::Socket, socket)
    }

    /// CPUs of every listed NUMA node.
    #[must_use]
    pub fn cpus_in_numa_nodes<I: IntoIterator<Item = usize>>(&self, nodes: I) -> CpuSet {
        nodes
            .into_iter()
            .flat_map(|node| self.cpus_in_numa_node(node).to_vec())
            .collect()
    }

    /// Every CPU of the node.
    #[must_use]
    pub fn all_cpus(&self) -> &CpuSet {
        &self.all_cpus
    }

    /// Distinct groups at `level` touched by `cpus`. Unknown CPUs are ignored.
    #[must_use]
    pub fn groups_spanned(&self, cpus: &CpuSet, level: TopologyLevel) -> BTreeSet<usize> {
        cpus.iter()
            .filter_map(|cpu| self.group_of(cpu, level))
            .collect()
    }

    /// True if `cpus` is made only of complete physical cores.
    #[must_use]
    pub fn is_whole_cores(&self, cpus: &CpuSet) -> bool {
        !cpus.is_empty()
            && self
                .groups_spanned(cpus, TopologyLevel::Core)
                .into_iter()
                .all(|core| self.cpus_in_core(core).is_subset(cpus))
    }

    #[must_use]
    pub fn fingerprint(&self) -> TopologyFingerprint {
        TopologyFingerprint {
            cpus: self.num_cpus(),
            cores: self.num_cores(),
            uncore_caches: self.num_uncore_caches(),
            numa_nodes: self.num_numa_nodes(),
            sockets: self.num_sockets(),
        }
    }

    /// Log the topology for debugging.
    pub fn log_topology(&self) {
        tracing::info!("CPU topology: {}", self.fingerprint());
        for socket in self.group_ids(TopologyLevel::Socket) {
            for node in self.group_ids(TopologyLevel::NumaNode) {
                let cpus = self.cpus_in_numa_node(node);
                if cpus.filter_by_topology(self, TopologyLevel::Socket, socket).is_empty() {
                    continue;
                }
                tracing::info!("  socket {} / numa node {}: cpus {}", socket, node, cpus);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(socket_id: usize, numa_node_id: usize, uncore_cache_id: usize, core_id: usize) -> CpuInfo {
        CpuInfo {
            socket_id,
            numa_node_id,
            uncore_cache_id,
            core_id,
        }
    }

    /// 2 sockets x 2 cores x 2 threads, sibling of cpu N is N + 4.
    fn small_dual_socket() -> CpuTopology {
        CpuTopology::new((0..8).map(|cpu| {
            let core = cpu % 4;
            let socket = core / 2;
            (cpu, info(socket, socket, socket, core))
        }))
        .unwrap()
    }

    #[test]
    fn test_counts() {
        let topo = small_dual_socket();
        assert_eq!(topo.num_cpus(), 8);
        assert_eq!(topo.num_cores(), 4);
        assert_eq!(topo.num_uncore_caches(), 2);
        assert_eq!(topo.num_numa_nodes(), 2);
        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.cpus_per_core(), 2);
        assert_eq!(
            topo.fingerprint().to_string(),
            "cpus=8,cores=4,uncore=2,numa=2,sockets=2"
        );
    }

    #[test]
    fn test_group_queries() {
        let topo = small_dual_socket();
        assert_eq!(topo.cpus_in_core(1), CpuSet::from_cpus([1, 5]));
        assert_eq!(topo.cpus_in_socket(1), CpuSet::from_cpus([2, 3, 6, 7]));
        assert_eq!(topo.cpus_in_numa_nodes([0, 1]), *topo.all_cpus());
        assert_eq!(topo.group_of(6, TopologyLevel::Core), Some(2));
        assert_eq!(topo.group_of(99, TopologyLevel::Core), None);
        assert!(topo.cpus_in_core(42).is_empty());
        assert_eq!(
            topo.all_cpus().filter_by_topology(&topo, TopologyLevel::NumaNode, 0),
            CpuSet::from_cpus([0, 1, 4, 5])
        );
    }

    #[test]
    fn test_whole_cores() {
        let topo = small_dual_socket();
        assert!(topo.is_whole_cores(&CpuSet::from_cpus([0, 4])));
        assert!(topo.is_whole_cores(&CpuSet::from_cpus([0, 4, 1, 5])));
        assert!(!topo.is_whole_cores(&CpuSet::from_cpus([0, 1])));
        assert!(!topo.is_whole_cores(&CpuSet::new()));
    }

    #[test]
    fn test_core_split_across_sockets_rejected() {
        let err = CpuTopology::new(vec![(0, info(0, 0, 0, 0)), (1, info(1, 1, 1, 0))]).unwrap_err();
        assert!(matches!(err, CpuManagerError::TopologyInconsistent(_)));
    }

    #[test]
    fn test_numa_node_split_across_sockets_rejected() {
        let err = CpuTopology::new(vec![(0, info(0, 0, 0, 0)), (1, info(1, 0, 1, 1))]).unwrap_err();
        assert!(matches!(err, CpuManagerError::TopologyInconsistent(_)));
    }

    #[test]
    fn test_duplicate_and_empty_rejected() {
        assert!(CpuTopology::new(vec![(0, info(0, 0, 0, 0)), (0, info(0, 0, 0, 0))]).is_err());
        assert!(CpuTopology::new(Vec::new()).is_err());
    }
}
