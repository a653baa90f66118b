//! # Topology Discovery
//!
//! Builds a [`CpuTopology`] from Linux sysfs:
//! - `devices/system/cpu/online` for the online CPU list
//! - `devices/system/cpu/cpuN/topology/{physical_package_id,core_id}`
//! - `devices/system/cpu/cpuN/cache/index3/id` for the last-level cache
//! - `devices/system/node/nodeN/cpulist` for NUMA membership
//!
//! Falls back to a single-socket, no-SMT topology sized by `num_cpus` when
//! sysfs is unavailable.

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::topology::{CpuInfo, CpuTopology};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

static CPU_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^cpu(\d+)$").expect("cpu dir pattern is valid"));
static NODE_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^node(\d+)$").expect("node dir pattern is valid"));

/// Per-CPU ids exactly as sysfs reports them.
#[derive(Debug, Clone, Copy)]
struct RawCpu {
    package: usize,
    core: usize,
    l3: Option<usize>,
}

/// Discovers the topology under `sysfs_root` (normally `/sys`).
///
/// Never fails on a missing sysfs tree; it only fails when sysfs is present
/// but describes an inconsistent topology.
pub fn discover(sysfs_root: &Path) -> Result<CpuTopology> {
    let cpu_root = sysfs_root.join("devices/system/cpu");
    if !cpu_root.is_dir() {
        tracing::warn!(
            "sysfs cpu directory {} not found, using single-node fallback",
            cpu_root.display()
        );
        return fallback_topology();
    }

    let raw = read_cpus(&cpu_root)?;
    if raw.is_empty() {
        tracing::warn!("no cpu topology found under {}, using single-node fallback", cpu_root.display());
        return fallback_topology();
    }

    let cpu_to_node = read_numa_nodes(&sysfs_root.join("devices/system/node"))?;
    assemble(&raw, &cpu_to_node)
}

/// Single socket, single NUMA node, one thread per core.
pub fn fallback_topology() -> Result<CpuTopology> {
    CpuTopology::new((0..num_cpus::get()).map(|cpu| {
        (
            cpu,
            CpuInfo {
                socket_id: 0,
                numa_node_id: 0,
                uncore_cache_id: 0,
                core_id: cpu,
            },
        )
    }))
}

fn read_usize(path: &Path) -> Result<usize> {
    let text = fs::read_to_string(path)?;
    text.trim().parse().map_err(|e| {
        CpuManagerError::TopologyInconsistent(format!("{}: {e}", path.display()))
    })
}

fn read_cpus(cpu_root: &Path) -> Result<BTreeMap<usize, RawCpu>> {
    let online = match fs::read_to_string(cpu_root.join("online")) {
        Ok(text) => Some(CpuSet::parse(text.trim())?),
        Err(_) => None,
    };

    let mut raw = BTreeMap::new();
    for entry in fs::read_dir(cpu_root)?.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let Some(caps) = CPU_DIR_RE.captures(&name) else {
            continue;
        };
        let Ok(cpu) = caps[1].parse::<usize>() else {
            continue;
        };
        if online.as_ref().is_some_and(|set| !set.contains(cpu)) {
            continue;
        }

        let topo_dir = entry.path().join("topology");
        if !topo_dir.is_dir() {
            continue;
        }

        let package = read_usize(&topo_dir.join("physical_package_id"))?;
        let core = read_usize(&topo_dir.join("core_id"))?;
        let l3 = read_usize(&entry.path().join("cache/index3/id")).ok();
        raw.insert(cpu, RawCpu { package, core, l3 });
    }

    Ok(raw)
}

fn read_numa_nodes(node_root: &Path) -> Result<BTreeMap<usize, usize>> {
    let mut cpu_to_node = BTreeMap::new();
    let Ok(entries) = fs::read_dir(node_root) else {
        return Ok(cpu_to_node);
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let Some(caps) = NODE_DIR_RE.captures(&name) else {
            continue;
        };
        let Ok(node) = caps[1].parse::<usize>() else {
            continue;
        };
        let Ok(cpulist) = fs::read_to_string(entry.path().join("cpulist")) else {
            continue;
        };
        for cpu in &CpuSet::parse(cpulist.trim())? {
            cpu_to_node.insert(cpu, node);
        }
    }

    Ok(cpu_to_node)
}

/// Renumbers per-package core and cache ids into node-global ids.
fn assemble(raw: &BTreeMap<usize, RawCpu>, cpu_to_node: &BTreeMap<usize, usize>) -> Result<CpuTopology> {
    let numa_of = |cpu: usize, r: &RawCpu| cpu_to_node.get(&cpu).copied().unwrap_or(r.package);

    // Cache ids are keyed by NUMA node so a cache shared across sub-NUMA
    // clusters still yields a strict tree; a missing L3 means one cache per node.
    let mut core_ids = BTreeMap::new();
    let mut uncore_ids = BTreeMap::new();
    for (&cpu, r) in raw {
        let numa = numa_of(cpu, r);
        let next_core = core_ids.len();
        core_ids.entry((r.package, r.core)).or_insert(next_core);
        let next_uncore = uncore_ids.len();
        uncore_ids.entry((numa, r.l3)).or_insert(next_uncore);
    }

    CpuTopology::new(raw.iter().map(|(&cpu, r)| {
        let numa = numa_of(cpu, r);
        (
            cpu,
            CpuInfo {
                socket_id: r.package,
                numa_node_id: numa,
                uncore_cache_id: uncore_ids[&(numa, r.l3)],
                core_id: core_ids[&(r.package, r.core)],
            },
        )
    }))
}
