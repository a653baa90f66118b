use crate::error::{CpuManagerError, Result};
use crate::topology::{CpuInfo, CpuTopology};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct PresetsRoot {
    presets: Vec<PresetConfig>,
}

#[derive(Deserialize)]
struct PresetConfig {
    name: String,
    description: String,
    layout: TopologyLayout,
}

/// How SMT siblings are numbered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingNumbering {
    /// Thread `t` of core `c` is cpu `t * total_cores + c` (typical Intel).
    #[default]
    Offset,
    /// Threads of a core are consecutive cpu ids.
    Adjacent,
}

/// A regular machine shape, expanded into a [`CpuTopology`] by [`TopologyLayout::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyLayout {
    pub sockets: usize,
    #[serde(default = "default_one")]
    pub numa_per_socket: usize,
    #[serde(default = "default_one")]
    pub uncore_per_numa: usize,
    pub cores_per_uncore: usize,
    #[serde(default = "default_one")]
    pub threads_per_core: usize,
    #[serde(default)]
    pub numbering: SiblingNumbering,
}

fn default_one() -> usize {
    1
}

impl TopologyLayout {
    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.sockets * self.numa_per_socket * self.uncore_per_numa * self.cores_per_uncore
    }

    /// Expands the layout. Group ids are dense and node-global.
    pub fn build(&self) -> Result<CpuTopology> {
        let total_cores = self.total_cores();
        if total_cores == 0 || self.threads_per_core == 0 {
            return Err(CpuManagerError::TopologyInconsistent(format!(
                "layout has no cpus: {self:?}"
            )));
        }

        let mut cpus = Vec::with_capacity(total_cores * self.threads_per_core);
        let mut core_id = 0;

        for socket_id in 0..self.sockets {
            for n in 0..self.numa_per_socket {
                let numa_node_id = socket_id * self.numa_per_socket + n;
                for u in 0..self.uncore_per_numa {
                    let uncore_cache_id = numa_node_id * self.uncore_per_numa + u;
                    for _ in 0..self.cores_per_uncore {
                        let info = CpuInfo {
                            socket_id,
                            numa_node_id,
                            uncore_cache_id,
                            core_id,
                        };
                        for t in 0..self.threads_per_core {
                            let cpu = match self.numbering {
                                SiblingNumbering::Offset => t * total_cores + core_id,
                                SiblingNumbering::Adjacent => core_id * self.threads_per_core + t,
                            };
                            cpus.push((cpu, info));
                        }
                        core_id += 1;
                    }
                }
            }
        }

        CpuTopology::new(cpus)
    }
}

const PRESETS_JSON: &str = include_str!("../../assets/topology_presets.json");

static PRESETS: Lazy<PresetsRoot> = Lazy::new(|| {
    serde_json::from_str(PRESETS_JSON).expect("Failed to parse embedded topology_presets.json")
});

/// Name and description of every embedded preset.
pub fn get_all_presets_info() -> Vec<(String, String)> {
    PRESETS
        .presets
        .iter()
        .map(|p| (p.name.clone(), p.description.clone()))
        .collect()
}

/// Layout of the preset called `name` (case-insensitive).
pub fn get_preset(name: &str) -> Option<TopologyLayout> {
    let wanted = name.trim();
    PRESETS
        .presets
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(wanted))
        .map(|p| p.layout.clone())
}

/// Builds the topology of the preset called `name`.
pub fn topology_for_preset(name: &str) -> Result<CpuTopology> {
    get_preset(name)
        .ok_or_else(|| CpuManagerError::Config(format!("unknown topology preset {name:?}")))?
        .build()
}
