//! # Configuration
//!
//! JSON configuration of the node CPU manager. Every field is optional; an
//! empty object yields a working static-policy setup on the discovered
//! topology.

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::policy::{StaticPolicyOptions, STATIC_POLICY_NAME};
use crate::topology::{discovery, presets, CpuTopology};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STATE_FILE: &str = "/var/lib/node-cpu-manager/cpu_manager_state";
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";
pub const DEFAULT_RECONCILE_PERIOD_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuManagerConfig {
    /// Placement policy; only `static` is available.
    pub policy: String,
    /// Explicit reserved CPUs in list format, e.g. `"0,8"`.
    pub reserved_cpus: CpuSet,
    /// Number of CPUs to reserve. Derived from `reserved_cpus` when 0.
    pub num_reserved_cpus: usize,
    /// Checkpoint file. `None` keeps the state in memory only.
    pub state_file: Option<PathBuf>,
    pub reconcile_period_secs: u64,
    /// Use a named topology preset instead of reading sysfs.
    pub topology_preset: Option<String>,
    pub sysfs_root: PathBuf,
    pub policy_options: StaticPolicyOptions,
}

impl Default for CpuManagerConfig {
    fn default() -> Self {
        Self {
            policy: STATIC_POLICY_NAME.to_string(),
            reserved_cpus: CpuSet::new(),
            num_reserved_cpus: 0,
            state_file: Some(PathBuf::from(DEFAULT_STATE_FILE)),
            reconcile_period_secs: DEFAULT_RECONCILE_PERIOD_SECS,
            topology_preset: None,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            policy_options: StaticPolicyOptions::default(),
        }
    }
}

impl CpuManagerConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| CpuManagerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    /// Loads `path` if given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(data).map_err(|e| CpuManagerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.policy != STATIC_POLICY_NAME {
            return Err(CpuManagerError::Config(format!(
                "unknown cpu manager policy {:?}",
                self.policy
            )));
        }
        if self.reconcile_period_secs == 0 {
            return Err(CpuManagerError::Config(
                "reconcile_period_secs must be greater than 0".to_string(),
            ));
        }
        if !self.reserved_cpus.is_empty()
            && self.num_reserved_cpus != 0
            && self.num_reserved_cpus != self.reserved_cpus.len()
        {
            return Err(CpuManagerError::Config(format!(
                "num_reserved_cpus = {} disagrees with reserved_cpus {} ({} cpus)",
                self.num_reserved_cpus,
                self.reserved_cpus,
                self.reserved_cpus.len()
            )));
        }
        if let Some(limit) = self.policy_options.max_exclusive_cpus {
            if limit == 0 {
                return Err(CpuManagerError::Config(
                    "max_exclusive_cpus must be greater than 0 when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Reserved CPU count, taking an explicit reserved set into account.
    #[must_use]
    pub fn effective_num_reserved(&self) -> usize {
        if self.num_reserved_cpus == 0 {
            self.reserved_cpus.len()
        } else {
            self.num_reserved_cpus
        }
    }

    #[must_use]
    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_secs)
    }

    /// The configured preset, or the topology found under `sysfs_root`.
    pub fn build_topology(&self) -> Result<CpuTopology> {
        match &self.topology_preset {
            Some(name) => presets::topology_for_preset(name),
            None => discovery::discover(&self.sysfs_root),
        }
    }
}
