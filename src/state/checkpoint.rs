//! # Checkpoint-Backed State
//!
//! Keeps the allocation state in memory and writes a JSON checkpoint after
//! every mutation. The checkpoint is written first and the in-memory copy is
//! only replaced once the write succeeded, so memory and disk never diverge.

use super::{ContainerCpuAssignments, State, StateSnapshot};
use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::topology::TopologyFingerprint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// On-disk layout. Cpu sets are kept as list strings so a damaged entry is
/// reported as corrupt state instead of a JSON error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuManagerCheckpoint {
    pub version: u32,
    pub policy_name: String,
    /// Fingerprint of the topology the state was recorded on.
    pub topology: String,
    pub default_cpu_set: String,
    #[serde(default)]
    pub entries: BTreeMap<String, BTreeMap<String, String>>,
    pub checksum: String,
}

/// Every field except the checksum, in a fixed order.
#[derive(Serialize)]
struct ChecksumInput<'a> {
    version: u32,
    policy_name: &'a str,
    topology: &'a str,
    default_cpu_set: &'a str,
    entries: &'a BTreeMap<String, BTreeMap<String, String>>,
}

impl CpuManagerCheckpoint {
    /// Builds a checkpoint from a state snapshot and seals it.
    pub fn new(policy_name: &str, topology: &TopologyFingerprint, data: &StateSnapshot) -> Result<Self> {
        let entries = data
            .assignments
            .iter()
            .map(|(pod, containers)| {
                let containers = containers
                    .iter()
                    .map(|(name, cpus)| (name.clone(), cpus.to_string()))
                    .collect();
                (pod.clone(), containers)
            })
            .collect();

        let mut checkpoint = Self {
            version: CHECKPOINT_VERSION,
            policy_name: policy_name.to_string(),
            topology: topology.to_string(),
            default_cpu_set: data.default_cpu_set.to_string(),
            entries,
            checksum: String::new(),
        };
        checkpoint.checksum = checkpoint.compute_checksum()?;
        Ok(checkpoint)
    }

    /// Hex SHA-256 over every field except `checksum`.
    pub fn compute_checksum(&self) -> Result<String> {
        let input = ChecksumInput {
            version: self.version,
            policy_name: &self.policy_name,
            topology: &self.topology,
            default_cpu_set: &self.default_cpu_set,
            entries: &self.entries,
        };
        let bytes = serde_json::to_vec(&input)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Checks version, checksum, policy and topology, then decodes the sets.
    pub fn restore(&self, policy_name: &str, topology: &TopologyFingerprint) -> Result<StateSnapshot> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CpuManagerError::StateCorrupt(format!(
                "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                self.version
            )));
        }
        if self.compute_checksum()? != self.checksum {
            return Err(CpuManagerError::StateCorrupt(
                "checkpoint checksum mismatch".to_string(),
            ));
        }
        if self.policy_name != policy_name {
            return Err(CpuManagerError::StateCorrupt(format!(
                "configured policy {policy_name:?} differs from policy {:?} in checkpoint",
                self.policy_name
            )));
        }
        let expected = topology.to_string();
        if self.topology != expected {
            return Err(CpuManagerError::IncompatibleTopology(format!(
                "checkpoint recorded on {}, node is {expected}",
                self.topology
            )));
        }

        let default_cpu_set = decode_set(&self.default_cpu_set, "default cpu set")?;
        let mut assignments = ContainerCpuAssignments::new();
        for (pod, containers) in &self.entries {
            for (name, cpus) in containers {
                let cpus = decode_set(cpus, &format!("assignment {pod}/{name}"))?;
                assignments
                    .entry(pod.clone())
                    .or_default()
                    .insert(name.clone(), cpus);
            }
        }

        Ok(StateSnapshot {
            assignments,
            default_cpu_set,
        })
    }
}

fn decode_set(text: &str, what: &str) -> Result<CpuSet> {
    CpuSet::parse(text).map_err(|e| CpuManagerError::StateCorrupt(format!("{what}: {e}")))
}

/// Where checkpoints are kept.
pub trait CheckpointStore: Send {
    /// `Ok(None)` when nothing has been written yet.
    fn load(&self) -> Result<Option<CpuManagerCheckpoint>>;

    fn save(&mut self, checkpoint: &CpuManagerCheckpoint) -> Result<()>;
}

/// Single JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<CpuManagerCheckpoint>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map(Some).map_err(|e| {
            CpuManagerError::StateCorrupt(format!("{}: {e}", self.path.display()))
        })
    }

    fn save(&mut self, checkpoint: &CpuManagerCheckpoint) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(checkpoint)?;

        // write-fsync-rename so a crash leaves either the old or the new file
        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// [`State`] persisted through a [`CheckpointStore`].
pub struct CheckpointState {
    cache: StateSnapshot,
    store: Box<dyn CheckpointStore>,
    policy_name: String,
    topology: TopologyFingerprint,
}

impl CheckpointState {
    /// Opens the state, restoring whatever the store holds.
    ///
    /// Fails with `StateCorrupt` or `IncompatibleTopology` rather than
    /// silently discarding a checkpoint that cannot be trusted.
    pub fn new(
        store: Box<dyn CheckpointStore>,
        policy_name: &str,
        topology: TopologyFingerprint,
    ) -> Result<Self> {
        let cache = match store.load()? {
            Some(checkpoint) => {
                let restored = checkpoint.restore(policy_name, &topology)?;
                tracing::info!(
                    "restored cpu manager state: {} pods, default cpu set {}",
                    restored.assignments.len(),
                    restored.default_cpu_set
                );
                restored
            }
            None => {
                tracing::info!("no cpu manager checkpoint found, starting with empty state");
                StateSnapshot::default()
            }
        };

        Ok(Self {
            cache,
            store,
            policy_name: policy_name.to_string(),
            topology,
        })
    }

    /// Persists `next` and makes it current; on failure nothing changes.
    fn commit(&mut self, next: StateSnapshot) -> Result<()> {
        let checkpoint = CpuManagerCheckpoint::new(&self.policy_name, &self.topology, &next)?;
        if let Err(e) = self.store.save(&checkpoint) {
            tracing::error!("failed to write cpu manager checkpoint: {}", e);
            return Err(e);
        }
        self.cache = next;
        Ok(())
    }

    fn modify(&mut self, f: impl FnOnce(&mut StateSnapshot)) -> Result<()> {
        let mut next = self.cache.clone();
        f(&mut next);
        self.commit(next)
    }
}

impl State for CheckpointState {
    fn get_cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.cache.get_cpu_set(pod_uid, container_name)
    }

    fn get_default_cpu_set(&self) -> CpuSet {
        self.cache.default_cpu_set.clone()
    }

    fn get_cpu_assignments(&self) -> ContainerCpuAssignments {
        self.cache.assignments.clone()
    }

    fn snapshot(&self) -> StateSnapshot {
        self.cache.clone()
    }

    fn set_cpu_set(&mut self, pod_uid: &str, container_name: &str, cpus: CpuSet) -> Result<()> {
        self.modify(|s| s.set_cpu_set(pod_uid, container_name, cpus))
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<()> {
        self.modify(|s| s.default_cpu_set = cpus)
    }

    fn set_cpu_assignments(&mut self, assignments: ContainerCpuAssignments) -> Result<()> {
        self.modify(|s| s.assignments = assignments)
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) -> Result<()> {
        if self.cache.get_cpu_set(pod_uid, container_name).is_none() {
            return Ok(());
        }
        self.modify(|s| s.delete(pod_uid, container_name))
    }

    fn clear_state(&mut self) -> Result<()> {
        self.commit(StateSnapshot::default())
    }

    fn commit_allocation(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
        default_cpu_set: CpuSet,
    ) -> Result<()> {
        self.modify(|s| {
            s.set_cpu_set(pod_uid, container_name, cpus);
            s.default_cpu_set = default_cpu_set;
        })
    }

    fn commit_release(&mut self, pod_uid: &str, container_name: &str, default_cpu_set: CpuSet) -> Result<()> {
        self.modify(|s| {
            s.delete(pod_uid, container_name);
            s.default_cpu_set = default_cpu_set;
        })
    }
}
