//! Topology-aware exclusive CPU allocation for container node agents.
//!
//! [`manager::CpuManager`] is the entry point: it hands whole CPUs to
//! Guaranteed containers through the [`policy::StaticPolicy`], persists the
//! decisions through [`state`] and offers NUMA placement hints to a topology
//! coordinator.

pub mod config;
pub mod cpu_assignment;
pub mod cpuset;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pod;
pub mod policy;
pub mod runtime;
pub mod state;
pub mod topology;
pub mod topology_hints;

pub use config::CpuManagerConfig;
pub use cpuset::CpuSet;
pub use error::{CpuManagerError, Result};
pub use manager::{CpuManager, ReconcileReport};
pub use crate::metrics::{AlignmentClass, CpuManagerMetrics};
pub use pod::{Container, Pod, QosClass};
pub use policy::{AffinityProvider, NoAffinity, Policy, StaticPolicy, StaticPolicyOptions};
pub use topology::CpuTopology;
pub use topology_hints::{NumaMask, TopologyHint};
