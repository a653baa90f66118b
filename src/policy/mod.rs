//! # CPU Manager Policies
//!
//! A [`Policy`] decides which CPUs a container gets. The manager owns the
//! state and its lock; policies receive the state for the duration of one
//! call and never keep references to it.

mod static_policy;

pub use static_policy::{StaticPolicy, StaticPolicyOptions, STATIC_POLICY_NAME};

use crate::cpuset::CpuSet;
use crate::error::Result;
use crate::pod::{Container, Pod};
use crate::state::{State, StateSnapshot};
use crate::topology_hints::{NumaMask, TopologyHint};

/// CPU placement policy.
pub trait Policy: Send + Sync {
    /// Name recorded in checkpoints.
    fn name(&self) -> &'static str;

    /// Initialises an empty state or validates a restored one.
    fn start(&self, state: &mut dyn State) -> Result<()>;

    /// Assigns CPUs to `container` of `pod`. Idempotent.
    fn allocate(&self, state: &mut dyn State, pod: &Pod, container: &Container) -> Result<()>;

    /// Returns the container's CPUs to the shared pool. Unknown ids are a no-op.
    fn remove_container(&self, state: &mut dyn State, pod_uid: &str, container_name: &str) -> Result<()>;

    /// NUMA placement candidates for one container, `None` if the policy has
    /// no opinion about it.
    fn get_topology_hints(
        &self,
        state: &StateSnapshot,
        pod: &Pod,
        container: &Container,
    ) -> Result<Option<Vec<TopologyHint>>>;

    /// NUMA placement candidates for a whole pod.
    fn get_pod_topology_hints(&self, state: &StateSnapshot, pod: &Pod) -> Result<Option<Vec<TopologyHint>>>;

    /// CPUs that exclusive allocations may still be made from.
    fn get_allocatable_cpus(&self, state: &dyn State) -> CpuSet;
}

/// The NUMA affinity the topology coordinator settled on for a container.
pub trait AffinityProvider: Send + Sync {
    fn get_affinity(&self, pod_uid: &str, container_name: &str) -> Option<NumaMask>;
}

/// Provider for nodes without a topology coordinator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAffinity;

impl AffinityProvider for NoAffinity {
    fn get_affinity(&self, _pod_uid: &str, _container_name: &str) -> Option<NumaMask> {
        None
    }
}
