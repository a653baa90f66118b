//! # CPU Manager Error Types

/// Errors raised by the CPU manager.
#[derive(Debug, thiserror::Error)]
pub enum CpuManagerError {
    /// Fewer free CPUs than requested.
    #[error("not enough cpus available to satisfy request: requested={requested}, available={available}")]
    InsufficientResources {
        /// CPUs asked for
        requested: usize,
        /// CPUs that were free
        available: usize,
    },

    /// A configured ceiling on exclusive CPUs would be exceeded.
    #[error("exclusive cpu limit exceeded: requested={requested}, in use={in_use}, limit={limit}")]
    PolicyLimitExceeded {
        /// CPUs asked for
        requested: usize,
        /// Exclusive CPUs already handed out
        in_use: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// The request cannot be served with whole physical cores.
    #[error(
        "SMT alignment error: requested {requested} cpus not multiple of cpus per core = {cpus_per_core} \
         or not enough free physical cores (available physical cpus = {available_physical_cpus})"
    )]
    SmtAlignment {
        /// CPUs asked for
        requested: usize,
        /// SMT width of the node
        cpus_per_core: usize,
        /// CPUs sitting on entirely free cores
        available_physical_cpus: usize,
    },

    /// The topology description contradicts itself.
    #[error("inconsistent cpu topology: {0}")]
    TopologyInconsistent(String),

    /// Durable state cannot be trusted.
    #[error("cpu manager state corrupt: {0}")]
    StateCorrupt(String),

    /// Durable state was recorded for different hardware.
    #[error("cpu manager state incompatible with current topology: {0}")]
    IncompatibleTopology(String),

    /// Hint enumeration is bounded to a fixed number of NUMA nodes.
    #[error("unsupported number of NUMA nodes: {found} (max {max})")]
    TooManyNumaNodes {
        /// NUMA nodes on this machine
        found: usize,
        /// Supported maximum
        max: usize,
    },

    /// A cpu list string could not be parsed.
    #[error("invalid cpu set {input:?}: {reason}")]
    InvalidCpuSet {
        /// Offending text
        input: String,
        /// What was wrong with it
        reason: String,
    },

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The container runtime failed to apply a cpuset.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialisation failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CpuManagerError {
    /// Errors the admission pipeline may recover from by leaving the pod pending.
    #[must_use]
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::InsufficientResources { .. }
                | Self::PolicyLimitExceeded { .. }
                | Self::SmtAlignment { .. }
        )
    }
}

/// Result type for CPU manager operations.
pub type Result<T> = std::result::Result<T, CpuManagerError>;
