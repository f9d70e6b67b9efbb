//! Probe-side types: the unit of work handed to executors, executor
//! capability declarations, and the crate error enum.

use thiserror::Error;
use uuid::Uuid;

/// Default executor type when an assignment names none.
pub const DEFAULT_EXECUTOR: &str = "icmp_ping";

/// One target to probe, carrying the tier-level budget.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub target_id: Uuid,
    pub agent_id: Uuid,
    pub ip: String,
    pub timeout_ms: u32,
    /// Extra probe packets beyond the first, per tier policy
    pub retries: u32,
}

impl ProbeTarget {
    /// Packets sent per cycle: the probe itself plus its retries.
    pub fn packet_count(&self) -> u32 {
        self.retries + 1
    }
}

/// Static description of what an executor can do and what it needs.
#[derive(Debug, Clone)]
pub struct ExecutorCapabilities {
    pub supports_batching: bool,
    pub max_batch_size: usize,
    pub requires_privilege: bool,
    /// External binaries that must be on PATH for registration to succeed
    pub dependencies: Vec<String>,
}

/// Errors from executor registration and probe execution.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("missing external dependency: {0}")]
    MissingDependency(String),

    #[error("executor {0} is not registered")]
    UnknownExecutor(String),

    #[error("probe process failed: {0}")]
    Process(#[from] std::io::Error),

    #[error("probe produced no output")]
    EmptyOutput,

    #[error("probe output unparseable: {0}")]
    Parse(String),

    #[error("probe timed out after {0} ms")]
    Timeout(u64),

    #[error("probe cancelled")]
    Cancelled,
}
