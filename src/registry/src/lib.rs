//! # icmpmon-registry
//!
//! Agent lifecycle on the control plane: idempotent registration by name,
//! heartbeat ingestion with staleness signalling, the liveness monitor that
//! walks agents from active through degraded to offline, and the
//! RPC-over-poll command fan-out (initially `mtr` traces).

pub mod commands;
pub mod liveness;
pub mod registry;
pub mod types;

pub use commands::CommandService;
pub use liveness::{LivenessConfig, LivenessMonitor, RebalanceHook};
pub use registry::AgentRegistry;
pub use types::{
    AgentRegistration, Heartbeat, HeartbeatResponse, RegistrationResponse, RegistryError,
};
