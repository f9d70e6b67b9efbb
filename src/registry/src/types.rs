//! Wire types of the agent control channel.

use std::collections::HashMap;

use icmpmon_model::{Command, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("command {0} not found")]
    CommandNotFound(Uuid),
}

impl RegistryError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RegistryError::Validation(_)
                | RegistryError::AgentNotFound(_)
                | RegistryError::CommandNotFound(_)
        )
    }
}

/// Registration request body. Registration is idempotent by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub executors: Vec<String>,
    #[serde(default = "default_max_targets")]
    pub max_targets: i32,
}

fn default_max_targets() -> i32 {
    10_000
}

/// Registration response: the stable agent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub agent_id: Uuid,
}

/// Heartbeat request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub queue_depth: i32,
    #[serde(default)]
    pub shipped_total: i64,
    #[serde(default)]
    pub failed_total: i64,
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub task_count: Option<i32>,
    /// Last assignment version this agent acted on
    #[serde(default)]
    pub assignment_version_seen: i64,
    #[serde(default)]
    pub public_ip: Option<String>,
}

/// Heartbeat response: staleness signal plus any pending commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    /// True when the authoritative assignment version is ahead of the
    /// agent's; the agent should poll its assignments
    pub assignment_stale: bool,
    pub assignment_version: i64,
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// Body an agent posts back for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultBody {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
}
