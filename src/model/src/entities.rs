//! Core entity definitions shared across the control plane and the agents.
//!
//! Status enums serialize as lowercase strings both on the wire and in
//! Postgres TEXT columns; probe payloads are adjacently tagged by
//! `probe_type` so the ingest path can treat them as schema-less JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a probing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered and heartbeating within the liveness window
    Active,
    /// Missed heartbeats; still assigned but under suspicion
    Degraded,
    /// Liveness lost; assignments are failed over to other agents
    Offline,
    /// Operator-archived; excluded from selection, retained for history
    Archived,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Offline => "offline",
            AgentStatus::Archived => "archived",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "degraded" => Ok(AgentStatus::Degraded),
            "offline" => Ok(AgentStatus::Offline),
            "archived" => Ok(AgentStatus::Archived),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote probing process registered with the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Unique name; re-registration by name updates metadata in place
    pub name: String,
    pub region: String,
    pub provider: String,
    pub location: String,
    pub tags: HashMap<String, String>,
    /// Executor type names the agent declared at registration
    pub executors: Vec<String>,
    pub max_targets: i32,
    pub status: AgentStatus,
    pub version: Option<String>,
    pub public_ip: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Last assignment version the agent acknowledged via heartbeat
    pub assignment_version_seen: i64,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Eligible for target selection: active and not archived.
    pub fn is_selectable(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Monitoring state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Active,
    Unknown,
    Unresponsive,
    Excluded,
    Down,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Active => "active",
            TargetState::Unknown => "unknown",
            TargetState::Unresponsive => "unresponsive",
            TargetState::Excluded => "excluded",
            TargetState::Down => "down",
        }
    }
}

impl FromStr for TargetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TargetState::Active),
            "unknown" => Ok(TargetState::Unknown),
            "unresponsive" => Ok(TargetState::Unresponsive),
            "excluded" => Ok(TargetState::Excluded),
            "down" => Ok(TargetState::Down),
            other => Err(format!("unknown target state: {other}")),
        }
    }
}

/// What the operator expects a probe against this target to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    pub should_succeed: bool,
    #[serde(default)]
    pub alert_severity: Option<String>,
    #[serde(default)]
    pub alert_message: Option<String>,
}

/// A monitored network endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    /// Unique among non-archived targets
    pub ip: String,
    /// Name of the tier governing cadence and agent selection
    pub tier: String,
    pub tags: HashMap<String, String>,
    pub expected: Option<ExpectedOutcome>,
    pub state: TargetState,
    pub state_changed_at: DateTime<Utc>,
    pub subnet_id: Option<Uuid>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// Agent selection strategy for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Every eligible agent probes the target
    All,
    /// A deterministic subset of `count` agents probes the target
    Distributed,
}

/// Spread requirement layered over distributed selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversityRequirement {
    pub min_regions: usize,
    pub min_providers: usize,
}

/// Which agents may probe targets in a tier, and how many.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    pub strategy: SelectionStrategy,
    pub count: usize,
    pub allowed_regions: Vec<String>,
    pub excluded_regions: Vec<String>,
    pub allowed_providers: Vec<String>,
    pub required_tags: HashMap<String, String>,
    pub excluded_tags: HashMap<String, String>,
    pub diversity: Option<DiversityRequirement>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Distributed,
            count: 2,
            allowed_regions: Vec::new(),
            excluded_regions: Vec::new(),
            allowed_providers: Vec::new(),
            required_tags: HashMap::new(),
            excluded_tags: HashMap::new(),
            diversity: None,
        }
    }
}

/// Anomaly thresholds, overridable per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub z_warn: f64,
    pub z_crit: f64,
    pub packet_loss_warning_pct: f64,
    pub packet_loss_critical_pct: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            z_warn: 3.0,
            z_crit: 5.0,
            packet_loss_warning_pct: 20.0,
            packet_loss_critical_pct: 20.0,
        }
    }
}

/// A named monitoring class: cadence, timeout, retries and selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    /// Primary key
    pub name: String,
    pub probe_interval_secs: u32,
    pub probe_timeout_ms: u32,
    pub retries: u32,
    pub policy: SelectionPolicy,
    #[serde(default)]
    pub expected: Option<ExpectedOutcome>,
    #[serde(default)]
    pub thresholds: Option<AlertThresholds>,
}

impl Tier {
    /// Enforces `probe_timeout < probe_interval`.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("tier name must not be empty".to_string());
        }
        if self.probe_interval_secs == 0 {
            return Err("probe_interval_secs must be positive".to_string());
        }
        if u64::from(self.probe_timeout_ms) >= u64::from(self.probe_interval_secs) * 1000 {
            return Err(format!(
                "probe_timeout ({} ms) must be less than probe_interval ({} s)",
                self.probe_timeout_ms, self.probe_interval_secs
            ));
        }
        Ok(())
    }
}

/// How an assignment row came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentOrigin {
    Initial,
    Rebalance,
    Failover,
    Manual,
}

impl AssignmentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentOrigin::Initial => "initial",
            AssignmentOrigin::Rebalance => "rebalance",
            AssignmentOrigin::Failover => "failover",
            AssignmentOrigin::Manual => "manual",
        }
    }
}

impl FromStr for AssignmentOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(AssignmentOrigin::Initial),
            "rebalance" => Ok(AssignmentOrigin::Rebalance),
            "failover" => Ok(AssignmentOrigin::Failover),
            "manual" => Ok(AssignmentOrigin::Manual),
            other => Err(format!("unknown assignment origin: {other}")),
        }
    }
}

/// The record that `agent_id` probes `target_id` under `tier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub target_id: Uuid,
    pub agent_id: Uuid,
    pub tier: String,
    pub origin: AssignmentOrigin,
    pub created_at: DateTime<Utc>,
}

/// Flattened assignment row as served to agents: the join of an assignment
/// with the target fields the scheduler needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentView {
    pub target_id: Uuid,
    pub agent_id: Uuid,
    pub ip: String,
    pub tier: String,
    /// Executor type name; `icmp_ping` when unset
    #[serde(default)]
    pub executor: Option<String>,
}

/// Schedule poll response: the authoritative version, the agent's flattened
/// assignments and the tier catalog they reference, in one round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentsResponse {
    pub version: i64,
    pub generated_at: DateTime<Utc>,
    pub assignments: Vec<AssignmentView>,
    pub tiers: HashMap<String, Tier>,
}

/// Typed probe payload, adjacently tagged by `probe_type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "probe_type", content = "payload", rename_all = "snake_case")]
pub enum ProbePayload {
    IcmpPing(PingStats),
    Mtr(MtrTrace),
}

impl ProbePayload {
    pub fn probe_type(&self) -> &'static str {
        match self {
            ProbePayload::IcmpPing(_) => "icmp_ping",
            ProbePayload::Mtr(_) => "mtr",
        }
    }

    /// Average latency in ms, when the payload carries one.
    pub fn avg_ms(&self) -> Option<f64> {
        match self {
            ProbePayload::IcmpPing(stats) => stats.avg_rtt_ms,
            ProbePayload::Mtr(trace) => trace.hops.last().map(|h| h.avg_ms),
        }
    }

    /// Packet loss percentage, when the payload carries one.
    pub fn packet_loss_pct(&self) -> Option<f64> {
        match self {
            ProbePayload::IcmpPing(stats) => Some(stats.packet_loss_pct),
            ProbePayload::Mtr(trace) => trace.hops.last().map(|h| h.loss_pct),
        }
    }
}

/// Aggregated statistics from one bulk ICMP probe of a single target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingStats {
    pub packets_sent: u32,
    pub packets_recvd: u32,
    pub packet_loss_pct: f64,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    /// Unbiased sample standard deviation; present only with two or more RTTs
    pub stddev_rtt_ms: Option<f64>,
    /// Last observed RTT
    pub latency_ms: Option<f64>,
    /// Per-packet RTTs in send order; `None` marks a lost packet
    pub rtts_ms: Vec<Option<f64>>,
}

/// One hop of a path trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtrHop {
    pub number: u32,
    pub host: String,
    pub loss_pct: f64,
    pub sent: u32,
    pub recv: u32,
    pub best_ms: f64,
    pub avg_ms: f64,
    pub worst_ms: f64,
    pub stddev_ms: f64,
}

/// A full path trace to a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtrTrace {
    pub hops: Vec<MtrHop>,
    /// Final hop answered with < 50% loss and a resolvable host
    pub reached: bool,
}

/// A single probe observation. `(time, target_id, agent_id)` is the
/// composite key the store dedups on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub time: DateTime<Utc>,
    pub target_id: Uuid,
    pub agent_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: ProbePayload,
}

/// One shipper flush as it crosses the wire: gzip-compressed JSON of this
/// envelope, POSTed to the ingest endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBatch {
    pub agent_id: Uuid,
    /// Unique per flush; lets the ingest side spot replayed batches in logs
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub results: Vec<ProbeResult>,
}

/// Learned latency distribution for one (agent, target) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub agent_id: Uuid,
    pub target_id: Uuid,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub stddev_ms: f64,
    pub sample_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Health status of one (agent, target) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Up,
    Degraded,
    Down,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::Up => "up",
            PairStatus::Degraded => "degraded",
            PairStatus::Down => "down",
        }
    }
}

impl FromStr for PairStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(PairStatus::Up),
            "degraded" => Ok(PairStatus::Degraded),
            "down" => Ok(PairStatus::Down),
            other => Err(format!("unknown pair status: {other}")),
        }
    }
}

/// Evaluated health state of one (agent, target) pair with hysteresis
/// counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairState {
    pub agent_id: Uuid,
    pub target_id: Uuid,
    pub status: PairStatus,
    pub consecutive_anomalies: i32,
    pub consecutive_successes: i32,
    pub anomaly_start: Option<DateTime<Utc>>,
    pub status_since: DateTime<Utc>,
    pub last_latency_ms: Option<f64>,
    pub last_z_score: Option<f64>,
    pub last_packet_loss_pct: Option<f64>,
}

impl PairState {
    /// Fresh pair state: up, counters at zero.
    pub fn new(agent_id: Uuid, target_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            target_id,
            status: PairStatus::Up,
            consecutive_anomalies: 0,
            consecutive_successes: 0,
            anomaly_start: None,
            status_since: now,
            last_latency_ms: None,
            last_z_score: None,
            last_packet_loss_pct: None,
        }
    }
}

/// Lifecycle of a fan-out command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InFlight,
    Completed,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::InFlight => "in_flight",
            CommandStatus::Completed => "completed",
            CommandStatus::Expired => "expired",
        }
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "in_flight" => Ok(CommandStatus::InFlight),
            "completed" => Ok(CommandStatus::Completed),
            "expired" => Ok(CommandStatus::Expired),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// An RPC-style command fanned out to one or more agents over the
/// heartbeat/poll channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    /// Executor type to run; initially only `mtr`
    pub command_type: String,
    pub target_ip: String,
    /// Empty list means broadcast to all active agents
    pub agent_ids: Vec<Uuid>,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One agent's answer to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: Uuid,
    pub agent_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub duration_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
}
