use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const DEFAULT_CONTROL_PLANE_CONFIG: &str = "configs/control-plane.toml";
const DEFAULT_AGENT_CONFIG: &str = "configs/agent.toml";

/// Control-plane configuration, layered from a TOML file and the
/// `ICMPMON`-prefixed environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub metadata: MetadataSettings,
    pub observability: ObservabilitySettings,
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub http: HttpSettings,
    pub ingest: IngestSettings,
    pub evaluator: EvaluatorSettings,
    pub liveness: LivenessSettings,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            metadata: MetadataSettings::default(),
            observability: ObservabilitySettings::default(),
            database: DatabaseSettings::default(),
            queue: QueueSettings::default(),
            http: HttpSettings::default(),
            ingest: IngestSettings::default(),
            evaluator: EvaluatorSettings::default(),
            liveness: LivenessSettings::default(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config: Self = layered(DEFAULT_CONTROL_PLANE_CONFIG, path)?
            .try_deserialize()
            .context("invalid control-plane configuration")?;

        // Documented flat aliases beat the nested form.
        if let Ok(url) = std::env::var("ICMPMON_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(url) = std::env::var("ICMPMON_REDIS_URL") {
            config.queue.redis_url = url;
        }
        if let Ok(token) = std::env::var("ICMPMON_CONTROL_PLANE_TOKEN") {
            config.http.token = Some(token);
        }
        Ok(config)
    }
}

/// Agent configuration, layered the same way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub name: String,
    pub region: String,
    pub location: String,
    pub provider: String,
    pub tags: HashMap<String, String>,
    pub public_ip: Option<String>,
    pub max_targets: i32,
    pub control_plane: ControlPlaneEndpoint,
    pub observability: ObservabilitySettings,
    pub shipper: ShipperSettings,
    /// Seconds between heartbeats
    pub heartbeat_interval_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            region: String::new(),
            location: String::new(),
            provider: String::new(),
            tags: HashMap::new(),
            public_ip: None,
            max_targets: 10_000,
            control_plane: ControlPlaneEndpoint::default(),
            observability: ObservabilitySettings::default(),
            shipper: ShipperSettings::default(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl AgentSettings {
    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config: Self = layered(DEFAULT_AGENT_CONFIG, path)?
            .try_deserialize()
            .context("invalid agent configuration")?;

        if let Ok(url) = std::env::var("ICMPMON_CONTROL_PLANE_URL") {
            config.control_plane.url = url;
        }
        if let Ok(token) = std::env::var("ICMPMON_CONTROL_PLANE_TOKEN") {
            config.control_plane.token = Some(token);
        }
        if let Ok(name) = std::env::var("ICMPMON_AGENT_NAME") {
            config.name = name;
        }
        if let Ok(region) = std::env::var("ICMPMON_AGENT_REGION") {
            config.region = region;
        }
        if let Ok(location) = std::env::var("ICMPMON_AGENT_LOCATION") {
            config.location = location;
        }
        if let Ok(provider) = std::env::var("ICMPMON_AGENT_PROVIDER") {
            config.provider = provider;
        }
        if let Ok(ip) = std::env::var("ICMPMON_PUBLIC_IP") {
            config.public_ip = Some(ip);
        }
        if let Ok(tags) = std::env::var("ICMPMON_AGENT_TAGS") {
            config.tags = serde_json::from_str(&tags)
                .context("ICMPMON_AGENT_TAGS must be a JSON object of strings")?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("agent name is required (--name or ICMPMON_AGENT_NAME)");
        }
        if self.control_plane.url.trim().is_empty() {
            anyhow::bail!("control plane URL is required (--control-plane or ICMPMON_CONTROL_PLANE_URL)");
        }
        Ok(())
    }
}

fn layered<P: AsRef<Path>>(default_path: &str, path: Option<P>) -> Result<Config> {
    let mut builder = Config::builder().add_source(
        File::from(PathBuf::from(default_path))
            .format(FileFormat::Toml)
            .required(false),
    );

    if let Some(path) = path {
        builder = builder.add_source(
            File::from(path.as_ref())
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("ICMPMON").separator("__"));
    builder.build().context("configuration build failed")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub name: String,
    pub environment: String,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            name: "icmp-mon".to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub metrics_port: u16,
    pub enable_metrics: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/icmpmon".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub redis_url: String,
    pub results_key: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            results_key: "icmpmon:results".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub listen_addr: String,
    /// Bearer token required on agent-facing routes when set
    pub token: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub flush_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            flush_interval_secs: 2,
            batch_size: 20_000,
        }
    }
}

impl IngestSettings {
    pub fn to_flusher_config(&self) -> icmpmon_ingest::FlusherConfig {
        icmpmon_ingest::FlusherConfig {
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            batch_size: self.batch_size.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    pub interval_secs: u64,
    pub evaluation_window_secs: u64,
    pub baseline_window_secs: u64,
    pub min_samples_for_baseline: i64,
    pub consecutive_failures_for_down: i32,
    pub consecutive_successes_for_up: i32,
    pub z_warn: f64,
    pub z_crit: f64,
    pub packet_loss_warning_pct: f64,
    pub packet_loss_critical_pct: f64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            evaluation_window_secs: 300,
            baseline_window_secs: 7 * 24 * 3600,
            min_samples_for_baseline: 100,
            consecutive_failures_for_down: 3,
            consecutive_successes_for_up: 3,
            z_warn: 3.0,
            z_crit: 5.0,
            packet_loss_warning_pct: 20.0,
            packet_loss_critical_pct: 20.0,
        }
    }
}

impl EvaluatorSettings {
    pub fn to_evaluator_config(&self) -> icmpmon_evaluator::EvaluatorConfig {
        icmpmon_evaluator::EvaluatorConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            evaluation_window: Duration::from_secs(self.evaluation_window_secs.max(1)),
            baseline_window: Duration::from_secs(self.baseline_window_secs.max(1)),
            min_samples_for_baseline: self.min_samples_for_baseline,
            consecutive_failures_for_down: self.consecutive_failures_for_down,
            consecutive_successes_for_up: self.consecutive_successes_for_up,
            thresholds: icmpmon_model::AlertThresholds {
                z_warn: self.z_warn,
                z_crit: self.z_crit,
                packet_loss_warning_pct: self.packet_loss_warning_pct,
                packet_loss_critical_pct: self.packet_loss_critical_pct,
            },
            ..icmpmon_evaluator::EvaluatorConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    pub heartbeat_interval_secs: u64,
    pub degraded_after: u32,
    pub offline_after: u32,
    pub check_interval_secs: u64,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            degraded_after: 3,
            offline_after: 6,
            check_interval_secs: 30,
        }
    }
}

impl LivenessSettings {
    pub fn to_liveness_config(&self) -> icmpmon_registry::LivenessConfig {
        icmpmon_registry::LivenessConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            degraded_after: self.degraded_after.max(1),
            offline_after: self.offline_after.max(2),
            check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneEndpoint {
    pub url: String,
    pub token: Option<String>,
}

impl Default for ControlPlaneEndpoint {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipperSettings {
    pub batch_size: usize,
    pub batch_timeout_secs: u64,
    pub max_buffer: usize,
    pub max_attempts: u32,
}

impl Default for ShipperSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_timeout_secs: 10,
            max_buffer: 20_000,
            max_attempts: 3,
        }
    }
}

impl ShipperSettings {
    pub fn to_shipper_config(&self, endpoint: &ControlPlaneEndpoint) -> icmpmon_shipper::ShipperConfig {
        icmpmon_shipper::ShipperConfig {
            endpoint: format!("{}/api/v1/results", endpoint.url.trim_end_matches('/')),
            token: endpoint.token.clone(),
            batch_size: self.batch_size.max(1),
            batch_timeout: Duration::from_secs(self.batch_timeout_secs.max(1)),
            max_buffer: self.max_buffer.max(1),
            request_timeout: Duration::from_secs(30),
            max_attempts: self.max_attempts.max(1),
        }
    }
}
