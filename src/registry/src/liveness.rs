//! Liveness monitor: walks registered agents and downgrades the ones that
//! stopped heartbeating, active → degraded → offline. Going offline hands
//! the agent to the assignment engine for failover; the registry's
//! heartbeat path reports recoveries through the same hook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use icmpmon_model::{AgentStatus, Store};
use sqlx::Row;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::commands::CommandService;
use crate::types::RegistryError;

/// Seam to the assignment engine; the control plane wires the rebalancer in
/// here so the registry crate never depends on it.
#[async_trait]
pub trait RebalanceHook: Send + Sync {
    async fn on_agent_failure(&self, agent_id: Uuid);
    async fn on_agent_recovery(&self, agent_id: Uuid);
}

/// Liveness thresholds, in heartbeat intervals.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    /// Missed intervals before active becomes degraded
    pub degraded_after: u32,
    /// Missed intervals before degraded becomes offline
    pub offline_after: u32,
    pub check_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            degraded_after: 3,
            offline_after: 6,
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Periodic agent liveness sweep.
pub struct LivenessMonitor {
    store: Store,
    commands: CommandService,
    config: LivenessConfig,
    hook: Arc<dyn RebalanceHook>,
}

impl LivenessMonitor {
    pub fn new(store: Store, config: LivenessConfig, hook: Arc<dyn RebalanceHook>) -> Self {
        let commands = CommandService::new(store.clone());
        Self {
            store,
            commands,
            config,
            hook,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(
            check_secs = self.config.check_interval.as_secs(),
            "liveness monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "liveness sweep failed");
                    }
                    if let Err(err) = self.commands.sweep_expired().await {
                        error!(error = %err, "command expiry sweep failed");
                    }
                }
            }
        }
        info!("liveness monitor stopped");
    }

    /// One sweep: degrade the quiet, take the silent offline, fail them over.
    pub async fn sweep(&self) -> Result<(), RegistryError> {
        let now = Utc::now();
        let interval =
            chrono::Duration::from_std(self.config.heartbeat_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let degraded_cutoff = now - interval * self.config.degraded_after as i32;
        let offline_cutoff = now - interval * self.config.offline_after as i32;

        let degraded = sqlx::query(
            r#"
            UPDATE agents SET status = 'degraded'
            WHERE status = 'active'
              AND (last_heartbeat IS NULL OR last_heartbeat < $1)
            RETURNING id, name
            "#,
        )
        .bind(degraded_cutoff)
        .fetch_all(self.store.pool())
        .await?;

        for row in &degraded {
            warn!(
                agent = %row.get::<Uuid, _>("id"),
                name = row.get::<String, _>("name").as_str(),
                "agent degraded: heartbeats missing"
            );
        }

        let offline = sqlx::query(
            r#"
            UPDATE agents SET status = 'offline'
            WHERE status = 'degraded'
              AND (last_heartbeat IS NULL OR last_heartbeat < $1)
            RETURNING id, name
            "#,
        )
        .bind(offline_cutoff)
        .fetch_all(self.store.pool())
        .await?;

        for row in &offline {
            let agent_id: Uuid = row.get("id");
            warn!(
                agent = %agent_id,
                name = row.get::<String, _>("name").as_str(),
                "agent offline: failing its assignments over"
            );
            self.hook.on_agent_failure(agent_id).await;
        }

        Ok(())
    }

    /// Called by the heartbeat path when a degraded or offline agent comes
    /// back; the previous status decides whether assignments need topping up.
    pub async fn handle_reactivation(&self, agent_id: Uuid, previous: AgentStatus) {
        if previous == AgentStatus::Offline || previous == AgentStatus::Degraded {
            self.hook.on_agent_recovery(agent_id).await;
        }
    }
}
