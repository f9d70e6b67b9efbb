//! Agent registration and heartbeat ingestion.

use chrono::Utc;
use icmpmon_model::store::agent_from_row;
use icmpmon_model::{Agent, AgentStatus, Store};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::commands::CommandService;
use crate::types::{AgentRegistration, Heartbeat, HeartbeatResponse, RegistryError};

/// Store-backed agent registry.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Store,
    commands: CommandService,
}

impl AgentRegistry {
    pub fn new(store: Store) -> Self {
        let commands = CommandService::new(store.clone());
        Self { store, commands }
    }

    pub fn commands(&self) -> &CommandService {
        &self.commands
    }

    /// Registers an agent, idempotently by name: an existing record gets its
    /// mutable metadata replaced and snaps back to active. Returns the
    /// stable agent id.
    pub async fn register(&self, reg: &AgentRegistration) -> Result<Uuid, RegistryError> {
        if reg.name.trim().is_empty() {
            return Err(RegistryError::Validation(
                "agent name must not be empty".to_string(),
            ));
        }
        if reg.max_targets <= 0 {
            return Err(RegistryError::Validation(
                "max_targets must be positive".to_string(),
            ));
        }

        let tags = serde_json::to_value(&reg.tags)?;
        let executors = serde_json::to_value(&reg.executors)?;

        let row = sqlx::query(
            r#"
            INSERT INTO agents
                (name, region, location, provider, tags, executors,
                 max_targets, status, version, public_ip, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8, $9, now())
            ON CONFLICT (name) DO UPDATE SET
                region = EXCLUDED.region,
                location = EXCLUDED.location,
                provider = EXCLUDED.provider,
                tags = EXCLUDED.tags,
                executors = EXCLUDED.executors,
                max_targets = EXCLUDED.max_targets,
                status = 'active',
                version = EXCLUDED.version,
                public_ip = EXCLUDED.public_ip,
                last_heartbeat = now()
            RETURNING id
            "#,
        )
        .bind(&reg.name)
        .bind(&reg.region)
        .bind(&reg.location)
        .bind(&reg.provider)
        .bind(tags)
        .bind(executors)
        .bind(reg.max_targets)
        .bind(&reg.version)
        .bind(&reg.public_ip)
        .fetch_one(self.store.pool())
        .await?;

        let agent_id: Uuid = row.get("id");
        info!(agent = reg.name.as_str(), id = %agent_id, "agent registered");
        Ok(agent_id)
    }

    /// Ingests one heartbeat: persists the runtime counters, reactivates a
    /// degraded or offline agent, and answers with the staleness signal and
    /// any pending commands. Returns the previous status alongside so the
    /// caller can trigger a recovery rebalance.
    pub async fn heartbeat(
        &self,
        agent_id: Uuid,
        hb: &Heartbeat,
    ) -> Result<(HeartbeatResponse, AgentStatus), RegistryError> {
        // The self-join sees the statement snapshot, so prev.status is the
        // status before this update.
        let row = sqlx::query(
            r#"
            UPDATE agents SET
                last_heartbeat = now(),
                queue_depth = $2,
                shipped_total = $3,
                failed_total = $4,
                memory_bytes = $5,
                task_count = $6,
                assignment_version_seen = $7,
                public_ip = COALESCE($8, agents.public_ip),
                status = CASE WHEN agents.status IN ('degraded', 'offline')
                              THEN 'active' ELSE agents.status END
            FROM (SELECT id, status FROM agents WHERE id = $1) prev
            WHERE agents.id = prev.id AND agents.status <> 'archived'
            RETURNING prev.status AS previous_status
            "#,
        )
        .bind(agent_id)
        .bind(hb.queue_depth)
        .bind(hb.shipped_total)
        .bind(hb.failed_total)
        .bind(hb.memory_bytes)
        .bind(hb.task_count)
        .bind(hb.assignment_version_seen)
        .bind(&hb.public_ip)
        .fetch_optional(self.store.pool())
        .await?;

        let Some(row) = row else {
            return Err(RegistryError::AgentNotFound(agent_id));
        };
        let previous: String = row.get("previous_status");
        let previous: AgentStatus = previous.parse().map_err(RegistryError::Validation)?;

        let version = self.store.assignment_version().await?;
        let commands = self.commands.pending_for_agent(agent_id).await?;

        if previous != AgentStatus::Active {
            warn!(agent = %agent_id, from = %previous, "agent reactivated by heartbeat");
        }

        Ok((
            HeartbeatResponse {
                acknowledged: true,
                assignment_stale: version > hb.assignment_version_seen,
                assignment_version: version,
                commands,
            },
            previous,
        ))
    }

    pub async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, RegistryError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(RegistryError::AgentNotFound(agent_id))?;
        Ok(agent_from_row(&row)?)
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, RegistryError> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY name")
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows
            .iter()
            .map(agent_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Operator archive: the agent leaves selection but its history stays.
    pub async fn archive_agent(&self, agent_id: Uuid) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE agents SET status = 'archived' WHERE id = $1")
            .bind(agent_id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::AgentNotFound(agent_id));
        }
        info!(agent = %agent_id, "agent archived");
        Ok(())
    }

    pub async fn set_status(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE agents SET status = $2 WHERE id = $1")
            .bind(agent_id)
            .bind(status.as_str())
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::AgentNotFound(agent_id));
        }
        Ok(())
    }
}
