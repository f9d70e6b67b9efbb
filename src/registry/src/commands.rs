//! Command fan-out: request/response RPC layered over heartbeat and poll.
//!
//! The control plane records a command with an expiry; agents pick it up on
//! their next heartbeat or poll, run the matching executor and post the
//! result back. A command completes once every targeted agent has answered;
//! a broadcast completes when its expiry elapses.

use chrono::{Duration, Utc};
use icmpmon_model::{Command, CommandResult, CommandStatus, Store};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{CommandResultBody, RegistryError};

const DEFAULT_TTL_SECS: i64 = 300;

/// Store-backed command queue.
#[derive(Clone)]
pub struct CommandService {
    store: Store,
}

impl CommandService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Creates a command. An empty agent list is a broadcast.
    pub async fn create(
        &self,
        command_type: &str,
        target_ip: &str,
        agent_ids: Vec<Uuid>,
        ttl_secs: Option<i64>,
    ) -> Result<Command, RegistryError> {
        if command_type.is_empty() {
            return Err(RegistryError::Validation(
                "command type must not be empty".to_string(),
            ));
        }
        target_ip
            .parse::<std::net::IpAddr>()
            .map_err(|_| RegistryError::Validation(format!("malformed IP: {target_ip}")))?;

        let expires_at = Utc::now() + Duration::seconds(ttl_secs.unwrap_or(DEFAULT_TTL_SECS));
        let agent_ids_json = serde_json::to_value(&agent_ids)?;

        let row = sqlx::query(
            r#"
            INSERT INTO commands (command_type, target_ip, agent_ids, status, expires_at)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING *
            "#,
        )
        .bind(command_type)
        .bind(target_ip)
        .bind(agent_ids_json)
        .bind(expires_at)
        .fetch_one(self.store.pool())
        .await?;

        let command = command_from_row(&row)?;
        info!(command = %command.id, command_type, target_ip, "command created");
        Ok(command)
    }

    pub async fn get(&self, command_id: Uuid) -> Result<Command, RegistryError> {
        let row = sqlx::query("SELECT * FROM commands WHERE id = $1")
            .bind(command_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(RegistryError::CommandNotFound(command_id))?;
        command_from_row(&row)
    }

    /// Live commands addressed to this agent (or broadcast) that it has not
    /// answered yet. Pending commands move to in-flight on first delivery.
    pub async fn pending_for_agent(&self, agent_id: Uuid) -> Result<Vec<Command>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT c.* FROM commands c
            WHERE c.status IN ('pending', 'in_flight')
              AND c.expires_at > now()
              AND NOT EXISTS (
                  SELECT 1 FROM command_results r
                  WHERE r.command_id = c.id AND r.agent_id = $1
              )
            ORDER BY c.created_at
            "#,
        )
        .bind(agent_id)
        .fetch_all(self.store.pool())
        .await?;

        let mut commands = Vec::new();
        for row in &rows {
            let command = command_from_row(row)?;
            if !command.agent_ids.is_empty() && !command.agent_ids.contains(&agent_id) {
                continue;
            }
            commands.push(command);
        }

        if !commands.is_empty() {
            let ids: Vec<Uuid> = commands.iter().map(|c| c.id).collect();
            sqlx::query(
                "UPDATE commands SET status = 'in_flight' WHERE id = ANY($1) AND status = 'pending'",
            )
            .bind(&ids)
            .execute(self.store.pool())
            .await?;
            debug!(agent = %agent_id, commands = commands.len(), "commands handed to agent");
        }

        Ok(commands)
    }

    /// Records one agent's answer and completes the command once every
    /// targeted agent has answered.
    pub async fn record_result(
        &self,
        command_id: Uuid,
        agent_id: Uuid,
        body: &CommandResultBody,
    ) -> Result<(), RegistryError> {
        let command = self.get(command_id).await?;

        sqlx::query(
            r#"
            INSERT INTO command_results (command_id, agent_id, success, error, payload, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (command_id, agent_id) DO UPDATE SET
                success = EXCLUDED.success,
                error = EXCLUDED.error,
                payload = EXCLUDED.payload,
                duration_ms = EXCLUDED.duration_ms
            "#,
        )
        .bind(command_id)
        .bind(agent_id)
        .bind(body.success)
        .bind(&body.error)
        .bind(&body.payload)
        .bind(body.duration_ms)
        .execute(self.store.pool())
        .await?;

        // Broadcasts complete on expiry only; targeted commands complete
        // once every addressee has answered.
        if !command.agent_ids.is_empty() {
            let answered: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM command_results WHERE command_id = $1",
            )
            .bind(command_id)
            .fetch_one(self.store.pool())
            .await?;

            if answered >= command.agent_ids.len() as i64 {
                sqlx::query(
                    "UPDATE commands SET status = 'completed' WHERE id = $1 AND status <> 'expired'",
                )
                .bind(command_id)
                .execute(self.store.pool())
                .await?;
                info!(command = %command_id, "command completed");
            }
        }

        Ok(())
    }

    pub async fn results(&self, command_id: Uuid) -> Result<Vec<CommandResult>, RegistryError> {
        let rows = sqlx::query(
            "SELECT * FROM command_results WHERE command_id = $1 ORDER BY created_at",
        )
        .bind(command_id)
        .fetch_all(self.store.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CommandResult {
                    command_id: row.try_get("command_id").map_err(sqlx_err)?,
                    agent_id: row.try_get("agent_id").map_err(sqlx_err)?,
                    success: row.try_get("success").map_err(sqlx_err)?,
                    error: row.try_get("error").map_err(sqlx_err)?,
                    payload: row.try_get("payload").map_err(sqlx_err)?,
                    duration_ms: row.try_get("duration_ms").map_err(sqlx_err)?,
                    created_at: row.try_get("created_at").map_err(sqlx_err)?,
                })
            })
            .collect()
    }

    /// Expires overdue commands. Broadcasts with at least one answer count
    /// as completed; everything else past its expiry is marked expired.
    pub async fn sweep_expired(&self) -> Result<u64, RegistryError> {
        let completed = sqlx::query(
            r#"
            UPDATE commands SET status = 'completed'
            WHERE status IN ('pending', 'in_flight')
              AND expires_at <= now()
              AND agent_ids = '[]'::jsonb
              AND EXISTS (SELECT 1 FROM command_results r WHERE r.command_id = commands.id)
            "#,
        )
        .execute(self.store.pool())
        .await?;

        let expired = sqlx::query(
            r#"
            UPDATE commands SET status = 'expired'
            WHERE status IN ('pending', 'in_flight') AND expires_at <= now()
            "#,
        )
        .execute(self.store.pool())
        .await?;

        let swept = completed.rows_affected() + expired.rows_affected();
        if swept > 0 {
            debug!(swept, "command sweep finished");
        }
        Ok(swept)
    }
}

fn sqlx_err(err: sqlx::Error) -> RegistryError {
    RegistryError::Database(err)
}

fn command_from_row(row: &PgRow) -> Result<Command, RegistryError> {
    let agent_ids: serde_json::Value = row.try_get("agent_ids").map_err(sqlx_err)?;
    let agent_ids: Vec<Uuid> = serde_json::from_value(agent_ids)?;

    let status: String = row.try_get("status").map_err(sqlx_err)?;
    let status: CommandStatus = status.parse().map_err(RegistryError::Validation)?;

    Ok(Command {
        id: row.try_get("id").map_err(sqlx_err)?,
        command_type: row.try_get("command_type").map_err(sqlx_err)?,
        target_ip: row.try_get("target_ip").map_err(sqlx_err)?,
        agent_ids,
        status,
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
        expires_at: row.try_get("expires_at").map_err(sqlx_err)?,
    })
}
