//! Postgres store: connection pool plus the query surface for the shared
//! catalog entities (tiers, targets, subnets) and the assignment version.
//!
//! Component crates own the queries specific to their domain (registry owns
//! agent rows, assignment owns assignment rows, evaluator owns baselines and
//! states); the row mappers they share live here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::entities::{
    Agent, AgentStatus, Assignment, AssignmentOrigin, ExpectedOutcome, PairState,
    SelectionPolicy, Target, TargetState, Tier,
};
use crate::error::StoreError;

/// Thin wrapper around the Postgres pool; cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connects a bounded pool with per-acquire timeout.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ---- tiers ----

    pub async fn upsert_tier(&self, tier: &Tier) -> Result<(), StoreError> {
        tier.validate().map_err(StoreError::Validation)?;

        let policy = serde_json::to_value(&tier.policy)?;
        let expected = tier
            .expected
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let thresholds = tier
            .thresholds
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO tiers (name, probe_interval_secs, probe_timeout_ms, retries, policy, expected, thresholds)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                probe_interval_secs = EXCLUDED.probe_interval_secs,
                probe_timeout_ms = EXCLUDED.probe_timeout_ms,
                retries = EXCLUDED.retries,
                policy = EXCLUDED.policy,
                expected = EXCLUDED.expected,
                thresholds = EXCLUDED.thresholds
            "#,
        )
        .bind(&tier.name)
        .bind(tier.probe_interval_secs as i32)
        .bind(tier.probe_timeout_ms as i32)
        .bind(tier.retries as i32)
        .bind(policy)
        .bind(expected)
        .bind(thresholds)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_tier(&self, name: &str) -> Result<Tier, StoreError> {
        let row = sqlx::query("SELECT * FROM tiers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("tier {name}")))?;

        tier_from_row(&row)
    }

    pub async fn list_tiers(&self) -> Result<Vec<Tier>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tiers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(tier_from_row).collect()
    }

    /// Deleting a tier still referenced by a target is a validation error.
    pub async fn delete_tier(&self, name: &str) -> Result<(), StoreError> {
        let referenced: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM targets WHERE tier = $1 AND NOT archived",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        if referenced > 0 {
            return Err(StoreError::Validation(format!(
                "tier {name} is referenced by {referenced} active target(s)"
            )));
        }

        let result = sqlx::query("DELETE FROM tiers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tier {name}")));
        }
        Ok(())
    }

    // ---- targets ----

    /// Creates a target. The IP must parse and be unique among non-archived
    /// targets; the tier must exist.
    pub async fn create_target(&self, target: &NewTarget) -> Result<Target, StoreError> {
        target
            .ip
            .parse::<IpAddr>()
            .map_err(|_| StoreError::Validation(format!("malformed IP: {}", target.ip)))?;

        // Existence check up front so a bad tier reference reads as 4xx, not FK noise.
        self.get_tier(&target.tier).await.map_err(|_| {
            StoreError::Validation(format!("tier {} does not exist", target.tier))
        })?;

        let tags = serde_json::to_value(&target.tags)?;
        let expected = target
            .expected
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO targets (ip, tier, tags, expected, state, subnet_id)
            VALUES ($1, $2, $3, $4, 'unknown', $5)
            RETURNING *
            "#,
        )
        .bind(&target.ip)
        .bind(&target.tier)
        .bind(tags)
        .bind(expected)
        .bind(target.subnet_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.constraint() == Some("targets_ip_active_key") => {
                StoreError::Validation(format!("duplicate IP: {}", target.ip))
            }
            _ => StoreError::Database(err),
        })?;

        target_from_row(&row)
    }

    pub async fn get_target(&self, id: Uuid) -> Result<Target, StoreError> {
        let row = sqlx::query("SELECT * FROM targets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("target {id}")))?;

        target_from_row(&row)
    }

    pub async fn list_targets(&self, include_archived: bool) -> Result<Vec<Target>, StoreError> {
        let rows = if include_archived {
            sqlx::query("SELECT * FROM targets ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM targets WHERE NOT archived ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?
        };

        rows.iter().map(target_from_row).collect()
    }

    pub async fn list_targets_in_tier(&self, tier: &str) -> Result<Vec<Target>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM targets WHERE tier = $1 AND NOT archived ORDER BY created_at")
                .bind(tier)
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(target_from_row).collect()
    }

    pub async fn update_target_state(
        &self,
        id: Uuid,
        state: TargetState,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = $2, state_changed_at = now()
            WHERE id = $1 AND state <> $2
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;

        // Zero rows means either no such target or an unchanged state; the
        // latter is a no-op by design, so only surface the former.
        if result.rows_affected() == 0 {
            let exists: i64 = sqlx::query_scalar("SELECT count(*) FROM targets WHERE id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            if exists == 0 {
                return Err(StoreError::NotFound(format!("target {id}")));
            }
        }
        Ok(())
    }

    pub async fn archive_target(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE targets SET archived = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("target {id}")));
        }
        Ok(())
    }

    // ---- subnets ----

    pub async fn create_subnet(
        &self,
        cidr: &str,
        region: &str,
        market: &str,
    ) -> Result<Uuid, StoreError> {
        validate_cidr(cidr)?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO subnets (cidr, region, market)
            VALUES ($1, $2, $3)
            ON CONFLICT (cidr) DO UPDATE SET region = EXCLUDED.region, market = EXCLUDED.market
            RETURNING id
            "#,
        )
        .bind(cidr)
        .bind(region)
        .bind(market)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    // ---- pair states ----

    /// Read-only listing of evaluated pair states; `only_unhealthy` narrows
    /// to pairs that are not up.
    pub async fn list_pair_states(
        &self,
        only_unhealthy: bool,
    ) -> Result<Vec<PairState>, StoreError> {
        let rows = if only_unhealthy {
            sqlx::query(
                "SELECT * FROM agent_target_states WHERE status <> 'up' ORDER BY status_since",
            )
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query("SELECT * FROM agent_target_states ORDER BY status_since")
                .fetch_all(&self.pool)
                .await?
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status")?;
            out.push(PairState {
                agent_id: row.try_get("agent_id")?,
                target_id: row.try_get("target_id")?,
                status: status.parse().map_err(StoreError::Validation)?,
                consecutive_anomalies: row.try_get("consecutive_anomalies")?,
                consecutive_successes: row.try_get("consecutive_successes")?,
                anomaly_start: row.try_get("anomaly_start")?,
                status_since: row.try_get("status_since")?,
                last_latency_ms: row.try_get("last_latency_ms")?,
                last_z_score: row.try_get("last_z_score")?,
                last_packet_loss_pct: row.try_get("last_packet_loss_pct")?,
            });
        }
        Ok(out)
    }

    // ---- assignment version ----

    pub async fn assignment_version(&self) -> Result<i64, StoreError> {
        let version: i64 = sqlx::query_scalar("SELECT version FROM assignment_version WHERE id")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }
}

/// Bumps the process-wide assignment version. Callers mutating assignment
/// rows pass their open transaction so version and rows commit atomically.
pub async fn increment_assignment_version<'e, E>(executor: E) -> Result<i64, StoreError>
where
    E: PgExecutor<'e>,
{
    let version: i64 = sqlx::query_scalar(
        "UPDATE assignment_version SET version = version + 1 WHERE id RETURNING version",
    )
    .fetch_one(executor)
    .await?;
    Ok(version)
}

fn validate_cidr(cidr: &str) -> Result<(), StoreError> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| StoreError::Validation(format!("malformed CIDR: {cidr}")))?;

    let addr: IpAddr = addr
        .parse()
        .map_err(|_| StoreError::Validation(format!("malformed CIDR: {cidr}")))?;
    let max = if addr.is_ipv4() { 32u8 } else { 128u8 };
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| StoreError::Validation(format!("malformed CIDR: {cidr}")))?;
    if prefix > max {
        return Err(StoreError::Validation(format!("malformed CIDR: {cidr}")));
    }
    Ok(())
}

// ---- row mappers (shared with the component crates) ----

pub fn tier_from_row(row: &PgRow) -> Result<Tier, StoreError> {
    let policy: serde_json::Value = row.try_get("policy")?;
    let policy: SelectionPolicy = serde_json::from_value(policy)?;

    let expected: Option<serde_json::Value> = row.try_get("expected")?;
    let expected: Option<ExpectedOutcome> =
        expected.map(serde_json::from_value).transpose()?;

    let thresholds: Option<serde_json::Value> = row.try_get("thresholds")?;
    let thresholds = thresholds.map(serde_json::from_value).transpose()?;

    Ok(Tier {
        name: row.try_get("name")?,
        probe_interval_secs: row.try_get::<i32, _>("probe_interval_secs")? as u32,
        probe_timeout_ms: row.try_get::<i32, _>("probe_timeout_ms")? as u32,
        retries: row.try_get::<i32, _>("retries")? as u32,
        policy,
        expected,
        thresholds,
    })
}

pub fn target_from_row(row: &PgRow) -> Result<Target, StoreError> {
    let tags: serde_json::Value = row.try_get("tags")?;
    let tags: HashMap<String, String> = serde_json::from_value(tags)?;

    let expected: Option<serde_json::Value> = row.try_get("expected")?;
    let expected: Option<ExpectedOutcome> =
        expected.map(serde_json::from_value).transpose()?;

    let state: String = row.try_get("state")?;
    let state = state.parse().map_err(StoreError::Validation)?;

    Ok(Target {
        id: row.try_get("id")?,
        ip: row.try_get("ip")?,
        tier: row.try_get("tier")?,
        tags,
        expected,
        state,
        state_changed_at: row.try_get::<DateTime<Utc>, _>("state_changed_at")?,
        subnet_id: row.try_get("subnet_id")?,
        archived: row.try_get("archived")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

pub fn agent_from_row(row: &PgRow) -> Result<Agent, StoreError> {
    let tags: serde_json::Value = row.try_get("tags")?;
    let tags: HashMap<String, String> = serde_json::from_value(tags)?;

    let executors: serde_json::Value = row.try_get("executors")?;
    let executors: Vec<String> = serde_json::from_value(executors)?;

    let status: String = row.try_get("status")?;
    let status: AgentStatus = status.parse().map_err(StoreError::Validation)?;

    Ok(Agent {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        region: row.try_get("region")?,
        provider: row.try_get("provider")?,
        location: row.try_get("location")?,
        tags,
        executors,
        max_targets: row.try_get("max_targets")?,
        status,
        version: row.try_get("version")?,
        public_ip: row.try_get("public_ip")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        assignment_version_seen: row.try_get("assignment_version_seen")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

pub fn assignment_from_row(row: &PgRow) -> Result<Assignment, StoreError> {
    let origin: String = row.try_get("origin")?;
    let origin: AssignmentOrigin = origin.parse().map_err(StoreError::Validation)?;

    Ok(Assignment {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        agent_id: row.try_get("agent_id")?,
        tier: row.try_get("tier")?,
        origin,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

/// Input shape for target creation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewTarget {
    pub ip: String,
    pub tier: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub expected: Option<ExpectedOutcome>,
    #[serde(default)]
    pub subnet_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_validation() {
        assert!(validate_cidr("10.0.0.0/24").is_ok());
        assert!(validate_cidr("2001:db8::/48").is_ok());
        assert!(validate_cidr("10.0.0.0/33").is_err());
        assert!(validate_cidr("10.0.0.0").is_err());
        assert!(validate_cidr("not-an-ip/8").is_err());
    }
}
