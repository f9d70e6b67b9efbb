//! Store-backed assignment maintenance.
//!
//! Every mutating operation runs in one transaction and bumps the
//! process-wide assignment version before committing, so readers always
//! observe a consistent (version, rows) pair.

use std::collections::{HashMap, HashSet};

use icmpmon_model::store::{assignment_from_row, increment_assignment_version, agent_from_row};
use icmpmon_model::{
    Agent, AssignmentOrigin, AssignmentView, StoreError, Store, Target, Tier,
};
use sqlx::{PgConnection, Row};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::selection::{eligible_agents, ip_hash, select};

/// Errors from rebalancer operations.
#[derive(Debug, Error)]
pub enum AssignError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Produces and maintains the target-to-agent mapping.
#[derive(Clone)]
pub struct Rebalancer {
    store: Store,
}

impl Rebalancer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Recomputes every assignment from scratch: clears the active set,
    /// selects per target, bulk-inserts in chunks and bumps the version.
    /// Returns the number of assignments produced.
    pub async fn materialize_all(&self) -> Result<usize, AssignError> {
        let agents = self.load_active_agents().await?;
        let tiers: HashMap<String, Tier> = self
            .store
            .list_tiers()
            .await?
            .into_iter()
            .map(|tier| (tier.name.clone(), tier))
            .collect();
        let targets = self.store.list_targets(false).await?;

        let mut target_ids = Vec::new();
        let mut agent_ids = Vec::new();
        let mut tier_names = Vec::new();
        for target in &targets {
            let Some(tier) = tiers.get(&target.tier) else {
                warn!(
                    target = %target.id,
                    tier = target.tier.as_str(),
                    "target references a missing tier, skipping"
                );
                continue;
            };
            let eligible = eligible_agents(&agents, &tier.policy);
            for agent in select(&target.ip, &eligible, &tier.policy) {
                target_ids.push(target.id);
                agent_ids.push(agent.id);
                tier_names.push(tier.name.clone());
            }
        }

        let produced = target_ids.len();
        let mut tx = self.store.pool().begin().await?;
        sqlx::query("DELETE FROM assignments").execute(&mut *tx).await?;

        for start in (0..produced).step_by(1_000) {
            let end = (start + 1_000).min(produced);
            sqlx::query(
                r#"
                INSERT INTO assignments (target_id, agent_id, tier, origin)
                SELECT t, a, tier, 'initial'
                FROM UNNEST($1::uuid[], $2::uuid[], $3::text[]) AS u(t, a, tier)
                "#,
            )
            .bind(&target_ids[start..end])
            .bind(&agent_ids[start..end])
            .bind(&tier_names[start..end])
            .execute(&mut *tx)
            .await?;
        }

        let version = increment_assignment_version(&mut *tx).await?;
        tx.commit().await?;

        info!(assignments = produced, version, "assignments materialized");
        Ok(produced)
    }

    /// Replaces every assignment of a failed agent with the next eligible
    /// agent by hash order, recording failover history. One version bump
    /// covers the whole operation.
    pub async fn handle_agent_failure(&self, agent_id: Uuid) -> Result<usize, AssignError> {
        let agents: Vec<Agent> = self
            .load_active_agents()
            .await?
            .into_iter()
            .filter(|agent| agent.id != agent_id)
            .collect();
        let tiers: HashMap<String, Tier> = self
            .store
            .list_tiers()
            .await?
            .into_iter()
            .map(|tier| (tier.name.clone(), tier))
            .collect();

        let mut tx = self.store.pool().begin().await?;

        let orphaned = sqlx::query("SELECT * FROM assignments WHERE agent_id = $1 FOR UPDATE")
            .bind(agent_id)
            .fetch_all(&mut *tx)
            .await?;
        let orphaned: Vec<_> = orphaned
            .iter()
            .map(assignment_from_row)
            .collect::<Result<_, _>>()?;

        if orphaned.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let affected_targets: Vec<Uuid> =
            orphaned.iter().map(|a: &icmpmon_model::Assignment| a.target_id).collect();
        let targets = self
            .load_targets_by_id(&mut tx, &affected_targets)
            .await?;
        let peers = self
            .load_peer_assignments(&mut tx, &affected_targets)
            .await?;

        let mut moved = 0usize;
        for assignment in &orphaned {
            let Some(target) = targets.get(&assignment.target_id) else {
                continue;
            };
            let Some(tier) = tiers.get(&assignment.tier) else {
                warn!(
                    target = %assignment.target_id,
                    tier = assignment.tier.as_str(),
                    "orphaned assignment references a missing tier"
                );
                continue;
            };

            let already: HashSet<Uuid> = peers
                .get(&assignment.target_id)
                .cloned()
                .unwrap_or_default();
            let eligible = eligible_agents(&agents, &tier.policy);
            if let Some(replacement) = plan_failover(&target.ip, &eligible, &already) {
                sqlx::query(
                    r#"
                    INSERT INTO assignments (target_id, agent_id, tier, origin)
                    VALUES ($1, $2, $3, 'failover')
                    ON CONFLICT (target_id, agent_id) DO NOTHING
                    "#,
                )
                .bind(assignment.target_id)
                .bind(replacement.id)
                .bind(&assignment.tier)
                .execute(&mut *tx)
                .await?;
                record_history(
                    &mut tx,
                    assignment.target_id,
                    replacement.id,
                    &assignment.tier,
                    AssignmentOrigin::Failover,
                    "added",
                )
                .await?;
                moved += 1;
            } else {
                warn!(
                    target = %assignment.target_id,
                    "no eligible replacement for failed agent, coverage shrinks"
                );
            }

            sqlx::query("DELETE FROM assignments WHERE id = $1")
                .bind(assignment.id)
                .execute(&mut *tx)
                .await?;
            record_history(
                &mut tx,
                assignment.target_id,
                agent_id,
                &assignment.tier,
                AssignmentOrigin::Failover,
                "removed",
            )
            .await?;
        }

        let version = increment_assignment_version(&mut *tx).await?;
        tx.commit().await?;

        info!(agent = %agent_id, moved, version, "agent failure handled");
        Ok(moved)
    }

    /// Folds a recovered agent back in: for every tier it is eligible for,
    /// tops up targets sitting below their required assignment count.
    pub async fn handle_agent_recovery(&self, agent_id: Uuid) -> Result<usize, AssignError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        let agent = agent_from_row(&row)?;
        if !agent.is_selectable() {
            return Ok(0);
        }

        let tiers = self.store.list_tiers().await?;
        let agent_pool = vec![agent.clone()];

        let mut tx = self.store.pool().begin().await?;
        let mut added = 0usize;

        for tier in &tiers {
            if eligible_agents(&agent_pool, &tier.policy).is_empty() {
                continue;
            }

            let targets = self.store.list_targets_in_tier(&tier.name).await?;
            if targets.is_empty() {
                continue;
            }

            let counts: HashMap<Uuid, i64> = sqlx::query(
                "SELECT target_id, count(*) AS n FROM assignments WHERE tier = $1 GROUP BY target_id",
            )
            .bind(&tier.name)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| (row.get::<Uuid, _>("target_id"), row.get::<i64, _>("n")))
            .collect();

            let mine: HashSet<Uuid> = sqlx::query(
                "SELECT target_id FROM assignments WHERE agent_id = $1 AND tier = $2",
            )
            .bind(agent_id)
            .bind(&tier.name)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get::<Uuid, _>("target_id"))
            .collect();

            for target in &targets {
                if mine.contains(&target.id) {
                    continue;
                }
                let have = counts.get(&target.id).copied().unwrap_or(0) as usize;
                let wants_more = match tier.policy.strategy {
                    icmpmon_model::SelectionStrategy::All => true,
                    icmpmon_model::SelectionStrategy::Distributed => {
                        have < tier.policy.count.max(1)
                    }
                };
                if !wants_more {
                    continue;
                }

                sqlx::query(
                    r#"
                    INSERT INTO assignments (target_id, agent_id, tier, origin)
                    VALUES ($1, $2, $3, 'rebalance')
                    ON CONFLICT (target_id, agent_id) DO NOTHING
                    "#,
                )
                .bind(target.id)
                .bind(agent_id)
                .bind(&tier.name)
                .execute(&mut *tx)
                .await?;
                record_history(
                    &mut tx,
                    target.id,
                    agent_id,
                    &tier.name,
                    AssignmentOrigin::Rebalance,
                    "added",
                )
                .await?;
                added += 1;
            }
        }

        if added > 0 {
            let version = increment_assignment_version(&mut *tx).await?;
            tx.commit().await?;
            info!(agent = %agent_id, added, version, "agent recovery handled");
        } else {
            tx.rollback().await?;
        }

        Ok(added)
    }

    /// Assigns one freshly created target without a full rebalance.
    pub async fn assign_target(&self, target: &Target) -> Result<usize, AssignError> {
        let tier = self.store.get_tier(&target.tier).await?;
        let agents = self.load_active_agents().await?;
        let eligible = eligible_agents(&agents, &tier.policy);
        let selected = select(&target.ip, &eligible, &tier.policy);
        if selected.is_empty() {
            warn!(target = %target.id, "no eligible agents for new target");
            return Ok(0);
        }

        let mut tx = self.store.pool().begin().await?;
        for agent in &selected {
            sqlx::query(
                r#"
                INSERT INTO assignments (target_id, agent_id, tier, origin)
                VALUES ($1, $2, $3, 'initial')
                ON CONFLICT (target_id, agent_id) DO NOTHING
                "#,
            )
            .bind(target.id)
            .bind(agent.id)
            .bind(&tier.name)
            .execute(&mut *tx)
            .await?;
        }
        increment_assignment_version(&mut *tx).await?;
        tx.commit().await?;
        Ok(selected.len())
    }

    /// Read-only listing of active assignments, optionally narrowed.
    pub async fn list_assignments(
        &self,
        agent_id: Option<Uuid>,
        target_id: Option<Uuid>,
    ) -> Result<Vec<icmpmon_model::Assignment>, AssignError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM assignments
            WHERE ($1::uuid IS NULL OR agent_id = $1)
              AND ($2::uuid IS NULL OR target_id = $2)
            ORDER BY created_at
            "#,
        )
        .bind(agent_id)
        .bind(target_id)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .iter()
            .map(assignment_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Current assignments of one agent, flattened for the schedule poll.
    pub async fn assignments_view_for_agent(
        &self,
        agent_id: Uuid,
    ) -> Result<Vec<AssignmentView>, AssignError> {
        let rows = sqlx::query(
            r#"
            SELECT a.target_id, a.agent_id, a.tier, t.ip
            FROM assignments a
            JOIN targets t ON t.id = a.target_id
            WHERE a.agent_id = $1 AND NOT t.archived
            ORDER BY a.tier, t.ip
            "#,
        )
        .bind(agent_id)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| AssignmentView {
                target_id: row.get("target_id"),
                agent_id: row.get("agent_id"),
                ip: row.get("ip"),
                tier: row.get("tier"),
                executor: None,
            })
            .collect())
    }

    /// All active agents in a fixed order; the selection hash walks this
    /// order, so it must be stable across replicas.
    async fn load_active_agents(&self) -> Result<Vec<Agent>, AssignError> {
        let rows = sqlx::query("SELECT * FROM agents WHERE status = 'active' ORDER BY id")
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows
            .iter()
            .map(agent_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn load_targets_by_id(
        &self,
        tx: &mut PgConnection,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Target>, AssignError> {
        let rows = sqlx::query("SELECT * FROM targets WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(tx)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let target = icmpmon_model::store::target_from_row(row)?;
            out.insert(target.id, target);
        }
        Ok(out)
    }

    /// Remaining assignees per target, excluding nothing; callers filter.
    async fn load_peer_assignments(
        &self,
        tx: &mut PgConnection,
        targets: &[Uuid],
    ) -> Result<HashMap<Uuid, HashSet<Uuid>>, AssignError> {
        let rows = sqlx::query(
            "SELECT target_id, agent_id FROM assignments WHERE target_id = ANY($1)",
        )
        .bind(targets)
        .fetch_all(tx)
        .await?;

        let mut out: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for row in &rows {
            out.entry(row.get("target_id"))
                .or_default()
                .insert(row.get("agent_id"));
        }
        Ok(out)
    }
}

/// Picks the failover replacement: the next eligible agent by hash order
/// that is not already assigned to the target.
pub fn plan_failover<'a>(
    ip: &str,
    eligible: &[&'a Agent],
    already_assigned: &HashSet<Uuid>,
) -> Option<&'a Agent> {
    if eligible.is_empty() {
        return None;
    }
    let start = (ip_hash(ip) as usize) % eligible.len();
    (0..eligible.len())
        .map(|offset| eligible[(start + offset) % eligible.len()])
        .find(|agent| !already_assigned.contains(&agent.id))
}

async fn record_history(
    tx: &mut PgConnection,
    target_id: Uuid,
    agent_id: Uuid,
    tier: &str,
    origin: AssignmentOrigin,
    event: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO assignment_history (target_id, agent_id, tier, origin, event)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(target_id)
    .bind(agent_id)
    .bind(tier)
    .bind(origin.as_str())
    .bind(event)
    .execute(tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use icmpmon_model::AgentStatus;
    use std::collections::HashMap as StdHashMap;

    fn agent(name: &str, region: &str) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            region: region.to_string(),
            provider: "aws".to_string(),
            location: String::new(),
            tags: StdHashMap::new(),
            executors: vec!["icmp_ping".to_string()],
            max_targets: 10_000,
            status: AgentStatus::Active,
            version: None,
            public_ip: None,
            last_heartbeat: None,
            assignment_version_seen: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn failover_picks_next_unassigned_agent_by_hash_order() {
        let b = agent("b", "us-east");
        let c = agent("c", "us-west");
        let d = agent("d", "eu-west");
        let eligible = vec![&b, &c, &d];

        // B already probes the target; the replacement must be the first
        // agent after the hash start that is neither B nor assigned.
        let already: HashSet<Uuid> = [b.id].into_iter().collect();
        let ip = "198.51.100.23";
        let replacement = plan_failover(ip, &eligible, &already).unwrap();
        assert_ne!(replacement.id, b.id);

        let start = (ip_hash(ip) as usize) % eligible.len();
        let expected = (0..eligible.len())
            .map(|offset| eligible[(start + offset) % eligible.len()])
            .find(|a| a.id != b.id)
            .unwrap();
        assert_eq!(replacement.id, expected.id);
    }

    #[test]
    fn failover_returns_none_when_everyone_is_assigned() {
        let b = agent("b", "us-east");
        let eligible = vec![&b];
        let already: HashSet<Uuid> = [b.id].into_iter().collect();
        assert!(plan_failover("10.0.0.1", &eligible, &already).is_none());
    }

    #[test]
    fn failover_with_empty_pool_is_none() {
        let already = HashSet::new();
        assert!(plan_failover("10.0.0.1", &[], &already).is_none());
    }
}
