//! The evaluator worker: one cycle every `interval` turns the recent probe
//! window into pair states and baselines.
//!
//! Each cycle issues three bulk queries (window stats, baselines, states),
//! evaluates every pair in memory and writes back only what changed, in two
//! bulk upserts.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use icmpmon_model::{AlertThresholds, Baseline, PairState, Store, StoreError};
use sqlx::Row;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::evaluate::{
    advance_state, classify, create_baseline, refresh_baseline, z_score, PairWindowStats,
};
use crate::metrics;

/// Errors from evaluation cycles.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Operational knobs for the evaluator.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub interval: Duration,
    pub evaluation_window: Duration,
    pub baseline_window: Duration,
    pub min_samples_for_baseline: i64,
    pub consecutive_failures_for_down: i32,
    pub consecutive_successes_for_up: i32,
    pub thresholds: AlertThresholds,
    /// EMA weight of fresh stats when refreshing a baseline
    pub baseline_ema_alpha: f64,
    /// Minimum age before a baseline is refreshed again
    pub baseline_refresh_interval: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            evaluation_window: Duration::from_secs(300),
            baseline_window: Duration::from_secs(7 * 24 * 3600),
            min_samples_for_baseline: 100,
            consecutive_failures_for_down: 3,
            consecutive_successes_for_up: 3,
            thresholds: AlertThresholds::default(),
            baseline_ema_alpha: 0.2,
            baseline_refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// Periodic worker computing pair health from recent probes.
pub struct Evaluator {
    store: Store,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(store: Store, config: EvaluatorConfig) -> Self {
        Self { store, config }
    }

    /// Runs cycles until cancellation.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "evaluator started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let timer = metrics::CYCLE_SECONDS.start_timer();
                    match self.run_cycle().await {
                        Ok(evaluated) => {
                            debug!(pairs = evaluated, "evaluation cycle finished");
                        }
                        Err(err) => {
                            error!(error = %err, "evaluation cycle failed");
                        }
                    }
                    timer.observe_duration();
                }
            }
        }
        info!("evaluator stopped");
    }

    /// One full evaluation cycle. Returns the number of pairs examined.
    pub async fn run_cycle(&self) -> Result<usize, EvalError> {
        let now = Utc::now();
        let window_start = now
            - chrono::Duration::from_std(self.config.evaluation_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let stats = self.fetch_window_stats(window_start).await?;
        if stats.is_empty() {
            return Ok(0);
        }

        let agent_ids: Vec<Uuid> = stats.iter().map(|s| s.agent_id).collect();
        let target_ids: Vec<Uuid> = stats.iter().map(|s| s.target_id).collect();

        let mut baselines = self.fetch_baselines(&agent_ids, &target_ids).await?;
        let mut states = self.fetch_states(&agent_ids, &target_ids).await?;
        let tier_thresholds = self.fetch_tier_thresholds().await?;
        let tiers_by_pair = self.fetch_pair_tiers(&target_ids).await?;

        let mut changed_states: Vec<PairState> = Vec::new();
        let mut written_baselines: Vec<Baseline> = Vec::new();

        for window in &stats {
            let key = (window.agent_id, window.target_id);
            let thresholds = tiers_by_pair
                .get(&window.target_id)
                .and_then(|tier| tier_thresholds.get(tier))
                .cloned()
                .unwrap_or_else(|| self.config.thresholds.clone());

            let baseline = baselines.get(&key);
            let z = z_score(window.avg_latency_ms, baseline);
            let level = classify(window, z, &thresholds);

            let mut state = states
                .remove(&key)
                .unwrap_or_else(|| PairState::new(window.agent_id, window.target_id, now));
            let changed = advance_state(
                &mut state,
                level,
                z,
                window,
                now,
                &thresholds,
                self.config.consecutive_failures_for_down,
                self.config.consecutive_successes_for_up,
            );
            if changed {
                changed_states.push(state);
            }

            match baselines.get_mut(&key) {
                None => {
                    if let Some(created) =
                        create_baseline(window, self.config.min_samples_for_baseline, now)
                    {
                        baselines.insert(key, created.clone());
                        written_baselines.push(created);
                    }
                }
                Some(existing) => {
                    let refresh_due = now.signed_duration_since(existing.last_updated)
                        >= chrono::Duration::from_std(self.config.baseline_refresh_interval)
                            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
                    if refresh_due
                        && refresh_baseline(existing, window, self.config.baseline_ema_alpha, now)
                    {
                        written_baselines.push(existing.clone());
                    }
                }
            }
        }

        metrics::PAIRS_EVALUATED.inc_by(stats.len() as u64);
        self.upsert_states(&changed_states).await?;
        self.upsert_baselines(&written_baselines).await?;

        if !changed_states.is_empty() || !written_baselines.is_empty() {
            debug!(
                pairs = stats.len(),
                state_changes = changed_states.len(),
                baselines = written_baselines.len(),
                "evaluation cycle wrote updates"
            );
        }
        Ok(stats.len())
    }

    /// Query 1: window statistics for every pair with a recent probe.
    async fn fetch_window_stats(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PairWindowStats>, EvalError> {
        let rows = sqlx::query(
            r#"
            SELECT
                agent_id,
                target_id,
                count(*) FILTER (WHERE success) AS success_count,
                count(*) AS total_count,
                avg(avg_ms) AS avg_latency_ms,
                percentile_cont(0.5) WITHIN GROUP (ORDER BY avg_ms) AS p50_ms,
                percentile_cont(0.95) WITHIN GROUP (ORDER BY avg_ms) AS p95_ms,
                percentile_cont(0.99) WITHIN GROUP (ORDER BY avg_ms) AS p99_ms,
                max(avg_ms) AS max_ms,
                stddev_samp(avg_ms) AS stddev_ms,
                avg(packet_loss_pct) AS packet_loss_pct,
                max(time) AS last_probe_time
            FROM probe_results
            WHERE time > $1
            GROUP BY agent_id, target_id
            "#,
        )
        .bind(since)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| PairWindowStats {
                agent_id: row.get("agent_id"),
                target_id: row.get("target_id"),
                success_count: row.get("success_count"),
                total_count: row.get("total_count"),
                avg_latency_ms: row.get("avg_latency_ms"),
                p50_ms: row.get("p50_ms"),
                p95_ms: row.get("p95_ms"),
                p99_ms: row.get("p99_ms"),
                max_ms: row.get("max_ms"),
                stddev_ms: row.get("stddev_ms"),
                packet_loss_pct: row.get("packet_loss_pct"),
                last_probe_time: row.get("last_probe_time"),
            })
            .collect())
    }

    /// Query 2: current baselines for the pairs under evaluation.
    async fn fetch_baselines(
        &self,
        agent_ids: &[Uuid],
        target_ids: &[Uuid],
    ) -> Result<HashMap<(Uuid, Uuid), Baseline>, EvalError> {
        let rows = sqlx::query(
            r#"
            SELECT b.*
            FROM baselines b
            JOIN UNNEST($1::uuid[], $2::uuid[]) AS p(agent_id, target_id)
              ON b.agent_id = p.agent_id AND b.target_id = p.target_id
            "#,
        )
        .bind(agent_ids)
        .bind(target_ids)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let baseline = Baseline {
                    agent_id: row.get("agent_id"),
                    target_id: row.get("target_id"),
                    p50_ms: row.get("p50_ms"),
                    p95_ms: row.get("p95_ms"),
                    p99_ms: row.get("p99_ms"),
                    stddev_ms: row.get("stddev_ms"),
                    sample_count: row.get("sample_count"),
                    first_seen: row.get("first_seen"),
                    last_updated: row.get("last_updated"),
                };
                ((baseline.agent_id, baseline.target_id), baseline)
            })
            .collect())
    }

    /// Query 3: current states for the pairs under evaluation.
    async fn fetch_states(
        &self,
        agent_ids: &[Uuid],
        target_ids: &[Uuid],
    ) -> Result<HashMap<(Uuid, Uuid), PairState>, EvalError> {
        let rows = sqlx::query(
            r#"
            SELECT s.*
            FROM agent_target_states s
            JOIN UNNEST($1::uuid[], $2::uuid[]) AS p(agent_id, target_id)
              ON s.agent_id = p.agent_id AND s.target_id = p.target_id
            "#,
        )
        .bind(agent_ids)
        .bind(target_ids)
        .fetch_all(self.store.pool())
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.get("status");
            let status = status.parse().map_err(StoreError::Validation)?;
            let state = PairState {
                agent_id: row.get("agent_id"),
                target_id: row.get("target_id"),
                status,
                consecutive_anomalies: row.get("consecutive_anomalies"),
                consecutive_successes: row.get("consecutive_successes"),
                anomaly_start: row.get("anomaly_start"),
                status_since: row.get("status_since"),
                last_latency_ms: row.get("last_latency_ms"),
                last_z_score: row.get("last_z_score"),
                last_packet_loss_pct: row.get("last_packet_loss_pct"),
            };
            out.insert((state.agent_id, state.target_id), state);
        }
        Ok(out)
    }

    async fn fetch_tier_thresholds(
        &self,
    ) -> Result<HashMap<String, AlertThresholds>, EvalError> {
        let tiers = self.store.list_tiers().await?;
        Ok(tiers
            .into_iter()
            .filter_map(|tier| tier.thresholds.clone().map(|t| (tier.name, t)))
            .collect())
    }

    async fn fetch_pair_tiers(
        &self,
        target_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, String>, EvalError> {
        let rows = sqlx::query("SELECT id, tier FROM targets WHERE id = ANY($1)")
            .bind(target_ids)
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<Uuid, _>("id"), row.get::<String, _>("tier")))
            .collect())
    }

    async fn upsert_states(&self, states: &[PairState]) -> Result<(), EvalError> {
        if states.is_empty() {
            return Ok(());
        }

        let agent_ids: Vec<Uuid> = states.iter().map(|s| s.agent_id).collect();
        let target_ids: Vec<Uuid> = states.iter().map(|s| s.target_id).collect();
        let statuses: Vec<String> = states.iter().map(|s| s.status.as_str().to_string()).collect();
        let anomalies: Vec<i32> = states.iter().map(|s| s.consecutive_anomalies).collect();
        let successes: Vec<i32> = states.iter().map(|s| s.consecutive_successes).collect();
        let anomaly_starts: Vec<Option<DateTime<Utc>>> =
            states.iter().map(|s| s.anomaly_start).collect();
        let status_since: Vec<DateTime<Utc>> = states.iter().map(|s| s.status_since).collect();
        let latencies: Vec<Option<f64>> = states.iter().map(|s| s.last_latency_ms).collect();
        let z_scores: Vec<Option<f64>> = states.iter().map(|s| s.last_z_score).collect();
        let losses: Vec<Option<f64>> = states.iter().map(|s| s.last_packet_loss_pct).collect();

        sqlx::query(
            r#"
            INSERT INTO agent_target_states
                (agent_id, target_id, status, consecutive_anomalies,
                 consecutive_successes, anomaly_start, status_since,
                 last_latency_ms, last_z_score, last_packet_loss_pct)
            SELECT * FROM UNNEST(
                $1::uuid[], $2::uuid[], $3::text[], $4::int4[], $5::int4[],
                $6::timestamptz[], $7::timestamptz[], $8::float8[],
                $9::float8[], $10::float8[]
            )
            ON CONFLICT (agent_id, target_id) DO UPDATE SET
                status = EXCLUDED.status,
                consecutive_anomalies = EXCLUDED.consecutive_anomalies,
                consecutive_successes = EXCLUDED.consecutive_successes,
                anomaly_start = EXCLUDED.anomaly_start,
                status_since = EXCLUDED.status_since,
                last_latency_ms = EXCLUDED.last_latency_ms,
                last_z_score = EXCLUDED.last_z_score,
                last_packet_loss_pct = EXCLUDED.last_packet_loss_pct
            "#,
        )
        .bind(&agent_ids)
        .bind(&target_ids)
        .bind(&statuses)
        .bind(&anomalies)
        .bind(&successes)
        .bind(&anomaly_starts)
        .bind(&status_since)
        .bind(&latencies)
        .bind(&z_scores)
        .bind(&losses)
        .execute(self.store.pool())
        .await?;

        metrics::STATES_CHANGED.inc_by(states.len() as u64);
        Ok(())
    }

    async fn upsert_baselines(&self, baselines: &[Baseline]) -> Result<(), EvalError> {
        if baselines.is_empty() {
            return Ok(());
        }

        let agent_ids: Vec<Uuid> = baselines.iter().map(|b| b.agent_id).collect();
        let target_ids: Vec<Uuid> = baselines.iter().map(|b| b.target_id).collect();
        let p50: Vec<f64> = baselines.iter().map(|b| b.p50_ms).collect();
        let p95: Vec<f64> = baselines.iter().map(|b| b.p95_ms).collect();
        let p99: Vec<f64> = baselines.iter().map(|b| b.p99_ms).collect();
        let stddev: Vec<f64> = baselines.iter().map(|b| b.stddev_ms).collect();
        let samples: Vec<i64> = baselines.iter().map(|b| b.sample_count).collect();
        let first_seen: Vec<DateTime<Utc>> = baselines.iter().map(|b| b.first_seen).collect();
        let last_updated: Vec<DateTime<Utc>> =
            baselines.iter().map(|b| b.last_updated).collect();

        // Guards keep updates monotonic even against a concurrent writer:
        // the sample count never shrinks and last_updated never rewinds.
        sqlx::query(
            r#"
            INSERT INTO baselines
                (agent_id, target_id, p50_ms, p95_ms, p99_ms, stddev_ms,
                 sample_count, first_seen, last_updated)
            SELECT * FROM UNNEST(
                $1::uuid[], $2::uuid[], $3::float8[], $4::float8[],
                $5::float8[], $6::float8[], $7::int8[], $8::timestamptz[],
                $9::timestamptz[]
            )
            ON CONFLICT (agent_id, target_id) DO UPDATE SET
                p50_ms = EXCLUDED.p50_ms,
                p95_ms = EXCLUDED.p95_ms,
                p99_ms = EXCLUDED.p99_ms,
                stddev_ms = EXCLUDED.stddev_ms,
                sample_count = GREATEST(baselines.sample_count, EXCLUDED.sample_count),
                last_updated = GREATEST(baselines.last_updated, EXCLUDED.last_updated)
            "#,
        )
        .bind(&agent_ids)
        .bind(&target_ids)
        .bind(&p50)
        .bind(&p95)
        .bind(&p99)
        .bind(&stddev)
        .bind(&samples)
        .bind(&first_seen)
        .bind(&last_updated)
        .execute(self.store.pool())
        .await?;

        metrics::BASELINES_WRITTEN.inc_by(baselines.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EvaluatorConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.evaluation_window, Duration::from_secs(300));
        assert_eq!(config.min_samples_for_baseline, 100);
        assert_eq!(config.consecutive_failures_for_down, 3);
        assert_eq!(config.consecutive_successes_for_up, 3);
        assert_eq!(config.thresholds.z_warn, 3.0);
        assert_eq!(config.thresholds.z_crit, 5.0);
        assert_eq!(config.thresholds.packet_loss_warning_pct, 20.0);
        assert_eq!(config.thresholds.packet_loss_critical_pct, 20.0);
        assert_eq!(config.baseline_window, Duration::from_secs(7 * 24 * 3600));
    }
}
