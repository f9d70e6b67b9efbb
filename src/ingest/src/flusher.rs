//! Bulk flusher: drains the write-ahead queue into the time-series table.
//!
//! One transaction per flush: rows land in an ephemeral staging table,
//! then one `INSERT … SELECT` joins agents and subnets to materialize the
//! region columns and dedups on the composite key. Gateway-tier targets
//! keep NULL region columns so deprioritized ICMP does not skew market
//! statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use icmpmon_model::{ProbePayload, ProbeResult, Store};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::buffer::{IngestError, WriteAheadBuffer};
use crate::metrics;

/// Operational knobs for the flusher.
#[derive(Debug, Clone)]
pub struct FlusherConfig {
    pub flush_interval: Duration,
    /// Rows popped per flush transaction
    pub batch_size: usize,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            batch_size: 20_000,
        }
    }
}

/// Single-writer flusher from the queue into Postgres.
pub struct Flusher {
    buffer: WriteAheadBuffer,
    store: Store,
    config: FlusherConfig,
}

impl Flusher {
    pub fn new(buffer: WriteAheadBuffer, store: Store, config: FlusherConfig) -> Self {
        Self {
            buffer,
            store,
            config,
        }
    }

    /// Runs until cancellation; one final flush drains what remains.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval_ms = self.config.flush_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "ingest flusher started"
        );
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.flush_once().await {
                        error!(error = %err, "flush cycle failed");
                    }
                }
            }
        }

        if let Err(err) = self.flush_once().await {
            error!(error = %err, "final flush failed");
        }
        info!("ingest flusher stopped");
    }

    /// Pops one batch and writes it. Returns the number of rows handed to
    /// the store (rows deduplicated away by the composite key count too).
    pub async fn flush_once(&self) -> Result<usize, IngestError> {
        let depth = self.buffer.len().await?;
        if depth == 0 {
            return Ok(0);
        }

        let results = self.buffer.pop(self.config.batch_size).await?;
        if results.is_empty() {
            return Ok(0);
        }

        let count = results.len();
        let timer = metrics::FLUSH_SECONDS.start_timer();
        match self.write_rows(&results).await {
            Ok(()) => {
                timer.observe_duration();
                metrics::RESULTS_FLUSHED.inc_by(count as u64);
                debug!(rows = count, "flush committed");
                Ok(count)
            }
            Err(err) => {
                timer.observe_duration();
                // The popped rows are gone: at-least-once upstream becomes
                // at-most-once here.
                // TODO: dead-letter lane for dropped batches.
                metrics::RESULTS_DROPPED.inc_by(count as u64);
                error!(rows = count, error = %err, "flush failed, dropping popped rows");
                Err(err)
            }
        }
    }

    async fn write_rows(&self, results: &[ProbeResult]) -> Result<(), IngestError> {
        let rows = StagingRows::build(results)?;
        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            r#"
            CREATE TEMPORARY TABLE staging_probe_results (
                time TIMESTAMPTZ NOT NULL,
                target_id UUID NOT NULL,
                agent_id UUID NOT NULL,
                success BOOLEAN NOT NULL,
                error TEXT,
                probe_type TEXT NOT NULL,
                avg_ms DOUBLE PRECISION,
                packet_loss_pct DOUBLE PRECISION,
                payload JSONB
            ) ON COMMIT DROP
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO staging_probe_results
                (time, target_id, agent_id, success, error, probe_type,
                 avg_ms, packet_loss_pct, payload)
            SELECT * FROM UNNEST(
                $1::timestamptz[], $2::uuid[], $3::uuid[], $4::boolean[],
                $5::text[], $6::text[], $7::float8[], $8::float8[], $9::jsonb[]
            )
            "#,
        )
        .bind(&rows.times)
        .bind(&rows.target_ids)
        .bind(&rows.agent_ids)
        .bind(&rows.successes)
        .bind(&rows.errors)
        .bind(&rows.probe_types)
        .bind(&rows.avg_ms)
        .bind(&rows.packet_loss_pct)
        .bind(&rows.payloads)
        .execute(&mut *tx)
        .await?;

        // Joining targets also discards results whose target vanished
        // between probe and flush.
        sqlx::query(
            r#"
            INSERT INTO probe_results
                (time, target_id, agent_id, success, error, probe_type,
                 avg_ms, packet_loss_pct, payload,
                 agent_region, target_region, is_in_market)
            SELECT
                s.time, s.target_id, s.agent_id, s.success, s.error, s.probe_type,
                s.avg_ms, s.packet_loss_pct, s.payload,
                CASE WHEN t.tier = 'gateway' THEN NULL ELSE ag.region END,
                CASE WHEN t.tier = 'gateway' THEN NULL ELSE sn.region END,
                CASE WHEN t.tier = 'gateway' THEN NULL
                     ELSE (sn.region IS NOT NULL AND ag.region = sn.region) END
            FROM staging_probe_results s
            JOIN targets t ON t.id = s.target_id
            JOIN agents ag ON ag.id = s.agent_id
            LEFT JOIN subnets sn ON sn.id = t.subnet_id
            ON CONFLICT (time, target_id, agent_id) DO NOTHING
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Column-major staging rows, one array per column for the UNNEST insert.
struct StagingRows {
    times: Vec<DateTime<Utc>>,
    target_ids: Vec<Uuid>,
    agent_ids: Vec<Uuid>,
    successes: Vec<bool>,
    errors: Vec<Option<String>>,
    probe_types: Vec<String>,
    avg_ms: Vec<Option<f64>>,
    packet_loss_pct: Vec<Option<f64>>,
    payloads: Vec<serde_json::Value>,
}

impl StagingRows {
    fn build(results: &[ProbeResult]) -> Result<Self, IngestError> {
        let mut rows = Self {
            times: Vec::with_capacity(results.len()),
            target_ids: Vec::with_capacity(results.len()),
            agent_ids: Vec::with_capacity(results.len()),
            successes: Vec::with_capacity(results.len()),
            errors: Vec::with_capacity(results.len()),
            probe_types: Vec::with_capacity(results.len()),
            avg_ms: Vec::with_capacity(results.len()),
            packet_loss_pct: Vec::with_capacity(results.len()),
            payloads: Vec::with_capacity(results.len()),
        };

        for result in results {
            let payload = match &result.payload {
                ProbePayload::IcmpPing(stats) => serde_json::to_value(stats)?,
                ProbePayload::Mtr(trace) => serde_json::to_value(trace)?,
            };

            rows.times.push(result.time);
            rows.target_ids.push(result.target_id);
            rows.agent_ids.push(result.agent_id);
            rows.successes.push(result.success);
            rows.errors.push(result.error.clone());
            rows.probe_types.push(result.payload.probe_type().to_string());
            rows.avg_ms.push(result.payload.avg_ms());
            rows.packet_loss_pct.push(result.payload.packet_loss_pct());
            rows.payloads.push(payload);
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icmpmon_model::{MtrHop, MtrTrace, PingStats};

    fn ping_result(loss: f64, avg: Option<f64>) -> ProbeResult {
        ProbeResult {
            time: Utc::now(),
            target_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            success: loss < 100.0,
            error: None,
            payload: ProbePayload::IcmpPing(PingStats {
                packets_sent: 3,
                packets_recvd: if loss >= 100.0 { 0 } else { 3 },
                packet_loss_pct: loss,
                min_rtt_ms: avg,
                max_rtt_ms: avg,
                avg_rtt_ms: avg,
                stddev_rtt_ms: None,
                latency_ms: avg,
                rtts_ms: vec![avg, avg, avg],
            }),
        }
    }

    #[test]
    fn staging_rows_extract_typed_columns() {
        let mut total_loss = ping_result(100.0, None);
        total_loss.error = Some("100% packet loss (3 packets sent)".to_string());

        let trace = ProbeResult {
            time: Utc::now(),
            target_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            success: true,
            error: None,
            payload: ProbePayload::Mtr(MtrTrace {
                hops: vec![MtrHop {
                    number: 1,
                    host: "8.8.8.8".to_string(),
                    loss_pct: 0.0,
                    sent: 10,
                    recv: 10,
                    best_ms: 8.0,
                    avg_ms: 9.0,
                    worst_ms: 10.0,
                    stddev_ms: 0.5,
                }],
                reached: true,
            }),
        };

        let results = vec![ping_result(0.0, Some(12.5)), total_loss, trace];
        let rows = StagingRows::build(&results).unwrap();

        assert_eq!(rows.times.len(), 3);
        assert_eq!(rows.probe_types, vec!["icmp_ping", "icmp_ping", "mtr"]);
        assert_eq!(rows.avg_ms[0], Some(12.5));
        assert_eq!(rows.avg_ms[1], None);
        assert_eq!(rows.avg_ms[2], Some(9.0));
        assert_eq!(rows.packet_loss_pct[0], Some(0.0));
        assert_eq!(rows.packet_loss_pct[1], Some(100.0));
        assert_eq!(
            rows.errors[1].as_deref(),
            Some("100% packet loss (3 packets sent)")
        );
        // Payload column carries the inner payload, not the envelope.
        assert!(rows.payloads[0]["packets_sent"].is_number());
        assert!(rows.payloads[2]["hops"].is_array());
    }

    #[test]
    fn flusher_defaults_match_steady_state_rates() {
        let config = FlusherConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.batch_size, 20_000);
    }
}
