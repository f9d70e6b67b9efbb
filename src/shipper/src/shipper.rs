//! The result shipper.
//!
//! Producers hand results over an mpsc channel; the shipper accumulates them
//! and flushes when the batch fills, when the batch timeout elapses, or once
//! more on shutdown. The buffer is swapped out at flush start so producers
//! keep queueing while a flush is on the wire. Under persistent backend
//! failure the buffer stays bounded by dropping the oldest results.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use icmpmon_model::{ProbeResult, ResultBatch};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;

/// Errors from shipper construction and delivery.
#[derive(Debug, Error)]
pub enum ShipError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("ingest endpoint answered {0}")]
    Rejected(StatusCode),
}

/// Operational knobs for the shipper.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Full URL of the ingest endpoint
    pub endpoint: String,
    /// Bearer token, when the control plane requires one
    pub token: Option<String>,
    /// Flush as soon as this many results are buffered
    pub batch_size: usize,
    /// Flush at least this often while results are pending
    pub batch_timeout: Duration,
    /// Hard cap on buffered results; beyond it the oldest are dropped
    pub max_buffer: usize,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Delivery attempts per batch before it is dropped
    pub max_attempts: u32,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api/v1/results".to_string(),
            token: None,
            batch_size: 500,
            batch_timeout: Duration::from_secs(10),
            max_buffer: 20_000,
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// Shared counters, readable while the shipper runs (the heartbeat reports
/// them).
#[derive(Debug, Default)]
pub struct ShipperStats {
    queued: AtomicU64,
    shipped: AtomicU64,
    failed: AtomicU64,
    depth: AtomicU64,
}

/// Point-in-time view of the shipper counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StatsSnapshot {
    pub queued: u64,
    pub shipped: u64,
    pub failed: u64,
    pub depth: u64,
}

impl ShipperStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            shipped: self.shipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
        }
    }
}

/// Batches probe results and ships them to the control plane.
pub struct ResultShipper {
    agent_id: Uuid,
    config: ShipperConfig,
    client: reqwest::Client,
    buffer: Mutex<VecDeque<ProbeResult>>,
    stats: Arc<ShipperStats>,
}

impl ResultShipper {
    pub fn new(agent_id: Uuid, config: ShipperConfig) -> Result<Self, ShipError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            agent_id,
            config,
            client,
            buffer: Mutex::new(VecDeque::new()),
            stats: Arc::new(ShipperStats::default()),
        })
    }

    /// Counter handle for heartbeat reporting.
    pub fn stats(&self) -> Arc<ShipperStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes results until cancellation; performs one final best-effort
    /// flush on the way out.
    pub async fn run(
        &self,
        mut results_rx: mpsc::Receiver<ProbeResult>,
        token: CancellationToken,
    ) {
        info!(endpoint = self.config.endpoint.as_str(), "result shipper started");
        let mut ticker = tokio::time::interval(self.config.batch_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = results_rx.recv() => {
                    match maybe {
                        Some(result) => {
                            if self.enqueue(result).await {
                                self.flush().await;
                            }
                        }
                        // All producers dropped; nothing more will arrive.
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        // Drain whatever the producers managed to push before cancellation.
        while let Ok(result) = results_rx.try_recv() {
            self.enqueue(result).await;
        }
        self.flush().await;
        info!("result shipper stopped");
    }

    /// Adds one result to the buffer. Returns true when the buffer has
    /// reached the flush threshold.
    async fn enqueue(&self, result: ProbeResult) -> bool {
        let mut buffer = self.buffer.lock().await;
        buffer.push_back(result);

        // Bounded queue: under persistent failure the oldest results go
        // first, not the memory of the process.
        while buffer.len() > self.config.max_buffer {
            buffer.pop_front();
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            metrics::RESULTS_FAILED.inc();
        }

        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        self.stats.depth.store(buffer.len() as u64, Ordering::Relaxed);
        metrics::RESULTS_QUEUED.inc();
        metrics::BUFFER_DEPTH.set(buffer.len() as i64);

        buffer.len() >= self.config.batch_size
    }

    /// Ships everything currently buffered. The swap happens under the lock;
    /// the network round-trip does not.
    pub async fn flush(&self) {
        let batch: Vec<ProbeResult> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            self.stats.depth.store(0, Ordering::Relaxed);
            metrics::BUFFER_DEPTH.set(0);
            buffer.drain(..).collect()
        };

        let count = batch.len() as u64;
        match self.ship(batch).await {
            Ok(batch_id) => {
                self.stats.shipped.fetch_add(count, Ordering::Relaxed);
                metrics::RESULTS_SHIPPED.inc_by(count);
                debug!(batch_id = %batch_id, results = count, "batch shipped");
            }
            Err(err) => {
                // The control plane tolerates gaps; dropped batches only
                // move the counters.
                self.stats.failed.fetch_add(count, Ordering::Relaxed);
                metrics::RESULTS_FAILED.inc_by(count);
                warn!(results = count, error = %err, "batch dropped after delivery failure");
            }
        }
    }

    /// Delivers one batch with bounded retries and doubling backoff.
    async fn ship(&self, results: Vec<ProbeResult>) -> Result<Uuid, ShipError> {
        let envelope = ResultBatch {
            agent_id: self.agent_id,
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            results,
        };
        let batch_id = envelope.batch_id;
        let body = compress_batch(&envelope)?;

        let mut backoff = Duration::from_millis(500);
        let mut last_err: Option<ShipError> = None;

        for attempt in 1..=self.config.max_attempts.max(1) {
            let mut request = self
                .client
                .post(&self.config.endpoint)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::CONTENT_ENCODING, "gzip")
                .body(body.clone());
            if let Some(token) = &self.config.token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response)
                    if response.status() == StatusCode::OK
                        || response.status() == StatusCode::ACCEPTED =>
                {
                    return Ok(batch_id);
                }
                Ok(response) => {
                    last_err = Some(ShipError::Rejected(response.status()));
                }
                Err(err) => {
                    last_err = Some(ShipError::Http(err));
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(last_err.unwrap_or(ShipError::Rejected(StatusCode::INTERNAL_SERVER_ERROR)))
    }
}

/// Serializes and gzip-compresses a result batch.
pub fn compress_batch(batch: &ResultBatch) -> Result<Vec<u8>, ShipError> {
    let json = serde_json::to_vec(batch)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use icmpmon_model::{PingStats, ProbePayload};
    use std::io::Read;

    fn result() -> ProbeResult {
        ProbeResult {
            time: Utc::now(),
            target_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            success: true,
            error: None,
            payload: ProbePayload::IcmpPing(PingStats {
                packets_sent: 3,
                packets_recvd: 3,
                packet_loss_pct: 0.0,
                min_rtt_ms: Some(1.0),
                max_rtt_ms: Some(2.0),
                avg_rtt_ms: Some(1.5),
                stddev_rtt_ms: Some(0.5),
                latency_ms: Some(2.0),
                rtts_ms: vec![Some(1.0), Some(1.5), Some(2.0)],
            }),
        }
    }

    #[test]
    fn compressed_batch_round_trips() {
        let batch = ResultBatch {
            agent_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            results: vec![result(), result()],
        };

        let compressed = compress_batch(&batch).unwrap();
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut json = String::new();
        decoder.read_to_string(&mut json).unwrap();

        let back: ResultBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_id, batch.batch_id);
        assert_eq!(back.results.len(), 2);
    }

    #[tokio::test]
    async fn buffer_stays_bounded_by_dropping_oldest() {
        let shipper = ResultShipper::new(
            Uuid::new_v4(),
            ShipperConfig {
                max_buffer: 3,
                batch_size: 100,
                ..ShipperConfig::default()
            },
        )
        .unwrap();

        for _ in 0..10 {
            shipper.enqueue(result()).await;
        }

        let depth = shipper.buffer.lock().await.len();
        assert_eq!(depth, 3);
        let stats = shipper.stats().snapshot();
        assert_eq!(stats.queued, 10);
        assert_eq!(stats.failed, 7);
    }

    #[tokio::test]
    async fn enqueue_signals_flush_at_batch_size() {
        let shipper = ResultShipper::new(
            Uuid::new_v4(),
            ShipperConfig {
                batch_size: 2,
                ..ShipperConfig::default()
            },
        )
        .unwrap();

        assert!(!shipper.enqueue(result()).await);
        assert!(shipper.enqueue(result()).await);
    }

    #[tokio::test]
    async fn failed_delivery_drops_batch_and_counts() {
        // Nothing listens on this port; every attempt errors out fast.
        let shipper = ResultShipper::new(
            Uuid::new_v4(),
            ShipperConfig {
                endpoint: "http://127.0.0.1:1/api/v1/results".to_string(),
                max_attempts: 1,
                request_timeout: Duration::from_millis(500),
                ..ShipperConfig::default()
            },
        )
        .unwrap();

        shipper.enqueue(result()).await;
        shipper.flush().await;

        let stats = shipper.stats().snapshot();
        assert_eq!(stats.shipped, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(shipper.buffer.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn successful_delivery_counts_shipped() {
        use axum::routing::post;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route("/api/v1/results", post(|| async { axum::http::StatusCode::ACCEPTED }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let shipper = ResultShipper::new(
            Uuid::new_v4(),
            ShipperConfig {
                endpoint: format!("http://{addr}/api/v1/results"),
                ..ShipperConfig::default()
            },
        )
        .unwrap();

        shipper.enqueue(result()).await;
        shipper.enqueue(result()).await;
        shipper.flush().await;

        let stats = shipper.stats().snapshot();
        assert_eq!(stats.shipped, 2);
        assert_eq!(stats.failed, 0);
    }
}
