//! Redis-backed write-ahead FIFO queue.
//!
//! Results are JSON strings on a single list: LPUSH at the head, RPOP from
//! the tail, so the queue is FIFO across all producers. Redis bounds memory
//! by its own maxmemory policy; the flusher keeps the list short in steady
//! state.

use icmpmon_model::ProbeResult;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

use crate::metrics;

const DEFAULT_QUEUE_KEY: &str = "icmpmon:results";

/// Errors from the ingest path.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// FIFO queue of serialized probe results in Redis.
#[derive(Clone)]
pub struct WriteAheadBuffer {
    conn: ConnectionManager,
    key: String,
}

impl WriteAheadBuffer {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key: DEFAULT_QUEUE_KEY.to_string(),
        }
    }

    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = key.into();
        self
    }

    /// Enqueues a batch atomically (one LPUSH). Non-blocking.
    pub async fn push(&self, results: &[ProbeResult]) -> Result<(), IngestError> {
        if results.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(results.len());
        for result in results {
            encoded.push(serde_json::to_string(result)?);
        }

        let mut conn = self.conn.clone();
        let () = conn.lpush(&self.key, encoded).await?;
        metrics::RESULTS_BUFFERED.inc_by(results.len() as u64);
        Ok(())
    }

    /// Dequeues up to `max` results in FIFO order. Rows that fail to parse
    /// are dropped with a warning; they cannot be retried meaningfully.
    pub async fn pop(&self, max: usize) -> Result<Vec<ProbeResult>, IngestError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .rpop(&self.key, std::num::NonZeroUsize::new(max))
            .await?;

        let mut results = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<ProbeResult>(&item) {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(error = %err, "dropping unparseable queue entry");
                }
            }
        }
        Ok(results)
    }

    /// Current queue depth.
    pub async fn len(&self) -> Result<usize, IngestError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.key).await?;
        metrics::QUEUE_DEPTH.set(len as i64);
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool, IngestError> {
        Ok(self.len().await? == 0)
    }
}
