//! Prometheus metrics for the ingest path.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};

lazy_static! {
    /// Results accepted into the write-ahead queue
    pub static ref RESULTS_BUFFERED: IntCounter = register_int_counter!(
        "icmpmon_ingest_buffered_total",
        "Total number of results pushed onto the write-ahead queue"
    )
    .expect("Can't create ingest_buffered metric");

    /// Results written to the time-series table
    pub static ref RESULTS_FLUSHED: IntCounter = register_int_counter!(
        "icmpmon_ingest_flushed_total",
        "Total number of results flushed into the store"
    )
    .expect("Can't create ingest_flushed metric");

    /// Results dropped because a flush transaction failed
    pub static ref RESULTS_DROPPED: IntCounter = register_int_counter!(
        "icmpmon_ingest_dropped_total",
        "Total number of results dropped on flush failure"
    )
    .expect("Can't create ingest_dropped metric");

    /// Current write-ahead queue depth
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "icmpmon_ingest_queue_depth",
        "Current number of results waiting in the write-ahead queue"
    )
    .expect("Can't create ingest_queue_depth metric");

    /// Flush transaction duration
    pub static ref FLUSH_SECONDS: Histogram = register_histogram!(
        "icmpmon_ingest_flush_seconds",
        "Duration of flush transactions in seconds"
    )
    .expect("Can't create ingest_flush_seconds metric");
}
