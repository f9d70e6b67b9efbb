//! # icmpmon-ingest
//!
//! The write-ahead ingest path: agent reports land in a Redis-backed FIFO
//! queue and a single flusher drains them into the time-series table in
//! bulk, staging first and deduplicating on the `(time, target, agent)`
//! composite key. The queue absorbs bursts and short store outages without
//! back-pressuring the HTTP edge.

pub mod buffer;
pub mod flusher;
pub mod metrics;

pub use buffer::{IngestError, WriteAheadBuffer};
pub use flusher::{Flusher, FlusherConfig};
