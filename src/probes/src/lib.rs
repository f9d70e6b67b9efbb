//! # icmpmon-probes
//!
//! Agent-side probing: the polymorphic executor abstraction (bulk ICMP via
//! `fping`, path traces via `mtr`), the registry that verifies external
//! binaries before admitting an executor, and the tiered scheduler that
//! drives one probe loop per tier against the current assignment snapshot.

pub mod executor;
pub mod fping;
pub mod metrics;
pub mod mtr;
pub mod scheduler;
pub mod types;

pub use executor::{ExecutorRegistry, ProbeExecutor};
pub use fping::FpingExecutor;
pub use mtr::MtrExecutor;
pub use scheduler::{SchedulerStats, TieredScheduler};
pub use types::{ExecutorCapabilities, ProbeError, ProbeTarget};
