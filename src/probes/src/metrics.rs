//! Prometheus metrics for the probing path.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, Histogram, IntCounter,
};

lazy_static! {
    /// Total probes executed across all tiers
    pub static ref PROBES_EXECUTED: IntCounter = register_int_counter!(
        "icmpmon_probes_executed_total",
        "Total number of probes executed"
    )
    .expect("Can't create probes_executed metric");

    /// Executor batch invocations that failed outright
    pub static ref PROBE_BATCH_FAILURES: IntCounter = register_int_counter!(
        "icmpmon_probe_batch_failures_total",
        "Total number of failed executor batch invocations"
    )
    .expect("Can't create probe_batch_failures metric");

    /// Wall-clock duration of one tier probe cycle
    pub static ref PROBE_CYCLE_SECONDS: Histogram = register_histogram!(
        "icmpmon_probe_cycle_seconds",
        "Duration of tier probe cycles in seconds"
    )
    .expect("Can't create probe_cycle_seconds metric");
}
