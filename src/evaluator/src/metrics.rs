//! Prometheus metrics for the evaluation path.

use lazy_static::lazy_static;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

lazy_static! {
    /// Pairs examined across all cycles
    pub static ref PAIRS_EVALUATED: IntCounter = register_int_counter!(
        "icmpmon_evaluator_pairs_total",
        "Total number of (agent, target) pairs evaluated"
    )
    .expect("Can't create evaluator_pairs metric");

    /// State rows written because something changed
    pub static ref STATES_CHANGED: IntCounter = register_int_counter!(
        "icmpmon_evaluator_state_changes_total",
        "Total number of pair state changes persisted"
    )
    .expect("Can't create evaluator_state_changes metric");

    /// Baselines created or refreshed
    pub static ref BASELINES_WRITTEN: IntCounter = register_int_counter!(
        "icmpmon_evaluator_baselines_written_total",
        "Total number of baselines created or refreshed"
    )
    .expect("Can't create evaluator_baselines metric");

    /// Evaluation cycle duration
    pub static ref CYCLE_SECONDS: Histogram = register_histogram!(
        "icmpmon_evaluator_cycle_seconds",
        "Duration of evaluation cycles in seconds"
    )
    .expect("Can't create evaluator_cycle_seconds metric");
}
