//! Prometheus metrics for the shipping path.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

lazy_static! {
    /// Results accepted into the local buffer
    pub static ref RESULTS_QUEUED: IntCounter = register_int_counter!(
        "icmpmon_shipper_queued_total",
        "Total number of results queued for shipping"
    )
    .expect("Can't create shipper_queued metric");

    /// Results delivered to the control plane
    pub static ref RESULTS_SHIPPED: IntCounter = register_int_counter!(
        "icmpmon_shipper_shipped_total",
        "Total number of results shipped successfully"
    )
    .expect("Can't create shipper_shipped metric");

    /// Results dropped after failed delivery or buffer overflow
    pub static ref RESULTS_FAILED: IntCounter = register_int_counter!(
        "icmpmon_shipper_failed_total",
        "Total number of results dropped after delivery failure or overflow"
    )
    .expect("Can't create shipper_failed metric");

    /// Current depth of the local buffer
    pub static ref BUFFER_DEPTH: IntGauge = register_int_gauge!(
        "icmpmon_shipper_buffer_depth",
        "Current number of results waiting in the shipper buffer"
    )
    .expect("Can't create shipper_buffer_depth metric");
}
