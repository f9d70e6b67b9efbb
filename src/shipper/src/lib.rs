//! # icmpmon-shipper
//!
//! Agent-side result shipping: batches locally produced probe results and
//! transports them to the control plane's ingest endpoint as gzip-compressed
//! JSON, with bounded memory and tolerance for transient backend outages.

pub mod metrics;
pub mod shipper;

pub use shipper::{ResultShipper, ShipError, ShipperConfig, ShipperStats, StatsSnapshot};
