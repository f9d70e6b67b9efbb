//! icmp-mon - distributed reachability and latency monitoring
//!
//! The control plane owns the authoritative state: target catalog, tier
//! policies, agent registry, target-to-agent assignments, the buffered
//! ingest path and the baseline/anomaly evaluator. Agents probe their
//! assigned targets on tier cadences and ship results back.

pub mod api;
pub mod client;
pub mod platform;

pub use platform::config::{AgentSettings, ControlPlaneConfig};
pub use platform::context::AppContext;
pub use platform::runtime::{ControlPlane, ControlPlaneHandle};
