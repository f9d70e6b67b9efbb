//! # icmpmon-assignment
//!
//! The assignment engine: deterministic target-to-agent selection under
//! per-tier policies (strategy, filters, diversity), and the store-backed
//! rebalancer that materializes assignments, fails agents over, folds
//! recovered agents back in, and bumps the monotonic assignment version in
//! the same transaction as every row change.

pub mod rebalancer;
pub mod selection;

pub use rebalancer::{AssignError, Rebalancer};
pub use selection::{eligible_agents, ip_hash, select};
