//! # icmpmon-model
//!
//! Shared data model for the monitoring control plane: the entities owned by
//! the control plane (agents, targets, tiers, assignments, probe results,
//! baselines, per-pair health states, commands), their invariants, and the
//! Postgres store surface the other crates build on.

pub mod entities;
pub mod error;
pub mod store;

pub use entities::*;
pub use error::StoreError;
pub use store::Store;
