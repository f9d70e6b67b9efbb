//! # icmpmon-evaluator
//!
//! Turns raw probe rows into per-(agent, target) health states: learns
//! latency baselines, scores fresh observations against them, and applies
//! hysteresis so one bad cycle never flips a pair and one good cycle never
//! clears an outage.

pub mod evaluate;
pub mod metrics;
pub mod worker;

pub use evaluate::{advance_state, classify, z_score, AnomalyLevel, PairWindowStats};
pub use worker::{EvalError, Evaluator, EvaluatorConfig};
