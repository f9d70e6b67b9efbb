pub mod config;
pub mod context;
pub mod runtime;
pub mod telemetry;
