//! Store error type shared by every crate that talks to Postgres.

use thiserror::Error;

/// Errors surfaced by the store layer.
///
/// `Validation` maps to a 4xx at the HTTP edge; everything else is
/// infrastructure and maps to a generic 5xx.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Whether this error should reach the HTTP caller as a 4xx.
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_) | StoreError::NotFound(_))
    }
}
