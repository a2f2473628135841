//! Common error types for DACC

use thiserror::Error;

/// Common result type for DACC operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds shared by the storage layer and the aggregation service
///
/// Every variant except `InvalidInput`, `NotFound` and `AccessDenied` aborts
/// the running aggregation or purge; the enclosing transaction is rolled back.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid measure, definition or query parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Restitution is not allowed for this measure
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Two aggregates with a different measure name or start date were merged
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// Raw rows expected for a quartile recomputation were missing
    #[error("No quartile computed for {measure} on start date {start_date}")]
    QuantileRecomputationFailed { measure: String, start_date: String },

    /// Purge would have deleted raw measures not yet aggregated
    #[error("Purge of {measure} would remove {pending} non-aggregated measures")]
    PurgeSafetyViolation { measure: String, pending: i64 },

    /// Administrative rollback cannot be applied without losing or duplicating data
    #[error("Rollback conflict: {0}")]
    RollbackConflict(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
