//! Error types for warehouse operations.
//!
//! One `thiserror` enumeration covers every failure mode, from configuration
//! problems at startup to runtime failures in chain RPC, SQL execution, and
//! row decoding. The worker pool additionally needs to distinguish
//! constraint violations (duplicate-event signals) from genuinely retryable
//! errors; [`is_constraint_violation`] encodes that classification.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DwhError {
    /// Errors encountered during database operations.
    ///
    /// Wraps `sqlx::Error` via `#[from]` so storage code propagates with `?`.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Errors while fetching canonical state or events from the chain.
    #[error("chain error: {0}")]
    Chain(String),

    /// Errors converting stored rows back into domain entities.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An event carried a benchmark vector that does not match the market's
    /// declared benchmark count, or a value out of range.
    #[error("benchmark mismatch: {0}")]
    BenchmarkMismatch(String),

    /// A detail query matched no row.
    #[error("not found: {0}")]
    NotFound(String),

    /// Catch-all for failures that fit no other category.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for Results using [`DwhError`].
pub type Result<T> = std::result::Result<T, DwhError>;

/// Returns `true` if `err` is a SQL constraint violation.
///
/// Events arrive in arbitrary order within a block and may be re-delivered
/// after a restart, so a uniqueness or foreign-key violation is the storage
/// layer telling us the event has already been applied. The worker drops
/// such events instead of retrying them.
#[must_use]
pub fn is_constraint_violation(err: &DwhError) -> bool {
    use sqlx::error::ErrorKind;

    match err {
        DwhError::Database(sqlx_err) => sqlx_err
            .as_database_error()
            .map(|db| {
                matches!(
                    db.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                )
            })
            .unwrap_or(false),
        _ => false,
    }
}
