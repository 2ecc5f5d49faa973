//! Error types for the Tally rate limiter.

use thiserror::Error;

/// Errors raised by a counter store.
///
/// Stores return these uninterpreted; the limiter wraps them with the
/// operation that failed.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database errors from the PostgreSQL store
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store could not serve the request
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Main error type for Tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    /// The database pool could not be opened
    #[error("cannot connect to database: {0}")]
    Connect(#[source] StoreError),

    /// The backing table could not be created at construction time
    #[error("cannot ensure rate_limits table: {0}")]
    Schema(#[source] StoreError),

    /// A rate limit check failed in the store
    #[error("cannot check rate limit: {0}")]
    Check(#[source] StoreError),

    /// A cleanup pass failed in the store
    #[error("cannot cleanup rate limits: {0}")]
    Cleanup(#[source] StoreError),

    /// The rate or hit count passed to a check is unusable
    #[error("invalid rate: {0}")]
    InvalidRate(String),

    /// Metric registration conflicts
    #[error("metrics registry error: {0}")]
    Registry(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
