use thiserror::Error;

/// Errors produced by the table store and its persisters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Local durable cache failure (sqlite). Blocks readiness when raised
    /// during initialization.
    #[error("local cache error: {0}")]
    LocalCache(#[from] rusqlite::Error),

    /// Connection pool failure for the local cache.
    #[error("local cache pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Row (de)serialization failure.
    #[error("row serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote replica write failure. Logged and retried on the persister's
    /// own schedule; never surfaced to the mutating caller.
    #[error("remote replica error: {0}")]
    Remote(String),

    /// A background persistence task exited unexpectedly.
    #[error("persistence task error: {0}")]
    Task(String),
}
