//! Error taxonomy for the ingestion/aggregation/persistence pipeline.
//!
//! Per the host-isolation contract: a [`CoreError`] never crosses the
//! façade boundary. It exists so internal components (flusher, compactor,
//! storage adapter) can report precisely what went wrong to `tracing` and
//! to [`crate::metrics::Metrics`], without ever panicking or propagating
//! to the collaborator's call site.

use thiserror::Error;

/// Failures the core can encounter while doing its background work.
///
/// None of these are surfaced to the host application directly; the
/// flusher and compactor catch them, log them, and update `stats()`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The buffer's hard cap was exceeded; the event was dropped.
    #[error("buffer full: dropped event ({dropped_bytes} bytes)")]
    BufferFull { dropped_bytes: usize },

    /// The storage adapter raised or timed out during a flush or compaction.
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StorageError),

    /// The circuit breaker is open; the call was skipped.
    #[error("circuit breaker open, {remaining_secs:.1}s until half-open probe")]
    BreakerOpen { remaining_secs: f64 },

    /// Stored data could not be decoded; a safe empty value was substituted.
    #[error("malformed stored data in {field}: {reason}")]
    MalformedStoredData { field: &'static str, reason: String },

    /// Configuration was invalid at construction time.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

/// Failures from the [`crate::storage::StorageAdapter`] trait.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
pub type StorageResult<T> = Result<T, StorageError>;
