//! Pluggable storage adapter abstracting the two SQL dialects (spec
//! §4.8, C8).
//!
//! Grounded on the teacher's `incidents::IncidentStore` for sqlx usage
//! style (bind/execute/fetch, `Row::get`), generalized here into a
//! trait so the flusher and compactor are dialect-agnostic; the trait
//! itself, and the idempotent merge contract it documents, has no
//! direct teacher counterpart and is built from spec §4.8 directly.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{Bucket, ErrorRecord, EventBucket, EventSample, Sample};

/// Table row counts, exposed through `stats()`/`table_sizes()` (spec §6).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TableSizes {
    pub buckets: i64,
    pub samples: i64,
    pub errors: i64,
    pub event_buckets: i64,
    pub event_samples: i64,
}

/// Single contract, four persistence operations plus table introspection
/// and a dialect-specific SQL fragment helper for the compactor.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Idempotent merge-upsert of bucket rows (spec §4.8 Bucket merge).
    async fn persist_buckets(&self, buckets: &[Bucket]) -> StorageResult<()>;

    /// Inserts samples in batches of at most `batch_size` per statement
    /// (spec §4.8 Batching).
    async fn persist_samples(&self, samples: &[Sample], batch_size: usize) -> StorageResult<()>;

    /// Idempotent merge-upsert of error records: appends new contexts to
    /// the existing ring then truncates it to `max_contexts` most recent
    /// (spec §4.8 Error merge).
    async fn persist_errors(&self, errors: &[ErrorRecord], max_contexts: usize) -> StorageResult<()>;

    /// Idempotent merge-upsert of business-event buckets.
    async fn persist_event_buckets(&self, buckets: &[EventBucket]) -> StorageResult<()>;

    /// Inserts business-event samples, then trims each name's samples
    /// down to `max_per_name` by deleting the oldest (spec §4.8
    /// EventSamples merge).
    async fn persist_event_samples(
        &self,
        samples: &[EventSample],
        max_per_name: usize,
    ) -> StorageResult<()>;

    async fn table_sizes(&self) -> StorageResult<TableSizes>;

    /// Creates the schema if it does not already exist. Idempotent.
    async fn ensure_schema(&self) -> StorageResult<()>;

    /// Merges rows with `bucket_start` in `[range_start, range_end)`
    /// (`range_start = None` means unbounded on the old end) that are
    /// not aligned to `interval_seconds` into the coarser boundary,
    /// deleting the originals, for the compactor's age-band downsampling
    /// (spec §4.11). Returns the number of source rows merged away.
    async fn compact_bucket_band(
        &self,
        range_start: Option<chrono::DateTime<chrono::Utc>>,
        range_end: chrono::DateTime<chrono::Utc>,
        interval_seconds: i64,
    ) -> StorageResult<u64>;
}
