//! Dialect B: simpler embedded SQL requiring read-modify-write under a
//! process-wide write lock (spec §4.8).
//!
//! Grounded on the teacher's `IncidentStore` (`sqlx::SqlitePool`,
//! `CREATE TABLE IF NOT EXISTS` schema, bind/execute/fetch_optional).
//! Unlike the teacher's incident store, every write here goes through
//! `write_lock` first: SQLite has no atomic server-side upsert with
//! custom merge functions, so a concurrent writer could interleave a
//! read-modify-write and lose an update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::error::StorageResult;
use crate::event::Kind;
use crate::models::{Bucket, ErrorRecord, EventBucket, EventSample, OccurrenceBuckets, Sample};

use super::{StorageAdapter, TableSizes};

pub struct SqliteAdapter {
    pool: SqlitePool,
    /// Single process-wide write path (spec §4.8 Connection discipline).
    write_lock: Mutex<()>,
}

impl SqliteAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Direct pool access for introspection that doesn't fit the
    /// dialect-agnostic `StorageAdapter` trait (e.g. cross-row test
    /// assertions).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn kind_str(kind: Kind) -> &'static str {
        match kind {
            Kind::Http => "http",
            Kind::Job => "job",
            Kind::Custom => "custom",
        }
    }

    fn parse_kind(s: &str) -> Kind {
        match s {
            "http" => Kind::Http,
            "job" => Kind::Job,
            _ => Kind::Custom,
        }
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    async fn ensure_schema(&self) -> StorageResult<()> {
        // Best-effort: only takes effect on connections sqlx happens to
        // reuse for later statements. Cascade on sample deletion is
        // additionally done explicitly in `compact_bucket_band` so
        // correctness doesn't depend on this pragma being honored.
        sqlx::query("PRAGMA foreign_keys = ON;").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                operation TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                duration_sum REAL NOT NULL DEFAULT 0,
                duration_max REAL NOT NULL DEFAULT 0,
                duration_min REAL NOT NULL DEFAULT 0,
                metadata_sum TEXT NOT NULL DEFAULT '{}',
                p95_digest BLOB NOT NULL DEFAULT '',
                UNIQUE(kind, target, operation, bucket_start)
            );
            CREATE INDEX IF NOT EXISTS idx_buckets_start ON buckets(bucket_start);
            CREATE INDEX IF NOT EXISTS idx_buckets_kind_start ON buckets(kind, bucket_start);

            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id INTEGER REFERENCES buckets(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                sample_type TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                duration REAL NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                error_fingerprint TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_samples_recorded ON samples(recorded_at);
            CREATE INDEX IF NOT EXISTS idx_samples_kind_recorded ON samples(kind, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_samples_fingerprint ON samples(error_fingerprint);

            CREATE TABLE IF NOT EXISTS errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                error_class TEXT NOT NULL,
                message TEXT NOT NULL,
                occurrences_count INTEGER NOT NULL DEFAULT 0,
                first_occurred_at INTEGER NOT NULL,
                last_occurred_at INTEGER NOT NULL,
                contexts TEXT NOT NULL DEFAULT '[]',
                occurrence_buckets TEXT NOT NULL DEFAULT '{}',
                resolved_at INTEGER,
                pinned INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS event_buckets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(name, bucket_start)
            );

            CREATE TABLE IF NOT EXISTS event_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                recorded_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_samples_name ON event_samples(name, recorded_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_buckets(&self, buckets: &[Bucket]) -> StorageResult<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for b in buckets {
            let existing = sqlx::query(
                "SELECT count, success_count, failure_count, duration_sum, duration_max, \
                 duration_min, metadata_sum, p95_digest FROM buckets \
                 WHERE kind = ?1 AND target = ?2 AND operation = ?3 AND bucket_start = ?4",
            )
            .bind(Self::kind_str(b.kind))
            .bind(&b.target)
            .bind(&b.operation)
            .bind(b.bucket_start.timestamp())
            .fetch_optional(&mut *tx)
            .await?;

            let merged = match existing {
                Some(row) => merge_bucket_row(&row, b)?,
                None => b.clone(),
            };

            sqlx::query(
                "INSERT INTO buckets (kind, target, operation, bucket_start, count, \
                 success_count, failure_count, duration_sum, duration_max, duration_min, \
                 metadata_sum, p95_digest) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12) \
                 ON CONFLICT(kind, target, operation, bucket_start) DO UPDATE SET \
                 count = excluded.count, success_count = excluded.success_count, \
                 failure_count = excluded.failure_count, duration_sum = excluded.duration_sum, \
                 duration_max = excluded.duration_max, duration_min = excluded.duration_min, \
                 metadata_sum = excluded.metadata_sum, p95_digest = excluded.p95_digest",
            )
            .bind(Self::kind_str(merged.kind))
            .bind(&merged.target)
            .bind(&merged.operation)
            .bind(merged.bucket_start.timestamp())
            .bind(merged.count)
            .bind(merged.success_count)
            .bind(merged.failure_count)
            .bind(merged.duration_sum)
            .bind(merged.duration_max)
            .bind(merged.duration_min)
            .bind(serde_json::to_string(&merged.metadata_sum)?)
            .bind(merged.p95_digest.serialize())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn persist_samples(&self, samples: &[Sample], batch_size: usize) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        for chunk in samples.chunks(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            for s in chunk {
                let bucket_id: Option<i64> = sqlx::query(
                    "SELECT id FROM buckets WHERE kind = ?1 AND target = ?2 AND operation = ?3 \
                     AND bucket_start = ?4",
                )
                .bind(Self::kind_str(s.kind))
                .bind(&s.target)
                .bind(&s.operation)
                .bind(s.bucket_start.timestamp())
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get::<i64, _>("id"));

                sqlx::query(
                    "INSERT INTO samples (bucket_id, kind, sample_type, recorded_at, duration, \
                     context, error_fingerprint) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                )
                .bind(bucket_id)
                .bind(Self::kind_str(s.kind))
                .bind(format!("{:?}", s.sample_type).to_lowercase())
                .bind(s.recorded_at.timestamp())
                .bind(s.duration_ms)
                .bind(serde_json::to_string(&s.context)?)
                .bind(&s.error_fingerprint)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn persist_errors(&self, errors: &[ErrorRecord], max_contexts: usize) -> StorageResult<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for e in errors {
            let existing = sqlx::query(
                "SELECT occurrences_count, first_occurred_at, last_occurred_at, contexts, \
                 occurrence_buckets, resolved_at FROM errors WHERE fingerprint = ?1",
            )
            .bind(&e.fingerprint)
            .fetch_optional(&mut *tx)
            .await?;

            let merged = match existing {
                Some(row) => merge_error_row(&row, e, max_contexts)?,
                None => e.clone(),
            };

            sqlx::query(
                "INSERT INTO errors (fingerprint, kind, error_class, message, occurrences_count, \
                 first_occurred_at, last_occurred_at, contexts, occurrence_buckets, resolved_at, \
                 pinned) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11) \
                 ON CONFLICT(fingerprint) DO UPDATE SET \
                 occurrences_count = excluded.occurrences_count, \
                 last_occurred_at = excluded.last_occurred_at, \
                 contexts = excluded.contexts, \
                 occurrence_buckets = excluded.occurrence_buckets, \
                 resolved_at = excluded.resolved_at",
            )
            .bind(&merged.fingerprint)
            .bind(Self::kind_str(merged.kind))
            .bind(&merged.error_class)
            .bind(&merged.message)
            .bind(merged.occurrences_count)
            .bind(merged.first_occurred_at.timestamp())
            .bind(merged.last_occurred_at.timestamp())
            .bind(serde_json::to_string(&merged.contexts)?)
            .bind(serde_json::to_string(&merged.occurrence_buckets)?)
            .bind(merged.resolved_at.map(|t| t.timestamp()))
            .bind(merged.pinned)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn persist_event_buckets(&self, buckets: &[EventBucket]) -> StorageResult<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for b in buckets {
            sqlx::query(
                "INSERT INTO event_buckets (name, bucket_start, count) VALUES (?1,?2,?3) \
                 ON CONFLICT(name, bucket_start) DO UPDATE SET count = count + excluded.count",
            )
            .bind(&b.name)
            .bind(b.bucket_start.timestamp())
            .bind(b.count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn persist_event_samples(
        &self,
        samples: &[EventSample],
        max_per_name: usize,
    ) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for s in samples {
            sqlx::query(
                "INSERT INTO event_samples (name, payload, recorded_at) VALUES (?1,?2,?3)",
            )
            .bind(&s.name)
            .bind(serde_json::to_string(&s.payload)?)
            .bind(s.recorded_at.timestamp())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "DELETE FROM event_samples WHERE name = ?1 AND id NOT IN ( \
                 SELECT id FROM event_samples WHERE name = ?1 ORDER BY recorded_at DESC LIMIT ?2)",
            )
            .bind(&s.name)
            .bind(max_per_name as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn table_sizes(&self) -> StorageResult<TableSizes> {
        async fn count(pool: &SqlitePool, table: &str) -> StorageResult<i64> {
            let row = sqlx::query(&format!("SELECT COUNT(*) as c FROM {table}"))
                .fetch_one(pool)
                .await?;
            Ok(row.get::<i64, _>("c"))
        }

        Ok(TableSizes {
            buckets: count(&self.pool, "buckets").await?,
            samples: count(&self.pool, "samples").await?,
            errors: count(&self.pool, "errors").await?,
            event_buckets: count(&self.pool, "event_buckets").await?,
            event_samples: count(&self.pool, "event_samples").await?,
        })
    }

    async fn compact_bucket_band(
        &self,
        range_start: Option<DateTime<Utc>>,
        range_end: DateTime<Utc>,
        interval_seconds: i64,
    ) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;

        let lower = range_start.map(|t| t.timestamp()).unwrap_or(0);
        let upper = range_end.timestamp();

        let misaligned = sqlx::query(
            "SELECT id, kind, target, operation, bucket_start, count, success_count, \
             failure_count, duration_sum, duration_max, duration_min, metadata_sum, p95_digest \
             FROM buckets WHERE bucket_start >= ?1 AND bucket_start < ?2 \
             AND (bucket_start % ?3) != 0",
        )
        .bind(lower)
        .bind(upper)
        .bind(interval_seconds)
        .fetch_all(&self.pool)
        .await?;

        if misaligned.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut merged_count = 0u64;

        for row in &misaligned {
            let bucket_start: i64 = row.get("bucket_start");
            let aligned_start = (bucket_start / interval_seconds) * interval_seconds;
            let kind: String = row.get("kind");
            let target: String = row.get("target");
            let operation: String = row.get("operation");

            let source = Bucket {
                kind: Self::parse_kind(&kind),
                target: target.clone(),
                operation: operation.clone(),
                bucket_start: DateTime::from_timestamp(bucket_start, 0).unwrap_or_default(),
                count: row.get("count"),
                success_count: row.get("success_count"),
                failure_count: row.get("failure_count"),
                duration_sum: row.get("duration_sum"),
                duration_max: row.get("duration_max"),
                duration_min: row.get("duration_min"),
                metadata_sum: serde_json::from_str(row.get::<String, _>("metadata_sum").as_str())
                    .unwrap_or_default(),
                p95_digest: crate::tdigest::TDigest::deserialize(row.get("p95_digest")),
            };

            let existing = sqlx::query(
                "SELECT count, success_count, failure_count, duration_sum, duration_max, \
                 duration_min, metadata_sum, p95_digest FROM buckets \
                 WHERE kind = ?1 AND target = ?2 AND operation = ?3 AND bucket_start = ?4",
            )
            .bind(&kind)
            .bind(&target)
            .bind(&operation)
            .bind(aligned_start)
            .fetch_optional(&mut *tx)
            .await?;

            let merged = match existing {
                Some(row) => merge_bucket_row(&row, &source)?,
                None => Bucket {
                    bucket_start: DateTime::from_timestamp(aligned_start, 0).unwrap_or_default(),
                    ..source
                },
            };

            sqlx::query(
                "INSERT INTO buckets (kind, target, operation, bucket_start, count, \
                 success_count, failure_count, duration_sum, duration_max, duration_min, \
                 metadata_sum, p95_digest) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12) \
                 ON CONFLICT(kind, target, operation, bucket_start) DO UPDATE SET \
                 count = excluded.count, success_count = excluded.success_count, \
                 failure_count = excluded.failure_count, duration_sum = excluded.duration_sum, \
                 duration_max = excluded.duration_max, duration_min = excluded.duration_min, \
                 metadata_sum = excluded.metadata_sum, p95_digest = excluded.p95_digest",
            )
            .bind(&kind)
            .bind(&target)
            .bind(&operation)
            .bind(aligned_start)
            .bind(merged.count)
            .bind(merged.success_count)
            .bind(merged.failure_count)
            .bind(merged.duration_sum)
            .bind(merged.duration_max)
            .bind(merged.duration_min)
            .bind(serde_json::to_string(&merged.metadata_sum)?)
            .bind(merged.p95_digest.serialize())
            .execute(&mut *tx)
            .await?;

            let source_id = row.get::<i64, _>("id");
            // Explicit rather than relying solely on the schema's
            // ON DELETE CASCADE: the `foreign_keys` pragma is
            // per-connection and this pool may hand out others.
            sqlx::query("DELETE FROM samples WHERE bucket_id = ?1")
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM buckets WHERE id = ?1")
                .bind(source_id)
                .execute(&mut *tx)
                .await?;

            merged_count += 1;
        }

        tx.commit().await?;
        Ok(merged_count)
    }
}

fn merge_bucket_row(row: &sqlx::sqlite::SqliteRow, incoming: &Bucket) -> StorageResult<Bucket> {
    let existing_metadata: std::collections::HashMap<String, f64> =
        serde_json::from_str(row.get::<String, _>("metadata_sum").as_str())?;
    let mut metadata_sum = existing_metadata;
    for (k, v) in &incoming.metadata_sum {
        *metadata_sum.entry(k.clone()).or_insert(0.0) += v;
    }

    let mut digest = crate::tdigest::TDigest::deserialize(row.get("p95_digest"));
    digest.merge(&incoming.p95_digest);

    Ok(Bucket {
        kind: incoming.kind,
        target: incoming.target.clone(),
        operation: incoming.operation.clone(),
        bucket_start: incoming.bucket_start,
        count: row.get::<i64, _>("count") + incoming.count,
        success_count: row.get::<i64, _>("success_count") + incoming.success_count,
        failure_count: row.get::<i64, _>("failure_count") + incoming.failure_count,
        duration_sum: row.get::<f64, _>("duration_sum") + incoming.duration_sum,
        duration_max: row.get::<f64, _>("duration_max").max(incoming.duration_max),
        duration_min: row.get::<f64, _>("duration_min").min(incoming.duration_min),
        metadata_sum,
        p95_digest: digest,
    })
}

fn merge_error_row(
    row: &sqlx::sqlite::SqliteRow,
    incoming: &ErrorRecord,
    context_ring_size: usize,
) -> StorageResult<ErrorRecord> {
    let existing_contexts: Vec<serde_json::Value> =
        serde_json::from_str(row.get::<String, _>("contexts").as_str())?;
    let mut contexts = incoming.contexts.clone();
    contexts.extend(existing_contexts);
    contexts.truncate(context_ring_size);

    let mut occurrence_buckets: OccurrenceBuckets =
        serde_json::from_str(row.get::<String, _>("occurrence_buckets").as_str())?;
    occurrence_buckets.merge(&incoming.occurrence_buckets);

    let first_occurred_at = DateTime::from_timestamp(row.get::<i64, _>("first_occurred_at"), 0)
        .unwrap_or(incoming.first_occurred_at);
    let last_occurred_at = incoming
        .last_occurred_at
        .max(DateTime::from_timestamp(row.get::<i64, _>("last_occurred_at"), 0).unwrap_or(incoming.last_occurred_at));

    Ok(ErrorRecord {
        fingerprint: incoming.fingerprint.clone(),
        kind: incoming.kind,
        error_class: incoming.error_class.clone(),
        message: incoming.message.clone(),
        occurrences_count: row.get::<i64, _>("occurrences_count") + incoming.occurrences_count,
        first_occurred_at,
        last_occurred_at,
        contexts,
        occurrence_buckets,
        // Re-occurrence clears a prior resolution (spec §4.8 Error merge).
        resolved_at: None,
        pinned: incoming.pinned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BucketKey;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_adapter() -> SqliteAdapter {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let adapter = SqliteAdapter::new(pool);
        adapter.ensure_schema().await.unwrap();
        adapter
    }

    fn sample_bucket(count: i64) -> Bucket {
        let key = BucketKey {
            kind: Kind::Http,
            target: "Users#index".into(),
            operation: "GET".into(),
            bucket_start: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let mut digest = crate::tdigest::TDigest::new(100.0);
        for _ in 0..count {
            digest.add(10.0);
        }
        Bucket {
            kind: key.kind,
            target: key.target,
            operation: key.operation,
            bucket_start: key.bucket_start,
            count,
            success_count: count,
            failure_count: 0,
            duration_sum: count as f64 * 10.0,
            duration_max: 10.0,
            duration_min: 10.0,
            metadata_sum: Default::default(),
            p95_digest: digest,
        }
    }

    #[tokio::test]
    async fn persisting_the_same_key_twice_sums_counts() {
        let adapter = memory_adapter().await;
        adapter.persist_buckets(&[sample_bucket(100)]).await.unwrap();
        adapter.persist_buckets(&[sample_bucket(50)]).await.unwrap();

        let sizes = adapter.table_sizes().await.unwrap();
        assert_eq!(sizes.buckets, 1);
    }

    #[tokio::test]
    async fn table_sizes_reflects_inserted_rows() {
        let adapter = memory_adapter().await;
        adapter.persist_buckets(&[sample_bucket(10)]).await.unwrap();
        let sizes = adapter.table_sizes().await.unwrap();
        assert_eq!(sizes.buckets, 1);
        assert_eq!(sizes.samples, 0);
    }
}
