//! Dialect A: full-featured SQL with server-side atomic upserts (spec
//! §4.8).
//!
//! Unlike [`super::sqlite::SqliteAdapter`], the numeric columns merge
//! inside a single `INSERT ... ON CONFLICT ... DO UPDATE` statement
//! computed by Postgres itself, with no process-wide write lock —
//! concurrency is handled by Postgres's own row-level locking (spec
//! §4.8 Connection discipline). The t-digest and metadata columns have
//! no SQL-expressible merge, so those fall back to a `SELECT ... FOR
//! UPDATE` read-modify-write, scoped to just the one row in conflict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::StorageResult;
use crate::event::Kind;
use crate::models::{Bucket, ErrorRecord, EventBucket, EventSample, OccurrenceBuckets, Sample};

use super::{StorageAdapter, TableSizes};

pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
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
impl StorageAdapter for PostgresAdapter {
    async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                operation TEXT NOT NULL,
                bucket_start TIMESTAMPTZ NOT NULL,
                count BIGINT NOT NULL DEFAULT 0,
                success_count BIGINT NOT NULL DEFAULT 0,
                failure_count BIGINT NOT NULL DEFAULT 0,
                duration_sum DOUBLE PRECISION NOT NULL DEFAULT 0,
                duration_max DOUBLE PRECISION NOT NULL DEFAULT 0,
                duration_min DOUBLE PRECISION NOT NULL DEFAULT 0,
                metadata_sum JSONB NOT NULL DEFAULT '{}',
                p95_digest BYTEA NOT NULL DEFAULT '',
                UNIQUE(kind, target, operation, bucket_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_buckets_start ON buckets(bucket_start)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_buckets_kind_start ON buckets(kind, bucket_start)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS samples (
                id BIGSERIAL PRIMARY KEY,
                bucket_id BIGINT REFERENCES buckets(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                sample_type TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                duration DOUBLE PRECISION NOT NULL,
                context JSONB NOT NULL DEFAULT '{}',
                error_fingerprint TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_samples_recorded ON samples(recorded_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_kind_recorded ON samples(kind, recorded_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_fingerprint ON samples(error_fingerprint)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS errors (
                id BIGSERIAL PRIMARY KEY,
                fingerprint TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                error_class TEXT NOT NULL,
                message TEXT NOT NULL,
                occurrences_count BIGINT NOT NULL DEFAULT 0,
                first_occurred_at TIMESTAMPTZ NOT NULL,
                last_occurred_at TIMESTAMPTZ NOT NULL,
                contexts JSONB NOT NULL DEFAULT '[]',
                occurrence_buckets JSONB NOT NULL DEFAULT '{}',
                resolved_at TIMESTAMPTZ,
                pinned BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_buckets (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                bucket_start TIMESTAMPTZ NOT NULL,
                count BIGINT NOT NULL DEFAULT 0,
                UNIQUE(name, bucket_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_samples (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}',
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_samples_name ON event_samples(name, recorded_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn persist_buckets(&self, buckets: &[Bucket]) -> StorageResult<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for b in buckets {
            // The numeric columns merge atomically via the server-side
            // upsert below, but a t-digest byte blob has no
            // SQL-expressible merge. `DO NOTHING` tells us whether a row
            // already existed without double-counting a fresh insert;
            // an existing row is then locked and merged in Rust, the
            // same way the SQLite adapter does it.
            let inserted = sqlx::query(
                "INSERT INTO buckets (kind, target, operation, bucket_start, count, \
                 success_count, failure_count, duration_sum, duration_max, duration_min, \
                 metadata_sum, p95_digest) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12) \
                 ON CONFLICT (kind, target, operation, bucket_start) DO NOTHING \
                 RETURNING id",
            )
            .bind(Self::kind_str(b.kind))
            .bind(&b.target)
            .bind(&b.operation)
            .bind(b.bucket_start)
            .bind(b.count)
            .bind(b.success_count)
            .bind(b.failure_count)
            .bind(b.duration_sum)
            .bind(b.duration_max)
            .bind(b.duration_min)
            .bind(serde_json::to_value(&b.metadata_sum)?)
            .bind(b.p95_digest.serialize())
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_some() {
                continue;
            }

            let existing = sqlx::query(
                "SELECT count, success_count, failure_count, duration_sum, duration_max, \
                 duration_min, metadata_sum, p95_digest FROM buckets \
                 WHERE kind = $1 AND target = $2 AND operation = $3 AND bucket_start = $4 \
                 FOR UPDATE",
            )
            .bind(Self::kind_str(b.kind))
            .bind(&b.target)
            .bind(&b.operation)
            .bind(b.bucket_start)
            .fetch_one(&mut *tx)
            .await?;

            let merged = merge_bucket_row(&existing, b)?;

            sqlx::query(
                "UPDATE buckets SET count = $5, success_count = $6, failure_count = $7, \
                 duration_sum = $8, duration_max = $9, duration_min = $10, metadata_sum = $11, \
                 p95_digest = $12 WHERE kind = $1 AND target = $2 AND operation = $3 \
                 AND bucket_start = $4",
            )
            .bind(Self::kind_str(merged.kind))
            .bind(&merged.target)
            .bind(&merged.operation)
            .bind(merged.bucket_start)
            .bind(merged.count)
            .bind(merged.success_count)
            .bind(merged.failure_count)
            .bind(merged.duration_sum)
            .bind(merged.duration_max)
            .bind(merged.duration_min)
            .bind(serde_json::to_value(&merged.metadata_sum)?)
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
        for chunk in samples.chunks(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            for s in chunk {
                let bucket_id: Option<i64> = sqlx::query(
                    "SELECT id FROM buckets WHERE kind = $1 AND target = $2 AND operation = $3 \
                     AND bucket_start = $4",
                )
                .bind(Self::kind_str(s.kind))
                .bind(&s.target)
                .bind(&s.operation)
                .bind(s.bucket_start)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get::<i64, _>("id"));

                sqlx::query(
                    "INSERT INTO samples (bucket_id, kind, sample_type, recorded_at, duration, \
                     context, error_fingerprint) VALUES ($1,$2,$3,$4,$5,$6,$7)",
                )
                .bind(bucket_id)
                .bind(Self::kind_str(s.kind))
                .bind(format!("{:?}", s.sample_type).to_lowercase())
                .bind(s.recorded_at)
                .bind(s.duration_ms)
                .bind(serde_json::to_value(&s.context)?)
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
        let mut tx = self.pool.begin().await?;
        for e in errors {
            let inserted = sqlx::query(
                "INSERT INTO errors (fingerprint, kind, error_class, message, occurrences_count, \
                 first_occurred_at, last_occurred_at, contexts, occurrence_buckets, resolved_at, \
                 pinned) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
                 ON CONFLICT (fingerprint) DO NOTHING RETURNING id",
            )
            .bind(&e.fingerprint)
            .bind(Self::kind_str(e.kind))
            .bind(&e.error_class)
            .bind(&e.message)
            .bind(e.occurrences_count)
            .bind(e.first_occurred_at)
            .bind(e.last_occurred_at)
            .bind(serde_json::to_value(&e.contexts)?)
            .bind(serde_json::to_value(&e.occurrence_buckets)?)
            .bind(e.resolved_at)
            .bind(e.pinned)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_some() {
                continue;
            }

            // Appending contexts then truncating to the N most recent
            // can't be expressed as a single JSONB expression without a
            // custom aggregate, so merge in Rust under a row lock, same
            // as the bucket digest above (spec §4.8 Error merge).
            let existing = sqlx::query(
                "SELECT occurrences_count, first_occurred_at, last_occurred_at, contexts, \
                 occurrence_buckets, resolved_at FROM errors WHERE fingerprint = $1 FOR UPDATE",
            )
            .bind(&e.fingerprint)
            .fetch_one(&mut *tx)
            .await?;

            let merged = merge_error_row(&existing, e, max_contexts)?;

            sqlx::query(
                "UPDATE errors SET occurrences_count = $2, last_occurred_at = $3, contexts = $4, \
                 occurrence_buckets = $5, resolved_at = $6 WHERE fingerprint = $1",
            )
            .bind(&merged.fingerprint)
            .bind(merged.occurrences_count)
            .bind(merged.last_occurred_at)
            .bind(serde_json::to_value(&merged.contexts)?)
            .bind(serde_json::to_value(&merged.occurrence_buckets)?)
            .bind(merged.resolved_at)
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
        let mut tx = self.pool.begin().await?;
        for b in buckets {
            sqlx::query(
                "INSERT INTO event_buckets (name, bucket_start, count) VALUES ($1,$2,$3) \
                 ON CONFLICT (name, bucket_start) DO UPDATE SET \
                 count = event_buckets.count + excluded.count",
            )
            .bind(&b.name)
            .bind(b.bucket_start)
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
        let mut tx = self.pool.begin().await?;
        for s in samples {
            sqlx::query("INSERT INTO event_samples (name, payload, recorded_at) VALUES ($1,$2,$3)")
                .bind(&s.name)
                .bind(serde_json::to_value(&s.payload)?)
                .bind(s.recorded_at)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "DELETE FROM event_samples WHERE name = $1 AND id NOT IN ( \
                 SELECT id FROM event_samples WHERE name = $1 ORDER BY recorded_at DESC LIMIT $2)",
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
        async fn count(pool: &PgPool, table: &str) -> StorageResult<i64> {
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
        let lower = range_start.unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap());

        let misaligned = sqlx::query(
            "SELECT id, kind, target, operation, bucket_start, count, success_count, \
             failure_count, duration_sum, duration_max, duration_min, metadata_sum, p95_digest \
             FROM buckets WHERE bucket_start >= $1 AND bucket_start < $2 \
             AND EXTRACT(EPOCH FROM bucket_start)::bigint % $3 != 0",
        )
        .bind(lower)
        .bind(range_end)
        .bind(interval_seconds)
        .fetch_all(&self.pool)
        .await?;

        if misaligned.is_empty() {
            return Ok(0);
        }

        // Folded per source row rather than one server-side CTE: a
        // t-digest byte blob and an arbitrary metadata map have no
        // SQL-expressible merge, so each misaligned row is merged into
        // its aligned target the same way a normal `persist_buckets`
        // merge would (spec §4.11 merges using §4.8 semantics).
        let mut tx = self.pool.begin().await?;
        let mut merged_count = 0u64;

        for row in &misaligned {
            let bucket_start: DateTime<Utc> = row.get("bucket_start");
            let aligned_secs = (bucket_start.timestamp() / interval_seconds) * interval_seconds;
            let aligned_start = DateTime::from_timestamp(aligned_secs, 0).unwrap_or_default();
            let kind: String = row.get("kind");
            let target: String = row.get("target");
            let operation: String = row.get("operation");

            let source = Bucket {
                kind: Self::parse_kind(&kind),
                target: target.clone(),
                operation: operation.clone(),
                bucket_start,
                count: row.get("count"),
                success_count: row.get("success_count"),
                failure_count: row.get("failure_count"),
                duration_sum: row.get("duration_sum"),
                duration_max: row.get("duration_max"),
                duration_min: row.get("duration_min"),
                metadata_sum: serde_json::from_value(row.get::<serde_json::Value, _>("metadata_sum"))
                    .unwrap_or_default(),
                p95_digest: crate::tdigest::TDigest::deserialize(row.get("p95_digest")),
            };

            let inserted = sqlx::query(
                "INSERT INTO buckets (kind, target, operation, bucket_start, count, \
                 success_count, failure_count, duration_sum, duration_max, duration_min, \
                 metadata_sum, p95_digest) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12) \
                 ON CONFLICT (kind, target, operation, bucket_start) DO NOTHING \
                 RETURNING id",
            )
            .bind(&kind)
            .bind(&target)
            .bind(&operation)
            .bind(aligned_start)
            .bind(source.count)
            .bind(source.success_count)
            .bind(source.failure_count)
            .bind(source.duration_sum)
            .bind(source.duration_max)
            .bind(source.duration_min)
            .bind(serde_json::to_value(&source.metadata_sum)?)
            .bind(source.p95_digest.serialize())
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_none() {
                let existing = sqlx::query(
                    "SELECT count, success_count, failure_count, duration_sum, duration_max, \
                     duration_min, metadata_sum, p95_digest FROM buckets \
                     WHERE kind = $1 AND target = $2 AND operation = $3 AND bucket_start = $4 \
                     FOR UPDATE",
                )
                .bind(&kind)
                .bind(&target)
                .bind(&operation)
                .bind(aligned_start)
                .fetch_one(&mut *tx)
                .await?;

                let merged = merge_bucket_row(&existing, &source)?;

                sqlx::query(
                    "UPDATE buckets SET count = $5, success_count = $6, failure_count = $7, \
                     duration_sum = $8, duration_max = $9, duration_min = $10, metadata_sum = $11, \
                     p95_digest = $12 WHERE kind = $1 AND target = $2 AND operation = $3 \
                     AND bucket_start = $4",
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
                .bind(serde_json::to_value(&merged.metadata_sum)?)
                .bind(merged.p95_digest.serialize())
                .execute(&mut *tx)
                .await?;
            }

            // Source bucket's samples cascade-delete via the FK (spec
            // §4.11): Postgres enforces `ON DELETE CASCADE` per
            // connection, unlike SQLite's pragma.
            sqlx::query("DELETE FROM buckets WHERE id = $1")
                .bind(row.get::<i64, _>("id"))
                .execute(&mut *tx)
                .await?;

            merged_count += 1;
        }

        tx.commit().await?;
        Ok(merged_count)
    }
}

fn merge_bucket_row(row: &sqlx::postgres::PgRow, incoming: &Bucket) -> StorageResult<Bucket> {
    let existing_metadata: std::collections::HashMap<String, f64> =
        serde_json::from_value(row.get::<serde_json::Value, _>("metadata_sum"))?;
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
    row: &sqlx::postgres::PgRow,
    incoming: &ErrorRecord,
    context_ring_size: usize,
) -> StorageResult<ErrorRecord> {
    let existing_contexts: Vec<serde_json::Value> =
        serde_json::from_value(row.get::<serde_json::Value, _>("contexts"))?;
    let mut contexts = incoming.contexts.clone();
    contexts.extend(existing_contexts);
    contexts.truncate(context_ring_size);

    let mut occurrence_buckets: OccurrenceBuckets =
        serde_json::from_value(row.get::<serde_json::Value, _>("occurrence_buckets"))?;
    occurrence_buckets.merge(&incoming.occurrence_buckets);

    let first_occurred_at: DateTime<Utc> = row.get("first_occurred_at");
    let last_occurred_at = incoming
        .last_occurred_at
        .max(row.get::<DateTime<Utc>, _>("last_occurred_at"));

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
