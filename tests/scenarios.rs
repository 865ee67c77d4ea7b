//! End-to-end scenarios mirroring the concrete walkthroughs: happy-path
//! aggregation, slow/error sample selection, error dedup, buffer
//! overflow, circuit breaker trip/recover, and compaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use inproc_apm::aggregator;
use inproc_apm::buffer::{Buffer, PushOutcome};
use inproc_apm::circuit_breaker::{CallOutcome, CircuitBreaker};
use inproc_apm::config::SampleCaps;
use inproc_apm::error::StorageResult;
use inproc_apm::error_aggregator;
use inproc_apm::event::{BusinessEvent, ErrorContext, ErrorEvent, Kind, Status, TraceEvent};
use inproc_apm::models::{
    Bucket, ErrorRecord, EventBucket, EventSample, OccurrenceBuckets, Sample,
};
use inproc_apm::sampler;
use inproc_apm::storage::sqlite::SqliteAdapter;
use inproc_apm::storage::{StorageAdapter, TableSizes};

fn trace(target: &str, duration_ms: f64, status: Status, at: chrono::DateTime<Utc>) -> TraceEvent {
    TraceEvent {
        kind: Kind::Http,
        target: target.into(),
        operation: "GET".into(),
        duration_ms,
        status,
        recorded_at: at,
        segments: Vec::new(),
        segment_summary: Default::default(),
        metadata: Default::default(),
        error_ref: None,
    }
}

async fn memory_adapter() -> Arc<SqliteAdapter> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let adapter = Arc::new(SqliteAdapter::new(pool));
    adapter.ensure_schema().await.unwrap();
    adapter
}

/// S1 Happy path, HTTP: 100 identical 10ms successes, one bucket.
#[tokio::test]
async fn s1_happy_path_http() {
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let events: Vec<_> = (0..100)
        .map(|_| trace("Users#index", 10.0, Status::Success, base))
        .collect();

    let accs = aggregator::aggregate(&events, 60, &[], 100.0);
    assert_eq!(accs.len(), 1);
    let acc = &accs[0];
    assert_eq!(acc.count, 100);
    assert_eq!(acc.success_count, 100);
    assert_eq!(acc.failure_count, 0);
    assert_eq!(acc.duration_sum, 1000.0);
    assert_eq!(acc.duration_max, 10.0);
    assert_eq!(acc.duration_min, 10.0);
    let p95 = acc.digest.percentile(0.95).unwrap();
    assert!((p95 - 10.0).abs() < 0.5);

    let caps = SampleCaps { slow: 3, random: 1, error: 3 };
    let samples = sampler::select_samples(&events, &caps, |_| 50.0);
    assert_eq!(samples.len(), 1, "only the random sample should fire");
    assert_eq!(samples[0].sample_type, inproc_apm::models::SampleType::Random);
}

/// S2 Slow + error mix: one failure among 10 events, 3 slow samples.
#[tokio::test]
async fn s2_slow_and_error_mix() {
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let durations = [10.0, 20.0, 30.0, 40.0, 600.0, 700.0, 800.0, 10.0, 10.0, 10.0];
    let mut events: Vec<_> = durations
        .iter()
        .enumerate()
        .map(|(i, d)| trace("Users#index", *d, Status::Success, base + chrono::Duration::seconds(i as i64)))
        .collect();
    events[6].status = Status::Failure;
    events[6].error_ref = Some("fp-runtime-error".to_string());

    let accs = aggregator::aggregate(&events, 60, &[], 100.0);
    assert_eq!(accs.len(), 1);
    assert_eq!(accs[0].count, 10);
    assert_eq!(accs[0].failure_count, 1);

    let caps = SampleCaps { slow: 3, random: 1, error: 3 };
    let samples = sampler::select_samples(&events, &caps, |_| 500.0);

    let slow: Vec<_> = samples
        .iter()
        .filter(|s| s.sample_type == inproc_apm::models::SampleType::Slow)
        .collect();
    let mut slow_durations: Vec<f64> = slow.iter().map(|s| s.duration_ms).collect();
    slow_durations.sort_by(|a, b| b.total_cmp(a));
    assert_eq!(slow_durations, vec![800.0, 700.0, 600.0]);

    let error: Vec<_> = samples
        .iter()
        .filter(|s| s.sample_type == inproc_apm::models::SampleType::Error)
        .collect();
    assert_eq!(error.len(), 1);
    assert_eq!(error[0].error_fingerprint.as_deref(), Some("fp-runtime-error"));

    let random: Vec<_> = samples
        .iter()
        .filter(|s| s.sample_type == inproc_apm::models::SampleType::Random)
        .collect();
    assert_eq!(random.len(), 1);
}

/// S3 Error dedup: repeating the same error twice yields one row with
/// occurrences_count=2 after persistence merges with itself.
#[tokio::test]
async fn s3_error_dedup_across_two_flushes() {
    let adapter = memory_adapter().await;
    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    let error_event = ErrorEvent {
        fingerprint: "fp-runtime-error".into(),
        kind: Kind::Http,
        error_class: "RuntimeError".into(),
        message: "boom".into(),
        occurred_at: t0,
        context: ErrorContext {
            backtrace: vec!["app/models/user.rb:42".into()],
            request_info: serde_json::json!({}),
        },
    };

    for occurrence in 0..2 {
        let occurred_at = t0 + chrono::Duration::seconds(occurrence);
        let events = vec![ErrorEvent { occurred_at, ..error_event.clone() }];
        let accs = error_aggregator::aggregate_errors(&events, 10);
        assert_eq!(accs.len(), 1);

        let mut occurrence_buckets = OccurrenceBuckets::new();
        for at in &accs[0].occurrence_times {
            *occurrence_buckets
                .minute
                .entry(error_aggregator::minute_bucket(*at))
                .or_insert(0) += 1;
        }

        let record = ErrorRecord {
            fingerprint: accs[0].fingerprint.clone(),
            kind: accs[0].kind,
            error_class: accs[0].error_class.clone(),
            message: accs[0].message.clone(),
            occurrences_count: accs[0].occurrences_count,
            first_occurred_at: accs[0].first_occurred_at,
            last_occurred_at: accs[0].last_occurred_at,
            contexts: accs[0].new_contexts.clone(),
            occurrence_buckets,
            resolved_at: None,
            pinned: false,
        };
        adapter.persist_errors(&[record], 10).await.unwrap();
    }

    let sizes = adapter.table_sizes().await.unwrap();
    assert_eq!(sizes.errors, 1);
}

/// S4 Buffer overflow: 4 KiB of events against a 1 KiB soft cap (3 KiB
/// hard cap) drops the overflow but keeps all admitted events.
#[tokio::test]
async fn s4_buffer_overflow_drops_only_the_overflow() {
    let buf = Buffer::new(1024, 3);
    let event = || {
        inproc_apm::event::Event::BusinessEvent(BusinessEvent {
            name: "x".repeat(100),
            recorded_at: Utc::now(),
            payload: serde_json::json!({}),
        })
    };

    let mut accepted = 0;
    let mut dropped = 0;
    // ~228 bytes/event * 20 = ~4.5 KiB against a 3 KiB hard cap.
    for _ in 0..20 {
        match buf.push(event()) {
            PushOutcome::Accepted => accepted += 1,
            PushOutcome::Dropped => dropped += 1,
        }
    }

    assert!(dropped > 0, "overflow should have been dropped");
    assert_eq!(buf.dropped_count(), dropped as u64);

    let drained = buf.drain();
    assert_eq!(drained.len(), accepted);
    assert!(buf.is_empty());
}

/// A storage adapter whose writes always fail, for driving the breaker.
struct FailingAdapter;

#[async_trait]
impl StorageAdapter for FailingAdapter {
    async fn persist_buckets(&self, _: &[Bucket]) -> StorageResult<()> {
        Err(inproc_apm::error::StorageError::Other("injected failure".into()))
    }
    async fn persist_samples(&self, _: &[Sample], _: usize) -> StorageResult<()> {
        Ok(())
    }
    async fn persist_errors(&self, _: &[ErrorRecord], _: usize) -> StorageResult<()> {
        Ok(())
    }
    async fn persist_event_buckets(&self, _: &[EventBucket]) -> StorageResult<()> {
        Ok(())
    }
    async fn persist_event_samples(&self, _: &[EventSample], _: usize) -> StorageResult<()> {
        Ok(())
    }
    async fn table_sizes(&self) -> StorageResult<TableSizes> {
        Ok(TableSizes::default())
    }
    async fn ensure_schema(&self) -> StorageResult<()> {
        Ok(())
    }
    async fn compact_bucket_band(
        &self,
        _: Option<chrono::DateTime<Utc>>,
        _: chrono::DateTime<Utc>,
        _: i64,
    ) -> StorageResult<u64> {
        Ok(0)
    }
}

/// S5 Circuit breaker: after 5 consecutive failing calls, the breaker
/// opens and skips the adapter; after cool-off, exactly one probe call
/// goes through.
#[tokio::test]
async fn s5_circuit_breaker_trips_and_recovers() {
    let breaker = CircuitBreaker::new(5, Duration::from_millis(50));
    let adapter = FailingAdapter;

    for _ in 0..5 {
        let outcome = breaker
            .call(|| adapter.persist_buckets(&[]))
            .await;
        assert!(matches!(outcome, CallOutcome::Tripped));
    }

    assert_eq!(breaker.state(), inproc_apm::BreakerState::Open);

    let mut invoked = false;
    let outcome = breaker
        .call(|| {
            invoked = true;
            async { Ok::<(), inproc_apm::error::StorageError>(()) }
        })
        .await;
    assert!(matches!(outcome, CallOutcome::Tripped));
    assert!(!invoked, "adapter must not be called while open");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(breaker.state(), inproc_apm::BreakerState::HalfOpen);

    let outcome = breaker
        .call(|| async { Ok::<(), inproc_apm::error::StorageError>(()) })
        .await;
    assert!(matches!(outcome, CallOutcome::Ran(())));
    assert_eq!(breaker.state(), inproc_apm::BreakerState::Closed);
}

/// S6 Compaction: 120 one-minute buckets spanning 2 hours ago to now,
/// compacted down to 60 one-minute + 12 five-minute rows with the total
/// count preserved.
#[tokio::test]
async fn s6_compaction_preserves_total_count() {
    let adapter = memory_adapter().await;
    let now = Utc::now();

    let mut buckets = Vec::new();
    for i in 0..120 {
        let bucket_start = now - chrono::Duration::minutes(120 - i);
        let floored = Utc.timestamp_opt((bucket_start.timestamp() / 60) * 60, 0).unwrap();
        buckets.push(Bucket {
            kind: Kind::Http,
            target: "Users#index".into(),
            operation: "GET".into(),
            bucket_start: floored,
            count: 1,
            success_count: 1,
            failure_count: 0,
            duration_sum: 10.0,
            duration_max: 10.0,
            duration_min: 10.0,
            metadata_sum: Default::default(),
            p95_digest: {
                let mut d = inproc_apm::tdigest::TDigest::new(100.0);
                d.add(10.0);
                d
            },
        });
    }
    adapter.persist_buckets(&buckets).await.unwrap();

    let sizes_before = adapter.table_sizes().await.unwrap();
    assert_eq!(sizes_before.buckets, 120);

    // Compact everything older than 1h (no floor) into 5-minute
    // resolution.
    let merged = adapter
        .compact_bucket_band(None, now - chrono::Duration::hours(1), 300)
        .await
        .unwrap();
    assert!(merged > 0);

    let sizes_after = adapter.table_sizes().await.unwrap();
    // 60 one-minute rows in the last hour, survived untouched; the
    // older 60 rows got merged down to 12 five-minute rows.
    assert_eq!(sizes_after.buckets, 60 + 12);

    let total_count: i64 = sqlx::query_scalar::<_, i64>("SELECT SUM(count) FROM buckets")
        .fetch_one(adapter.pool())
        .await
        .unwrap();
    assert_eq!(total_count, 120);
}
