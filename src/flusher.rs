//! Timer + emergency drain loop orchestrating C5-C9 (spec §4.10, C10).
//!
//! A single background worker: exactly one Flusher per process,
//! re-entrancy and double-start rejected (spec §5). Grounded on the
//! teacher's `SequencerConsumer::drain` for the bounded-grace shutdown
//! shape (stop signal → one last drain → bounded wait → discard).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::aggregator;
use crate::buffer::Buffer;
use crate::circuit_breaker::{CallOutcome, CircuitBreaker};
use crate::config::Config;
use crate::error::StorageError;
use crate::error_aggregator;
use crate::event::Event;
use crate::metrics::Metrics;
use crate::models::{Bucket, ErrorRecord, EventBucket, EventSample, OccurrenceBuckets};
use crate::sampler;
use crate::storage::StorageAdapter;

/// Orchestrates one drain-aggregate-persist cycle and the timer/signal
/// loop around it.
pub struct Flusher {
    buffer: Arc<Buffer>,
    storage: Arc<dyn StorageAdapter>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    config: Config,
    stop_notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    started: AtomicBool,
}

impl Flusher {
    pub fn new(
        buffer: Arc<Buffer>,
        storage: Arc<dyn StorageAdapter>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
        config: Config,
    ) -> Self {
        Self {
            buffer,
            storage,
            breaker,
            metrics,
            config,
            stop_notify: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the background loop. Calling this twice on the same
    /// `Flusher` panics — double-start is a programming error, not a
    /// runtime condition to recover from (spec §5).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            panic!("Flusher::start called twice on the same instance");
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop().await })
    }

    async fn run_loop(self: Arc<Self>) {
        let flush_needed = self.buffer.flush_needed_handle();
        let interval = self.config.flush_interval();

        loop {
            let jitter_fraction = self.config.flush_jitter_fraction.clamp(0.0, 1.0);
            let jitter = if jitter_fraction > 0.0 {
                let max_jitter = interval.as_secs_f64() * jitter_fraction;
                rand::thread_rng().gen_range(0.0..max_jitter)
            } else {
                0.0
            };
            let tick = interval + Duration::from_secs_f64(jitter);

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = flush_needed.notified() => {}
                _ = self.stop_notify.notified() => {
                    self.final_flush().await;
                    return;
                }
            }

            let _ = tokio::time::timeout(self.config.flush_timeout(), self.flush_cycle()).await;
        }
    }

    /// Graceful shutdown: finishes the current cycle, drains once more,
    /// waits up to the configured grace period, then discards whatever
    /// is left (spec §5).
    async fn final_flush(&self) {
        let _ = tokio::time::timeout(self.config.flush_timeout(), self.flush_cycle()).await;
        let discarded = self.buffer.reset();
        if discarded > 0 {
            tracing::warn!(discarded, "discarded buffered events at shutdown grace period");
        }
        self.stopped.store(true, Ordering::Release);
    }

    /// Signals the flusher to stop and waits for it to finish. Safe to
    /// call once; a second call is a no-op.
    pub async fn stop(&self, grace_period: Duration) {
        self.stop_notify.notify_one();
        let deadline = tokio::time::Instant::now() + grace_period;
        while !self.stopped.load(Ordering::Acquire) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// One full drain → aggregate → sample → persist cycle. Exposed
    /// directly so tests can drive it synchronously (spec §4.10).
    pub async fn flush_cycle(&self) {
        let drained = self.buffer.drain();
        if drained.is_empty() {
            return;
        }

        self.metrics.record_flush_attempt();

        let (traces, errors, business) = partition(drained);

        let resolution_secs = 60;
        let bucket_accumulators = aggregator::aggregate(
            &traces,
            resolution_secs,
            &self.config.ignored_targets,
            100.0,
        );
        let error_accumulators =
            error_aggregator::aggregate_errors(&errors, self.config.error_contexts_per_record);
        let samples = sampler::select_samples(&traces, &self.config.samples_per_bucket, |kind| {
            self.config.slow_threshold_ms(kind)
        });

        let buckets: Vec<Bucket> = bucket_accumulators
            .into_iter()
            .map(|acc| Bucket {
                kind: acc.key.kind,
                target: acc.key.target,
                operation: acc.key.operation,
                bucket_start: acc.key.bucket_start,
                count: acc.count as i64,
                success_count: acc.success_count as i64,
                failure_count: acc.failure_count as i64,
                duration_sum: acc.duration_sum,
                duration_max: if acc.count > 0 { acc.duration_max } else { 0.0 },
                duration_min: if acc.count > 0 { acc.duration_min } else { 0.0 },
                metadata_sum: acc.metadata_sum,
                p95_digest: acc.digest,
            })
            .collect();

        let error_records: Vec<ErrorRecord> = error_accumulators
            .into_iter()
            .map(|acc| {
                let mut occurrence_buckets = OccurrenceBuckets::new();
                for at in &acc.occurrence_times {
                    *occurrence_buckets
                        .minute
                        .entry(error_aggregator::minute_bucket(*at))
                        .or_insert(0) += 1;
                    *occurrence_buckets
                        .hour
                        .entry(error_aggregator::hour_bucket(*at))
                        .or_insert(0) += 1;
                    *occurrence_buckets
                        .day
                        .entry(error_aggregator::day_bucket(*at))
                        .or_insert(0) += 1;
                }
                ErrorRecord {
                    fingerprint: acc.fingerprint,
                    kind: acc.kind,
                    error_class: acc.error_class,
                    message: acc.message,
                    occurrences_count: acc.occurrences_count,
                    first_occurred_at: acc.first_occurred_at,
                    last_occurred_at: acc.last_occurred_at,
                    contexts: acc.new_contexts,
                    occurrence_buckets,
                    resolved_at: None,
                    pinned: false,
                }
            })
            .collect();

        let (event_buckets, event_samples) = aggregate_business_events(&business, resolution_secs);

        let batch_size = self.config.persistence_batch_size;
        let event_sample_cap = self.config.events_max_samples_per_name;
        let max_contexts = self.config.error_contexts_per_record;
        let storage = Arc::clone(&self.storage);

        let outcome = self
            .breaker
            .call(move || {
                let storage = Arc::clone(&storage);
                let buckets = buckets.clone();
                let samples = samples.clone();
                let error_records = error_records.clone();
                let event_buckets = event_buckets.clone();
                let event_samples = event_samples.clone();
                async move {
                    storage.persist_buckets(&buckets).await?;
                    storage.persist_samples(&samples, batch_size).await?;
                    storage.persist_errors(&error_records, max_contexts).await?;
                    storage.persist_event_buckets(&event_buckets).await?;
                    storage
                        .persist_event_samples(&event_samples, event_sample_cap)
                        .await?;
                    Ok::<(), StorageError>(())
                }
            })
            .await;

        match outcome {
            CallOutcome::Ran(()) => {
                self.metrics.set_breaker_state(self.breaker.state());
            }
            CallOutcome::Tripped => {
                self.metrics.record_flush_failure();
                self.metrics.set_breaker_state(self.breaker.state());
                tracing::warn!("flush cycle discarded: breaker open or adapter call failed");
            }
        }
    }
}

fn partition(
    events: Vec<Event>,
) -> (
    Vec<crate::event::TraceEvent>,
    Vec<crate::event::ErrorEvent>,
    Vec<crate::event::BusinessEvent>,
) {
    let mut traces = Vec::new();
    let mut errors = Vec::new();
    let mut business = Vec::new();
    for event in events {
        match event {
            Event::Trace(t) => traces.push(t),
            Event::Error(e) => errors.push(e),
            Event::BusinessEvent(b) => business.push(b),
        }
    }
    (traces, errors, business)
}

fn aggregate_business_events(
    events: &[crate::event::BusinessEvent],
    resolution_secs: i64,
) -> (Vec<EventBucket>, Vec<EventSample>) {
    use std::collections::HashMap;

    let mut counts: HashMap<(String, i64), i64> = HashMap::new();
    let mut samples = Vec::new();

    for event in events {
        let start = aggregator::bucket_start(event.recorded_at, resolution_secs);
        *counts.entry((event.name.clone(), start.timestamp())).or_insert(0) += 1;
        samples.push(EventSample {
            name: event.name.clone(),
            payload: event.payload.clone(),
            recorded_at: event.recorded_at,
        });
    }

    let buckets = counts
        .into_iter()
        .map(|((name, start), count)| EventBucket {
            name,
            bucket_start: chrono::DateTime::from_timestamp(start, 0).unwrap_or_default(),
            count,
        })
        .collect();

    (buckets, samples)
}
