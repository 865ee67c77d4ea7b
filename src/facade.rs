//! Public ingestion API offered to collaborators (spec §4.12, C12).
//!
//! Every entry point constructs an [`Event`], pushes it to the buffer,
//! and returns — never blocks beyond the buffer's short critical
//! section, never raises to the caller. `trace`/`track_request` forward
//! the block's own panic after recording it as an error event; nothing
//! else in the core's internals is allowed to propagate here (spec §7).

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::FutureExt;

use crate::buffer::{Buffer, PushOutcome};
use crate::circuit_breaker::CircuitBreaker;
use crate::compactor::Compactor;
use crate::config::{truncate_metadata, truncate_str, Config, MetadataMap};
use crate::context;
use crate::error::CoreError;
use crate::event::{
    BusinessEvent, ErrorContext, ErrorEvent, Event, Kind, Segment, SegmentSummaryEntry, Status,
    TraceEvent,
};
use crate::fingerprint;
use crate::flusher::Flusher;
use crate::metrics::{Metrics, StatsSnapshot};
use crate::storage::{StorageAdapter, TableSizes};

/// Host-supplied hook invoked on persistence/configuration failure.
/// Default behavior is "swallow, increment stats" (spec §4.10, §6
/// `error_handler`).
pub type ErrorHandler = Arc<dyn Fn(&CoreError) + Send + Sync>;

fn default_error_handler() -> ErrorHandler {
    Arc::new(|err| tracing::warn!(error = %err, "inproc-apm internal error"))
}

/// The embeddable core. One instance per process; wraps the buffer,
/// flusher, and optional compactor, and exposes the façade methods
/// collaborators call.
pub struct Core {
    buffer: Arc<Buffer>,
    flusher: Arc<Flusher>,
    compactor: Option<Arc<Compactor>>,
    metrics: Arc<Metrics>,
    storage: Arc<dyn StorageAdapter>,
    config: Config,
    error_handler: ErrorHandler,
    enabled: bool,
    app_roots: Vec<String>,
}

impl Core {
    /// Validates `config`, wires up the buffer/breaker/flusher/compactor,
    /// and ensures the schema exists. On a configuration error, returns
    /// a disabled core whose façade methods are all no-ops rather than
    /// failing construction (spec §7 ConfigurationError).
    pub async fn new(
        config: Config,
        storage: Arc<dyn StorageAdapter>,
        app_roots: Vec<String>,
    ) -> Result<Self, CoreError> {
        Self::with_error_handler(config, storage, app_roots, default_error_handler()).await
    }

    pub async fn with_error_handler(
        config: Config,
        storage: Arc<dyn StorageAdapter>,
        app_roots: Vec<String>,
        error_handler: ErrorHandler,
    ) -> Result<Self, CoreError> {
        let enabled = match config.validate() {
            Ok(()) => config.enabled,
            Err(err) => {
                error_handler(&err);
                false
            }
        };

        let metrics = Arc::new(Metrics::new());
        let buffer = Arc::new(Buffer::new(config.max_buffer_memory_bytes, config.hard_cap_multiplier));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_failure_threshold,
            config.circuit_cool_off(),
        ));

        if enabled {
            storage
                .ensure_schema()
                .await
                .map_err(CoreError::PersistenceFailure)?;
        }

        let flusher = Arc::new(Flusher::new(
            Arc::clone(&buffer),
            Arc::clone(&storage),
            Arc::clone(&breaker),
            Arc::clone(&metrics),
            config.clone(),
        ));

        let compactor = if config.compaction_enabled {
            Some(Arc::new(Compactor::new(Arc::clone(&storage), config.clone())))
        } else {
            None
        };

        Ok(Self {
            buffer,
            flusher,
            compactor,
            metrics,
            storage,
            config,
            error_handler,
            enabled,
            app_roots,
        })
    }

    /// Starts the background flusher (and compactor, if enabled).
    /// Rejects a second call (spec §5: exactly one Flusher/Compactor per
    /// process).
    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.flusher.start();
        if let Some(compactor) = &self.compactor {
            compactor.start();
        }
    }

    /// Graceful shutdown with a bounded grace period (spec §5, default
    /// 5s).
    pub async fn stop(&self) {
        self.flusher.stop(std::time::Duration::from_secs(5)).await;
        if let Some(compactor) = &self.compactor {
            compactor.stop();
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.buffer_size = self.buffer.size();
        snapshot.buffer_bytes = self.buffer.bytes();
        snapshot.dropped_events = self.buffer.dropped_count();
        snapshot
    }

    pub async fn table_sizes(&self) -> Result<TableSizes, CoreError> {
        self.storage
            .table_sizes()
            .await
            .map_err(CoreError::PersistenceFailure)
    }

    /// Runs one flush cycle synchronously — for tests driving §8's
    /// concrete scenarios (spec §4.10 `flush_cycle`).
    pub async fn flush_cycle(&self) {
        self.flusher.flush_cycle().await;
    }

    pub async fn compact_once(&self) {
        if let Some(compactor) = &self.compactor {
            compactor.compact_once().await;
        }
    }

    fn push_trace(&self, trace: TraceEvent) {
        if !self.enabled {
            return;
        }
        if let PushOutcome::Dropped = self.buffer.push(Event::Trace(trace)) {
            self.metrics.record_drop();
        }
    }

    fn push_error(&self, error: ErrorEvent) {
        if !self.enabled {
            return;
        }
        if let PushOutcome::Dropped = self.buffer.push(Event::Error(error)) {
            self.metrics.record_drop();
        }
    }

    /// `event(name, payload)`: enqueues a business event, only if
    /// `events_enabled` (spec §4.12).
    pub fn event(&self, name: impl Into<String>, payload: serde_json::Value) {
        if !self.enabled || !self.config.events_enabled {
            return;
        }
        let name: String = name.into();
        let event = BusinessEvent {
            name: truncate_str(&name, self.config.max_string_bytes),
            recorded_at: Utc::now(),
            payload,
        };
        if let PushOutcome::Dropped = self.buffer.push(Event::BusinessEvent(event)) {
            self.metrics.record_drop();
        }
    }

    fn fingerprint_panic(&self, error_class: &str, message: &str) -> String {
        let frames = fingerprint::normalize_frames(&[], &self.app_roots);
        fingerprint::fingerprint(&format!("{error_class}:{message}"), &frames)
    }

    fn record_trace_outcome(
        &self,
        kind: Kind,
        target: &str,
        operation: &str,
        metadata: MetadataMap,
        started_at: chrono::DateTime<Utc>,
        elapsed_ms: f64,
        segments: Vec<Segment>,
        error: Option<(String, String)>,
    ) {
        let max_bytes = self.config.max_string_bytes;
        let target = truncate_str(target, max_bytes);
        let operation = truncate_str(operation, max_bytes);
        let metadata = truncate_metadata(metadata, self.config.max_metadata_keys);

        let error_ref = error.as_ref().map(|(class, message)| {
            let class = truncate_str(class, max_bytes);
            let message = truncate_str(message, max_bytes);
            let fingerprint = self.fingerprint_panic(&class, &message);
            self.push_error(ErrorEvent {
                fingerprint: fingerprint.clone(),
                kind,
                error_class: class,
                message,
                occurred_at: Utc::now(),
                context: ErrorContext {
                    backtrace: Vec::new(),
                    request_info: serde_json::json!({ "target": target }),
                },
            });
            fingerprint
        });

        let segment_summary = summarize_segments(&segments);

        self.push_trace(TraceEvent {
            kind,
            target,
            operation,
            duration_ms: elapsed_ms,
            status: if error_ref.is_some() { Status::Failure } else { Status::Success },
            recorded_at: started_at,
            segments,
            segment_summary,
            metadata,
            error_ref,
        });
    }

    /// `trace(target, kind, metadata, block)`: times `block`, records
    /// success/failure, and captures a panic as an error event with its
    /// fingerprint attached before resuming the unwind (spec §4.12).
    pub async fn trace<F, Fut, T>(
        &self,
        target: &str,
        kind: Kind,
        metadata: MetadataMap,
        block: F,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = AssertUnwindSafe(block()).catch_unwind().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                self.record_trace_outcome(
                    kind, target, "", metadata, started_at, elapsed_ms, Vec::new(), None,
                );
                result
            }
            Err(payload) => {
                self.record_trace_outcome(
                    kind,
                    target,
                    "",
                    metadata,
                    started_at,
                    elapsed_ms,
                    Vec::new(),
                    Some(("PanicError".to_string(), panic_message(&*payload))),
                );
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// `span(name, type, block)`: appends a segment to the active
    /// `segments_context` if one exists; otherwise behaves like `trace`
    /// (spec §4.12). A panic is recorded (as a top-level trace when no
    /// context is active) and re-raised either way.
    pub async fn span<F, Fut, T>(&self, name: &str, segment_type: &str, block: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(block()).catch_unwind().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let in_context = context::has_context();

        if in_context {
            context::append_segment(Segment {
                segment_type: segment_type.to_string(),
                duration_ms: elapsed_ms,
                detail: Some(name.to_string()),
                source: None,
            })
            .await;
        }

        match outcome {
            Ok(result) => {
                if !in_context {
                    self.record_trace_outcome(
                        Kind::Custom,
                        name,
                        "",
                        MetadataMap::new(),
                        Utc::now(),
                        elapsed_ms,
                        Vec::new(),
                        None,
                    );
                }
                result
            }
            Err(payload) => {
                if !in_context {
                    self.record_trace_outcome(
                        Kind::Custom,
                        name,
                        "",
                        MetadataMap::new(),
                        Utc::now(),
                        elapsed_ms,
                        Vec::new(),
                        Some(("PanicError".to_string(), panic_message(&*payload))),
                    );
                }
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// `track_request(kind, target, block)`: installs a fresh segment
    /// context for the block's duration, then records one trace event
    /// with whatever segments accumulated inside it (spec §4.12). A
    /// panic inside `block` is recorded as the trace's error before
    /// being re-raised, with segments accumulated up to that point
    /// still attached.
    pub async fn track_request<F, Fut, T>(&self, kind: Kind, target: &str, block: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let started_at = Utc::now();
        let start = Instant::now();

        let (outcome, segments) = context::install_context(|| async {
            let outcome = AssertUnwindSafe(block()).catch_unwind().await;
            let segments = context::take_segments().await;
            (outcome, segments)
        })
        .await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                self.record_trace_outcome(
                    kind,
                    target,
                    "",
                    MetadataMap::new(),
                    started_at,
                    elapsed_ms,
                    segments,
                    None,
                );
                result
            }
            Err(payload) => {
                self.record_trace_outcome(
                    kind,
                    target,
                    "",
                    MetadataMap::new(),
                    started_at,
                    elapsed_ms,
                    segments,
                    Some(("PanicError".to_string(), panic_message(&*payload))),
                );
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// Starts a manual trace for non-block use; call `finish` to record
    /// it (spec §4.12 `start_trace`/`Handle.finish`).
    pub fn start_trace(&self, target: &str, kind: Kind, metadata: MetadataMap) -> TraceHandle<'_> {
        TraceHandle {
            core: self,
            target: target.to_string(),
            kind,
            metadata,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }
}

/// Extracts a human-readable message from a caught panic payload. Covers
/// the two payload shapes `std::panic!`/`.unwrap()` actually produce.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

fn summarize_segments(segments: &[Segment]) -> std::collections::HashMap<String, SegmentSummaryEntry> {
    let mut summary: std::collections::HashMap<String, SegmentSummaryEntry> = Default::default();
    for segment in segments {
        let entry = summary.entry(segment.segment_type.clone()).or_default();
        entry.count += 1;
        entry.duration_ms += segment.duration_ms;
    }
    summary
}

/// Manual trace handle for call sites that can't wrap a block — start
/// it, do work, call `finish` with the outcome.
pub struct TraceHandle<'a> {
    core: &'a Core,
    target: String,
    kind: Kind,
    metadata: MetadataMap,
    started_at: chrono::DateTime<Utc>,
    start: Instant,
}

impl<'a> TraceHandle<'a> {
    pub fn finish(self, status: Status) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.core.record_trace_outcome(
            self.kind,
            &self.target,
            "",
            self.metadata,
            self.started_at,
            elapsed_ms,
            Vec::new(),
            if status == Status::Failure {
                Some(("ManualTraceFailure".to_string(), "finished with failure".to_string()))
            } else {
                None
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteAdapter;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_core() -> Core {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let adapter = Arc::new(SqliteAdapter::new(pool));
        Core::new(Config::default(), adapter, vec!["/app".to_string()])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn trace_records_success_and_flush_persists_it() {
        let core = test_core().await;
        for _ in 0..5 {
            core.trace("Users#index", Kind::Http, MetadataMap::new(), || async { 42 })
                .await;
        }
        core.flush_cycle().await;

        let sizes = core.table_sizes().await.unwrap();
        assert_eq!(sizes.buckets, 1);
    }

    #[tokio::test]
    async fn event_is_dropped_when_events_disabled() {
        let core = test_core().await;
        core.event("signup", serde_json::json!({}));
        assert_eq!(core.stats().buffer_size, 0);
    }

    #[tokio::test]
    async fn trace_records_failure_and_reraises_on_panic() {
        let core = test_core().await;
        let result = std::panic::AssertUnwindSafe(core.trace(
            "Users#index",
            Kind::Http,
            MetadataMap::new(),
            || async { panic!("boom") },
        ))
        .catch_unwind()
        .await;
        assert!(result.is_err(), "the panic must still propagate to the caller");

        core.flush_cycle().await;
        let sizes = core.table_sizes().await.unwrap();
        assert_eq!(sizes.buckets, 1);
        assert_eq!(sizes.errors, 1);
    }

    #[tokio::test]
    async fn track_request_attaches_spans_from_its_scope() {
        let core = test_core().await;
        core.track_request(Kind::Http, "Orders#create", || async {
            core.span("select", "sql", || async { 1 }).await;
        })
        .await;

        assert_eq!(core.stats().buffer_size, 1);
    }
}
