//! Per-task segment context (spec §4.12, §9).
//!
//! The teacher's `ContextStore` is a process-global `Mutex<VecDeque<_>>`
//! keyed by pid — fine for system-wide process history, wrong for
//! per-request span correlation across concurrently-running tasks. Spec
//! §9 calls that out explicitly: "avoid a process-global; use task-local
//! / continuation-local storage." `tokio::task_local!` gives each
//! spawned task (and everything it `.await`s without spawning off) its
//! own segment list, with no cross-task leakage and nothing to clean up
//! manually beyond the scope the host wraps around a request.

use std::cell::RefCell;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::event::Segment;

tokio::task_local! {
    static SEGMENTS: Arc<AsyncMutex<RefCell<Vec<Segment>>>>;
}

/// Runs `f` with a fresh, empty segment context installed for the
/// duration — the shape `track_request` uses to start a top-level trace
/// (spec §4.12).
pub async fn install_context<F, Fut, T>(f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let segments = Arc::new(AsyncMutex::new(RefCell::new(Vec::new())));
    SEGMENTS.scope(segments, f()).await
}

/// Appends a segment to the current task's context, if one is
/// installed. No-op otherwise — callers outside a `track_request` scope
/// degrade to plain `trace` behavior (spec §4.12 `span`).
pub async fn append_segment(segment: Segment) -> bool {
    if let Ok(segments) = SEGMENTS.try_with(|s| s.clone()) {
        let guard = segments.lock().await;
        guard.borrow_mut().push(segment);
        true
    } else {
        false
    }
}

/// True when a segment context is active on the current task.
pub fn has_context() -> bool {
    SEGMENTS.try_with(|_| ()).is_ok()
}

/// Snapshots and clears the current task's accumulated segments. Called
/// once at the end of `track_request` to attach them to the outgoing
/// trace event.
pub async fn take_segments() -> Vec<Segment> {
    if let Ok(segments) = SEGMENTS.try_with(|s| s.clone()) {
        let guard = segments.lock().await;
        guard.replace(Vec::new())
    } else {
        Vec::new()
    }
}
