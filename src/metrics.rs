//! Process-wide counters exposed through [`crate::facade::Core::stats`].
//!
//! Mirrors the teacher's `metrics.rs`: plain atomics updated from the hot
//! path and the flusher, read without locking.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use serde::Serialize;

use crate::circuit_breaker::BreakerState;

pub struct Metrics {
    pub(crate) buffer_size: AtomicUsize,
    pub(crate) buffer_bytes: AtomicUsize,
    pub(crate) dropped_events: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) flush_failures: AtomicU64,
    last_flush_at: AtomicI64,
    start_time: SystemTime,
    breaker_state: Mutex<BreakerState>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            buffer_size: AtomicUsize::new(0),
            buffer_bytes: AtomicUsize::new(0),
            dropped_events: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            last_flush_at: AtomicI64::new(0),
            start_time: SystemTime::now(),
            breaker_state: Mutex::new(BreakerState::Closed),
        }
    }

    pub fn record_drop(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_attempt(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.last_flush_at.store(
            chrono::Utc::now().timestamp(),
            Ordering::Relaxed,
        );
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_breaker_state(&self, state: BreakerState) {
        if let Ok(mut guard) = self.breaker_state.lock() {
            *guard = state;
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_flush_at = self.last_flush_at.load(Ordering::Relaxed);
        StatsSnapshot {
            buffer_size: self.buffer_size.load(Ordering::Relaxed),
            buffer_bytes: self.buffer_bytes.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            last_flush_at: if last_flush_at == 0 {
                None
            } else {
                Some(last_flush_at)
            },
            breaker_state: self
                .breaker_state
                .lock()
                .map(|s| *s)
                .unwrap_or(BreakerState::Closed),
            uptime_secs: self.uptime_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot returned by `stats()` — the health surface from spec §6.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub buffer_size: usize,
    pub buffer_bytes: usize,
    pub dropped_events: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub last_flush_at: Option<i64>,
    pub breaker_state: BreakerState,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_and_flushes_accumulate() {
        let m = Metrics::new();
        m.record_drop();
        m.record_drop();
        m.record_flush_attempt();
        m.record_flush_failure();

        let snap = m.snapshot();
        assert_eq!(snap.dropped_events, 2);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.flush_failures, 1);
        assert!(snap.last_flush_at.is_some());
    }
}
