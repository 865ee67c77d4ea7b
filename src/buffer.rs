//! Bounded concurrent event queue with backpressure signalling (spec
//! §4.4, C4).
//!
//! The hot path only ever takes a short `Mutex` critical section to
//! push one event; the flusher takes the same lock to swap the whole
//! queue out. Crossing the soft cap fires `on_flush_needed` exactly
//! once per crossing, outside the critical section, the same
//! edge-triggered-notify shape the teacher uses for its mmap ring
//! buffer's wakeups.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Dropped,
}

struct Inner {
    events: Vec<Event>,
    bytes: usize,
}

/// Thread-safe bounded queue tracking cumulative bytes (spec §4.4).
pub struct Buffer {
    inner: Mutex<Inner>,
    len: AtomicUsize,
    bytes_atomic: AtomicUsize,
    dropped_count: AtomicU64,
    max_bytes: usize,
    hard_cap: usize,
    /// Fired at most once per soft-cap crossing; the flusher awaits this.
    flush_needed: Arc<Notify>,
    /// Cleared once a drain happens, so the next crossing can re-fire.
    armed: std::sync::atomic::AtomicBool,
}

impl Buffer {
    pub fn new(max_bytes: usize, hard_multiplier: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: Vec::new(),
                bytes: 0,
            }),
            len: AtomicUsize::new(0),
            bytes_atomic: AtomicUsize::new(0),
            dropped_count: AtomicU64::new(0),
            max_bytes,
            hard_cap: max_bytes.saturating_mul(hard_multiplier.max(1)),
            flush_needed: Arc::new(Notify::new()),
            armed: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn flush_needed_handle(&self) -> Arc<Notify> {
        self.flush_needed.clone()
    }

    /// Non-blocking push. Admission rule: if appending would exceed
    /// `max_bytes * hard_multiplier`, the event is dropped.
    pub fn push(&self, event: Event) -> PushOutcome {
        let event_bytes = event.estimated_bytes();
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");

        if guard.bytes + event_bytes > self.hard_cap {
            drop(guard);
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Dropped;
        }

        guard.bytes += event_bytes;
        guard.events.push(event);
        let new_bytes = guard.bytes;
        let new_len = guard.events.len();
        drop(guard);

        self.bytes_atomic.store(new_bytes, Ordering::Relaxed);
        self.len.store(new_len, Ordering::Relaxed);

        if new_bytes >= self.max_bytes
            && self
                .armed
                .compare_exchange(
                    true,
                    false,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.flush_needed.notify_one();
        }

        PushOutcome::Accepted
    }

    /// Atomically swaps out all events and resets byte accounting.
    pub fn drain(&self) -> Vec<Event> {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        let events = std::mem::take(&mut guard.events);
        guard.bytes = 0;
        drop(guard);

        self.bytes_atomic.store(0, Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
        events
    }

    pub fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> usize {
        self.bytes_atomic.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Discards all buffered events without returning them, counting
    /// them as dropped. Used at the end of the shutdown grace period
    /// (spec §5).
    pub fn reset(&self) -> usize {
        let drained = self.drain();
        let n = drained.len();
        self.dropped_count.fetch_add(n as u64, Ordering::Relaxed);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BusinessEvent, Event};
    use chrono::Utc;

    fn small_event() -> Event {
        Event::BusinessEvent(BusinessEvent {
            name: "x".into(),
            recorded_at: Utc::now(),
            payload: serde_json::json!({}),
        })
    }

    #[test]
    fn accepts_events_within_hard_cap() {
        let buf = Buffer::new(1_000_000, 3);
        for _ in 0..10 {
            assert_eq!(buf.push(small_event()), PushOutcome::Accepted);
        }
        assert_eq!(buf.size(), 10);
    }

    #[test]
    fn drops_events_beyond_hard_cap() {
        let buf = Buffer::new(100, 3); // hard cap 300 bytes
        let mut accepted = 0;
        let mut dropped = 0;
        for _ in 0..50 {
            match buf.push(small_event()) {
                PushOutcome::Accepted => accepted += 1,
                PushOutcome::Dropped => dropped += 1,
            }
        }
        assert!(dropped > 0);
        assert!(accepted > 0);
        assert_eq!(buf.dropped_count(), dropped as u64);
    }

    #[test]
    fn drain_resets_bytes_and_len_and_returns_all_events() {
        let buf = Buffer::new(1_000_000, 3);
        for _ in 0..5 {
            buf.push(small_event());
        }
        let drained = buf.drain();
        assert_eq!(drained.len(), 5);
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.bytes(), 0);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn flush_needed_fires_once_per_soft_cap_crossing() {
        let buf = Arc::new(Buffer::new(50, 10));
        let notify = buf.flush_needed_handle();

        let waiter = tokio::spawn({
            let notify = notify.clone();
            async move {
                notify.notified().await;
            }
        });

        // crossing the soft cap of 50 bytes with one ~148-byte event
        buf.push(small_event());
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("flush_needed should fire")
            .unwrap();
    }
}
