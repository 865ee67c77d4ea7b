//! Circuit breaker guarding the storage path (spec §4.9, C9).
//!
//! Grounded on the teacher pack's `mcp-agent-mail-db::retry::CircuitBreaker`
//! (atomics-based, lock-free state reads, monotonic `Instant` epoch) but
//! adapted to the three-state machine spec.md actually calls for: `Closed`,
//! `Open`, `HalfOpen` is its own explicit state here (in the reference it
//! is derived from failure count once the open window lapses) because
//! spec §4.9 requires a true half-open probe — exactly one call is let
//! through, not every call once the cool-off elapses.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Circuit breaker states (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of [`CircuitBreaker::call`]: either the closure ran, or the
/// breaker was open and the call was skipped entirely.
pub enum CallOutcome<T> {
    Ran(T),
    Tripped,
}

/// Thread-safe circuit breaker for the storage adapter path.
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Monotonic microseconds (from `epoch`) at which `Open` may transition
    /// to `HalfOpen`. Zero while closed.
    open_until_us: AtomicU64,
    failure_threshold: u32,
    cool_off: Duration,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cool_off: Duration) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            open_until_us: AtomicU64::new(0),
            failure_threshold: failure_threshold.max(1),
            cool_off,
            epoch: Instant::now(),
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
    }

    /// Current state, promoting `Open` to `HalfOpen` once the cool-off has
    /// elapsed. Lock-free.
    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => {
                let open_until = self.open_until_us.load(Ordering::Acquire);
                if self.now_us() >= open_until {
                    // Cool-off elapsed: advance to half-open so exactly one
                    // probe call is allowed through by `call`.
                    let _ = self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Run `f` through the breaker. While `Open`, `f` is never invoked.
    /// While `HalfOpen`, exactly one caller wins the probe; concurrent
    /// callers observing `HalfOpen` simultaneously all get to try (the
    /// flusher has only one in-flight cycle at a time, so this race does
    /// not occur in practice — see spec §4.10).
    pub async fn call<T, Fut, F>(&self, f: F) -> CallOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::error::StorageError>>,
    {
        if self.state() == BreakerState::Open {
            return CallOutcome::Tripped;
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                CallOutcome::Ran(value)
            }
            Err(err) => {
                self.record_failure();
                tracing::warn!(error = %err, "storage adapter call failed; breaker recorded failure");
                CallOutcome::Tripped
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.open_until_us.store(0, Ordering::Release);
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            let open_until = self.now_us() + self.cool_off.as_micros() as u64;
            self.open_until_us.store(open_until, Ordering::Release);
            self.state.store(STATE_OPEN, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    async fn ok_call() -> Result<(), StorageError> {
        Ok(())
    }

    async fn failing_call() -> Result<(), StorageError> {
        Err(StorageError::Other("boom".into()))
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        // Given: a breaker with threshold 5
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));

        // When: 5 consecutive calls fail
        for _ in 0..5 {
            let outcome = breaker.call(failing_call).await;
            assert!(matches!(outcome, CallOutcome::Tripped));
        }

        // Then: the breaker is open and a 6th call never invokes the adapter
        assert_eq!(breaker.state(), BreakerState::Open);
        let mut invoked = false;
        let outcome = breaker
            .call(|| {
                invoked = true;
                ok_call()
            })
            .await;
        assert!(matches!(outcome, CallOutcome::Tripped));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn half_open_probe_succeeds_closes_breaker() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));
        for _ in 0..2 {
            breaker.call(failing_call).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let outcome = breaker.call(ok_call).await;
        assert!(matches!(outcome, CallOutcome::Ran(())));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_and_resets_timer() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.call(failing_call).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.call(failing_call).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
