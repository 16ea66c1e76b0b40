//! Three-state circuit breaker over a rolling consecutive-error count
//! State and counters are plain atomics manipulated with CAS loops,
//! in the spirit of the teacher's atomic `ConnState`/slab bookkeeping.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for BreakerState {
    fn from(v: u8) -> Self {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

pub struct CircuitBreaker {
    enabled: bool,
    state: AtomicU8,
    consecutive_errors: AtomicU32,
    /// Millis since `epoch` at which the breaker last opened.
    open_at_millis: AtomicU64,
    epoch: Instant,
    threshold: u32,
    reset_timeout_millis: u64,
}

impl CircuitBreaker {
    pub fn new(enabled: bool, threshold: u32, reset_timeout: std::time::Duration) -> Self {
        Self {
            enabled,
            state: AtomicU8::new(BreakerState::Closed as u8),
            consecutive_errors: AtomicU32::new(0),
            open_at_millis: AtomicU64::new(0),
            epoch: Instant::now(),
            threshold,
            reset_timeout_millis: reset_timeout.as_millis() as u64,
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from(self.state.load(Ordering::Acquire))
    }

    /// Admission check. When disabled, admission
    /// is always allowed.
    pub fn allow_request(&self) -> bool {
        if !self.enabled {
            return true;
        }
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self.now_millis().saturating_sub(self.open_at_millis.load(Ordering::Acquire));
                if elapsed >= self.reset_timeout_millis {
                    // Win-one transition to half-open; losers still observe Open
                    // this call and are simply re-rejected on their own retry.
                    let _ = self.state.compare_exchange(
                        BreakerState::Open as u8,
                        BreakerState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.consecutive_errors.store(0, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        match self.state() {
            BreakerState::Closed => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
            }
            BreakerState::HalfOpen => {
                self.state.store(BreakerState::Closed as u8, Ordering::Release);
                self.consecutive_errors.store(0, Ordering::Relaxed);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }
        match self.state() {
            BreakerState::Closed => {
                let errors = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
                if errors >= self.threshold {
                    self.open_at_millis.store(self.now_millis(), Ordering::Release);
                    self.state.store(BreakerState::Open as u8, Ordering::Release);
                    self.consecutive_errors.store(0, Ordering::Relaxed);
                }
            }
            BreakerState::HalfOpen => {
                self.open_at_millis.store(self.now_millis(), Ordering::Release);
                self.state.store(BreakerState::Open as u8, Ordering::Release);
            }
            BreakerState::Open => {}
        }
    }

    pub fn reset(&self) {
        self.state.store(BreakerState::Closed as u8, Ordering::Release);
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn trips_after_exactly_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(true, 3, Duration::from_secs(1));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn intervening_success_resets_counter() {
        let breaker = CircuitBreaker::new(true, 3, Duration::from_secs(1));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed, "counter must have reset on success");
    }

    #[test]
    fn half_open_success_closes_failure_reopens() {
        let breaker = CircuitBreaker::new(true, 1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(true, 1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let breaker = CircuitBreaker::new(false, 1, Duration::from_secs(1));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
