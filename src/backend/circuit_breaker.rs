use crate::config::CircuitBreakerConfig;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the circuit breaker before a request.
#[derive(Debug, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Breaker is closed — proceed normally.
    Allowed,
    /// Breaker is half-open — this is a probe request.
    Probe,
    /// Breaker is open — reject immediately.
    Rejected,
}

/// Three-state failure-isolation machine embedded directly in a Backend
/// (one breaker per Backend — a Backend already corresponds to exactly one
/// `backend_url`, so no per-node indirection is needed).
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    /// Start of the current failure-counting window; reset whenever it's
    /// older than `params.window_secs`, which forgets failures outside that
    /// window instead of counting consecutive failures indefinitely.
    window_started_at: Mutex<Instant>,
    params: Mutex<CircuitBreakerConfig>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            window_started_at: Mutex::new(Instant::now()),
            params: Mutex::new(config),
        }
    }

    /// Force the breaker back to `closed` with all counters cleared, as if
    /// freshly constructed. Used by the control-plane `CIRCUIT_BREAKER_RESET`
    /// command.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::Relaxed);
        *self.opened_at.lock().unwrap() = None;
        *self.window_started_at.lock().unwrap() = Instant::now();
    }

    pub fn update_params(&self, config: CircuitBreakerConfig) {
        *self.params.lock().unwrap() = config;
    }

    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => "closed",
            STATE_OPEN => "open",
            STATE_HALF_OPEN => "half_open",
            _ => "closed",
        }
    }

    /// Pre-dispatch gate. Transitions Open → HalfOpen when the timeout has
    /// elapsed, matching the invariant that the pre-dispatch check and the
    /// response-modifier state update observe the same state machine.
    pub fn check(&self) -> BreakerCheck {
        let open_duration = Duration::from_secs(self.params.lock().unwrap().open_duration_secs);
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let elapsed_enough = {
                    let opened_at = self.opened_at.lock().unwrap();
                    matches!(*opened_at, Some(at) if at.elapsed() >= open_duration)
                };
                if elapsed_enough
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.half_open_successes.store(0, Ordering::Relaxed);
                    return BreakerCheck::Probe;
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => BreakerCheck::Probe,
            _ => BreakerCheck::Allowed,
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                let threshold = self.params.lock().unwrap().success_threshold;
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }

    /// Returns `true` if this call tripped the breaker open.
    pub fn record_failure(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let (threshold, window) = {
                    let params = self.params.lock().unwrap();
                    (params.failure_threshold, Duration::from_secs(params.window_secs))
                };
                {
                    let mut window_started_at = self.window_started_at.lock().unwrap();
                    if window_started_at.elapsed() >= window {
                        *window_started_at = Instant::now();
                        self.consecutive_failures.store(0, Ordering::Relaxed);
                    }
                }
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    return true;
                }
                false
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_duration_secs: 1,
            window_secs: 3600,
        }
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(cfg());
        assert_eq!(cb.check(), BreakerCheck::Allowed);
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let cb = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            assert_eq!(cb.check(), BreakerCheck::Allowed);
            cb.record_failure();
        }
        assert_eq!(cb.check(), BreakerCheck::Rejected);
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = CircuitBreaker::new(cfg());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.check(), BreakerCheck::Allowed);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success_threshold() {
        let fast = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_duration_secs: 0,
            window_secs: 3600,
        };
        let cb = CircuitBreaker::new(fast);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.check(), BreakerCheck::Probe);
        cb.record_success();
        assert_eq!(cb.check(), BreakerCheck::Probe);
        cb.record_success();
        assert_eq!(cb.check(), BreakerCheck::Allowed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let fast = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 0,
            window_secs: 3600,
        };
        let cb = CircuitBreaker::new(fast);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        let _ = cb.check();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.check(), BreakerCheck::Probe);
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let narrow = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            open_duration_secs: 1,
            window_secs: 0,
        };
        let cb = CircuitBreaker::new(narrow);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.record_failure();
        assert_eq!(cb.check(), BreakerCheck::Allowed);
    }

    #[test]
    fn reset_clears_open_state_back_to_closed() {
        let cb = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.check(), BreakerCheck::Rejected);
        cb.reset();
        assert_eq!(cb.check(), BreakerCheck::Allowed);
    }
}
