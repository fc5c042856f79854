use crate::routing::route::RateLimitSpec;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-route sliding-window request counter, one per `route_id`. Approximates
/// a true sliding window by blending the previous window's count into the
/// current one instead of resetting hard at the window boundary, which would
/// let a burst of `2 * requests` through right at the edge.
pub struct RateLimitCounter {
    inner: Mutex<CounterState>,
}

struct CounterState {
    window_start: Instant,
    current_count: u64,
    prev_count: u64,
}

impl RateLimitCounter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CounterState { window_start: Instant::now(), current_count: 0, prev_count: 0 }),
        }
    }

    /// Returns `true` if this request is allowed under `spec`.
    pub fn check(&self, spec: &RateLimitSpec) -> bool {
        let window = Duration::from_secs(spec.window_secs.max(1));
        let mut state = self.inner.lock().unwrap();

        while state.window_start.elapsed() >= window {
            state.prev_count = state.current_count;
            state.current_count = 0;
            state.window_start += window;
        }

        let elapsed_ratio = state.window_start.elapsed().as_secs_f64() / window.as_secs_f64();
        let weight = (1.0 - elapsed_ratio).clamp(0.0, 1.0);
        let estimated = (state.prev_count as f64 * weight) as u64 + state.current_count;

        if estimated < spec.requests {
            state.current_count += 1;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimitCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(requests: u64, window_secs: u64) -> RateLimitSpec {
        RateLimitSpec { requests, window_secs }
    }

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let counter = RateLimitCounter::new();
        let s = spec(3, 60);
        assert!(counter.check(&s));
        assert!(counter.check(&s));
        assert!(counter.check(&s));
        assert!(!counter.check(&s));
    }

    #[test]
    fn resets_after_the_window_elapses() {
        let counter = RateLimitCounter::new();
        let s = spec(1, 1);
        assert!(counter.check(&s));
        assert!(!counter.check(&s));

        counter.inner.lock().unwrap().window_start -= Duration::from_secs(2);
        assert!(counter.check(&s));
    }
}
