// In-process rate limiting for order traffic.
// Two independent sliding 1-second windows: one for submits, one for cancels.
// Risk intents bypass the limiter at the call site; denied intents are dropped,
// never queued (a queued intent would ride on an already-stale snapshot).

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::debug;

const WINDOW_MS: i64 = 1_000;

/// One sliding window over millisecond timestamps. A slot is consumed on
/// successful acquire only.
#[derive(Debug)]
struct SlidingWindow {
    events: Mutex<VecDeque<i64>>,
    max_events: u32,
}

impl SlidingWindow {
    fn new(max_events: u32) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events,
        }
    }

    fn try_acquire(&self, now_ms: i64) -> bool {
        let mut events = self.events.lock().expect("rate limiter mutex poisoned");
        let cutoff = now_ms - WINDOW_MS;
        while events.front().map_or(false, |&t| t <= cutoff) {
            events.pop_front();
        }
        if events.len() >= self.max_events as usize {
            return false;
        }
        events.push_back(now_ms);
        true
    }

    fn in_window(&self, now_ms: i64) -> usize {
        let events = self.events.lock().expect("rate limiter mutex poisoned");
        let cutoff = now_ms - WINDOW_MS;
        events.iter().filter(|&&t| t > cutoff).count()
    }
}

/// Submit/cancel limiter shared by all sides. Thread-safe; acquire is cheap
/// enough for the 50 ms evaluation loop.
#[derive(Debug)]
pub struct RateLimiter {
    submits: SlidingWindow,
    cancels: SlidingWindow,
}

impl RateLimiter {
    pub fn new(max_orders_per_sec: u32, max_cancels_per_sec: u32) -> Self {
        Self {
            submits: SlidingWindow::new(max_orders_per_sec),
            cancels: SlidingWindow::new(max_cancels_per_sec),
        }
    }

    /// Admit one submit. Consumes a slot on success.
    pub fn try_acquire_submit(&self, now_ms: i64) -> bool {
        let ok = self.submits.try_acquire(now_ms);
        if !ok {
            debug!(
                in_window = self.submits.in_window(now_ms),
                "RATE_LIMIT: submit denied"
            );
        }
        ok
    }

    /// Admit one cancel. Consumes a slot on success.
    pub fn try_acquire_cancel(&self, now_ms: i64) -> bool {
        let ok = self.cancels.try_acquire(now_ms);
        if !ok {
            debug!(
                in_window = self.cancels.in_window(now_ms),
                "RATE_LIMIT: cancel denied"
            );
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submits_capped_within_window() {
        let limiter = RateLimiter::new(3, 8);
        let t0 = 1_000_000;
        assert!(limiter.try_acquire_submit(t0));
        assert!(limiter.try_acquire_submit(t0 + 10));
        assert!(limiter.try_acquire_submit(t0 + 20));
        assert!(!limiter.try_acquire_submit(t0 + 30));
        // window slides: the first slot frees after 1s
        assert!(limiter.try_acquire_submit(t0 + 1_001));
    }

    #[test]
    fn denied_acquire_does_not_consume() {
        let limiter = RateLimiter::new(1, 1);
        let t0 = 5_000;
        assert!(limiter.try_acquire_submit(t0));
        assert!(!limiter.try_acquire_submit(t0 + 1));
        assert!(!limiter.try_acquire_submit(t0 + 2));
        assert!(limiter.try_acquire_submit(t0 + 1_001));
    }

    #[test]
    fn submit_and_cancel_budgets_are_independent() {
        let limiter = RateLimiter::new(1, 2);
        let t0 = 42_000;
        assert!(limiter.try_acquire_submit(t0));
        assert!(!limiter.try_acquire_submit(t0));
        assert!(limiter.try_acquire_cancel(t0));
        assert!(limiter.try_acquire_cancel(t0));
        assert!(!limiter.try_acquire_cancel(t0));
    }

    #[test]
    fn rolling_window_never_exceeds_budget() {
        let limiter = RateLimiter::new(5, 8);
        let mut granted_in_any_second = 0usize;
        let mut grants: Vec<i64> = Vec::new();
        for i in 0..40 {
            let t = 10_000 + i * 100;
            if limiter.try_acquire_submit(t) {
                grants.push(t);
                let in_window = grants.iter().filter(|&&g| g > t - 1_000).count();
                granted_in_any_second = granted_in_any_second.max(in_window);
            }
        }
        assert!(granted_in_any_second <= 5);
        assert!(!grants.is_empty());
    }
}
