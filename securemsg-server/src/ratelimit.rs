//! Fixed-window rate limiting, shared across connections and keyed by a
//! plain string: a transport address for handshake attempts, a hex-encoded
//! identity key for per-client message throughput.

use std::collections::HashMap;

use parking_lot::Mutex;

struct Bucket {
    window_start_ms: i64,
    count: u32,
    last_seen_ms: i64,
}

pub struct RateLimiter {
    window_ms: i64,
    max_per_window: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(window_ms: i64, max_per_window: u32) -> Self {
        RateLimiter {
            window_ms,
            max_per_window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records one event for `key` at `now_ms`. Returns `true` if the event
    /// is within the rate limit, `false` if it should be rejected.
    pub fn check(&self, key: &str, now_ms: i64) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            window_start_ms: now_ms,
            count: 0,
            last_seen_ms: now_ms,
        });

        if now_ms - bucket.window_start_ms >= self.window_ms {
            bucket.window_start_ms = now_ms;
            bucket.count = 0;
        }
        bucket.last_seen_ms = now_ms;

        if bucket.count >= self.max_per_window {
            return false;
        }
        bucket.count += 1;
        true
    }

    /// Drop records idle for more than `2 * window_ms`.
    pub fn gc(&self, now_ms: i64) {
        let idle_after = self.window_ms * 2;
        self.buckets
            .lock()
            .retain(|_, bucket| now_ms - bucket.last_seen_ms < idle_after);
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(60_000, 3);
        assert!(limiter.check("a", 0));
        assert!(limiter.check("a", 0));
        assert!(limiter.check("a", 0));
        assert!(!limiter.check("a", 0));
    }

    #[test]
    fn window_resets_after_elapsed_time() {
        let limiter = RateLimiter::new(60_000, 1);
        assert!(limiter.check("a", 0));
        assert!(!limiter.check("a", 30_000));
        assert!(limiter.check("a", 60_001));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::new(60_000, 1);
        assert!(limiter.check("a", 0));
        assert!(limiter.check("b", 0));
    }

    #[test]
    fn gc_drops_idle_buckets() {
        let limiter = RateLimiter::new(1000, 5);
        limiter.check("a", 0);
        limiter.gc(10_000);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
