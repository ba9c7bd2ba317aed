//! TTL+LRU cache of seen handshake nonces, guarding against `InitiatorInit`
//! replay. Entries expire on a timestamp field pruned by a periodic
//! `sweep()` call, guarded behind a `parking_lot::Mutex` shared across
//! connections.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

pub const NONCE_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    #[error("nonce tracker is at capacity")]
    AtCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceOutcome {
    Accepted,
    Replay,
}

#[derive(Debug, Clone, Copy)]
pub struct NonceTrackerConfig {
    pub ttl_ms: i64,
    pub capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for NonceTrackerConfig {
    fn default() -> Self {
        NonceTrackerConfig {
            ttl_ms: 5 * 60 * 1000,
            capacity: 100_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct Inner {
    seen: HashMap<[u8; NONCE_LEN], i64>,
    order: VecDeque<[u8; NONCE_LEN]>,
}

pub struct NonceTracker {
    config: NonceTrackerConfig,
    inner: Mutex<Inner>,
}

impl NonceTracker {
    pub fn new(config: NonceTrackerConfig) -> Self {
        NonceTracker {
            config,
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &NonceTrackerConfig {
        &self.config
    }

    /// If `nonce` was seen within the TTL, reports a replay. Otherwise
    /// records it with `now_ms` and reports accepted, evicting the oldest
    /// entry first if the tracker is at capacity.
    pub fn check(&self, nonce: [u8; NONCE_LEN], now_ms: i64) -> NonceOutcome {
        let mut inner = self.inner.lock();
        if let Some(&first_seen) = inner.seen.get(&nonce) {
            if now_ms - first_seen < self.config.ttl_ms {
                return NonceOutcome::Replay;
            }
            // Reusing a TTL-expired nonce: drop its stale position in
            // `order` before re-adding it at the back, or it would linger
            // as a duplicate entry and "spend" a future eviction cycle.
            inner.order.retain(|n| *n != nonce);
        }
        if inner.seen.len() >= self.config.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        inner.seen.insert(nonce, now_ms);
        inner.order.push_back(nonce);
        NonceOutcome::Accepted
    }

    /// Remove every entry older than the TTL. Intended to be driven by a
    /// periodic `tokio::time::interval` task owned by the server.
    pub fn sweep(&self, now_ms: i64) {
        let mut inner = self.inner.lock();
        let ttl = self.config.ttl_ms;
        let expired: Vec<_> = inner
            .seen
            .iter()
            .filter(|(_, &first_seen)| now_ms - first_seen >= ttl)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in expired {
            inner.seen.remove(&nonce);
            inner.order.retain(|n| *n != nonce);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop tracking and drop all state. The caller is responsible for
    /// cancelling any sweep task that references this tracker.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.seen.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_accepted_second_use_replay() {
        let tracker = NonceTracker::new(NonceTrackerConfig::default());
        let nonce = [1u8; NONCE_LEN];
        assert_eq!(tracker.check(nonce, 0), NonceOutcome::Accepted);
        assert_eq!(tracker.check(nonce, 100), NonceOutcome::Replay);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn expired_entry_is_reusable() {
        let tracker = NonceTracker::new(NonceTrackerConfig {
            ttl_ms: 1000,
            ..Default::default()
        });
        let nonce = [2u8; NONCE_LEN];
        assert_eq!(tracker.check(nonce, 0), NonceOutcome::Accepted);
        assert_eq!(tracker.check(nonce, 2000), NonceOutcome::Accepted);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let tracker = NonceTracker::new(NonceTrackerConfig {
            capacity: 2,
            ..Default::default()
        });
        tracker.check([1u8; NONCE_LEN], 0);
        tracker.check([2u8; NONCE_LEN], 0);
        tracker.check([3u8; NONCE_LEN], 0);
        assert_eq!(tracker.len(), 2);
        // the first nonce should have been evicted, so it is usable again
        assert_eq!(tracker.check([1u8; NONCE_LEN], 0), NonceOutcome::Accepted);
    }

    #[test]
    fn reusing_expired_nonce_does_not_duplicate_order_entry() {
        let tracker = NonceTracker::new(NonceTrackerConfig {
            ttl_ms: 1000,
            capacity: 2,
            ..Default::default()
        });
        let reused = [6u8; NONCE_LEN];
        tracker.check(reused, 0);
        tracker.check(reused, 2000); // TTL-expired reuse, re-adds `reused` once
        tracker.check([7u8; NONCE_LEN], 2000);
        // At capacity 2 with exactly two live entries, the next insert must
        // evict one of them rather than spend its eviction on a stale
        // duplicate `order` entry for `reused`.
        tracker.check([8u8; NONCE_LEN], 2000);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn sweep_removes_stale_entries() {
        let tracker = NonceTracker::new(NonceTrackerConfig {
            ttl_ms: 1000,
            ..Default::default()
        });
        tracker.check([4u8; NONCE_LEN], 0);
        tracker.sweep(5000);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn destroy_clears_state() {
        let tracker = NonceTracker::new(NonceTrackerConfig::default());
        tracker.check([5u8; NONCE_LEN], 0);
        tracker.destroy();
        assert_eq!(tracker.len(), 0);
    }
}
