//! Bounded-capacity storage for ciphertexts queued for offline recipients,
//! keyed by recipient identity hex, capped per recipient and expired on a
//! TTL independent of any one connection's lifetime.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub recipient_id: String,
    pub bytes: Vec<u8>,
    pub sequence: u32,
    pub stored_at_ms: i64,
    pub expires_at_ms: i64,
}

pub struct MessageStore {
    expiry_ms: i64,
    per_recipient_cap: usize,
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
}

impl MessageStore {
    pub fn new(expiry_ms: i64, per_recipient_cap: usize) -> Self {
        MessageStore {
            expiry_ms,
            per_recipient_cap,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `bytes` for `recipient_id`, dropping the oldest entry first if
    /// the recipient's queue is already at capacity.
    pub fn store(&self, recipient_id: &str, bytes: Vec<u8>, sequence: u32, now_ms: i64) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(recipient_id.to_string()).or_default();
        if queue.len() >= self.per_recipient_cap {
            queue.pop_front();
        }
        queue.push_back(StoredMessage {
            recipient_id: recipient_id.to_string(),
            bytes,
            sequence,
            stored_at_ms: now_ms,
            expires_at_ms: now_ms + self.expiry_ms,
        });
    }

    /// Drain and return every unexpired message queued for `recipient_id`,
    /// in stored order.
    pub fn drain(&self, recipient_id: &str, now_ms: i64) -> Vec<StoredMessage> {
        let mut queues = self.queues.lock();
        match queues.remove(recipient_id) {
            Some(queue) => queue.into_iter().filter(|m| m.expires_at_ms > now_ms).collect(),
            None => Vec::new(),
        }
    }

    pub fn recipient_count(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn queue_len(&self, recipient_id: &str) -> usize {
        self.queues.lock().get(recipient_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Periodic cleanup: prune expired messages from every queue, then if
    /// the recipient count exceeds 10x the per-recipient cap, drop the
    /// oldest half of recipient buckets (by least-recently-stored message).
    pub fn cleanup(&self, now_ms: i64) {
        let mut queues = self.queues.lock();
        queues.retain(|_, queue| {
            queue.retain(|m| m.expires_at_ms > now_ms);
            !queue.is_empty()
        });

        let overflow_threshold = self.per_recipient_cap * 10;
        if queues.len() > overflow_threshold {
            let mut by_oldest: Vec<(String, i64)> = queues
                .iter()
                .map(|(id, q)| (id.clone(), q.front().map(|m| m.stored_at_ms).unwrap_or(now_ms)))
                .collect();
            by_oldest.sort_by_key(|(_, oldest)| *oldest);
            let drop_count = queues.len() / 2;
            for (id, _) in by_oldest.into_iter().take(drop_count) {
                queues.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_drain_preserves_order() {
        let store = MessageStore::new(1000, 10);
        store.store("alice", b"one".to_vec(), 0, 0);
        store.store("alice", b"two".to_vec(), 1, 1);
        let drained = store.drain("alice", 2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].bytes, b"one");
        assert_eq!(drained[1].bytes, b"two");
        assert_eq!(store.queue_len("alice"), 0);
    }

    #[test]
    fn expired_messages_are_not_drained() {
        let store = MessageStore::new(100, 10);
        store.store("alice", b"stale".to_vec(), 0, 0);
        let drained = store.drain("alice", 1000);
        assert!(drained.is_empty());
    }

    #[test]
    fn per_recipient_cap_drops_oldest() {
        let store = MessageStore::new(100_000, 2);
        store.store("alice", b"a".to_vec(), 0, 0);
        store.store("alice", b"b".to_vec(), 1, 0);
        store.store("alice", b"c".to_vec(), 2, 0);
        let drained = store.drain("alice", 0);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].bytes, b"b");
        assert_eq!(drained[1].bytes, b"c");
    }

    #[test]
    fn cleanup_removes_expired_and_empty_queues() {
        let store = MessageStore::new(100, 10);
        store.store("alice", b"x".to_vec(), 0, 0);
        store.cleanup(1000);
        assert_eq!(store.recipient_count(), 0);
    }
}
