//! Short-lived message deduplication.
//!
//! Transport retries can deliver the same update twice within seconds; a
//! bounded TTL cache keyed by `(chat id, origin message id)` drops the
//! duplicates.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type Key = (i64, i32);

pub struct DedupeCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    order: VecDeque<(Key, Instant)>,
    seen: HashSet<Key>,
}

impl DedupeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns true if this key was already seen within the TTL; otherwise
    /// records it.
    pub fn seen(&self, chat_id: i64, message_id: i32) -> bool {
        let key = (chat_id, message_id);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        while let Some((old_key, at)) = inner.order.front().copied() {
            if now.duration_since(at) > self.ttl || inner.order.len() > self.capacity {
                inner.order.pop_front();
                inner.seen.remove(&old_key);
            } else {
                break;
            }
        }

        if inner.seen.contains(&key) {
            return true;
        }
        inner.seen.insert(key);
        inner.order.push_back((key, now));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_ttl() {
        let cache = DedupeCache::new(Duration::from_secs(8), 64);
        assert!(!cache.seen(1, 100));
        assert!(cache.seen(1, 100));
        // Different message or chat is fresh.
        assert!(!cache.seen(1, 101));
        assert!(!cache.seen(2, 100));
    }

    #[test]
    fn test_expiry() {
        let cache = DedupeCache::new(Duration::from_millis(10), 64);
        assert!(!cache.seen(1, 1));
        std::thread::sleep(Duration::from_millis(25));
        assert!(!cache.seen(1, 1));
    }

    #[test]
    fn test_capacity_bound() {
        let cache = DedupeCache::new(Duration::from_secs(600), 4);
        for i in 0..100 {
            cache.seen(1, i);
        }
        let inner = cache.inner.lock().unwrap();
        assert!(inner.order.len() <= 5);
        assert_eq!(inner.order.len(), inner.seen.len());
    }
}
