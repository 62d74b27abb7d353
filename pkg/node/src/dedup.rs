//! At-most-once delivery's dedup set. Backed by `dashmap` so reads
//! from the hot multicast receive path don't contend with the occasional
//! insert-triggered sweep under one global lock.
//!
//! Eviction is time-boxed TTL, checked opportunistically on insert rather
//! than run by a dedicated sweep task.

use dashmap::DashMap;
use tokio::time::{Duration, Instant};

pub struct DedupSet {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl DedupSet {
    pub fn new(ttl: Duration) -> Self {
        DedupSet { seen: DashMap::new(), ttl }
    }

    /// Returns `true` if `message_id` was already present (a duplicate).
    /// Otherwise records it as seen and opportunistically evicts expired
    /// entries.
    pub fn check_and_insert(&self, message_id: &str) -> bool {
        let now = Instant::now();

        if let Some(seen_at) = self.seen.get(message_id) {
            if now.duration_since(*seen_at) < self.ttl {
                return true;
            }
        }

        self.seen.insert(message_id.to_string(), now);
        self.evict_expired(now);
        false
    }

    fn evict_expired(&self, now: Instant) {
        self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_not_a_duplicate() {
        let set = DedupSet::new(Duration::from_secs(60));
        assert!(!set.check_and_insert("a"));
    }

    #[test]
    fn second_sighting_is_a_duplicate() {
        let set = DedupSet::new(Duration::from_secs(60));
        assert!(!set.check_and_insert("a"));
        assert!(set.check_and_insert("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let set = DedupSet::new(Duration::from_millis(50));
        assert!(!set.check_and_insert("a"));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!set.check_and_insert("a"), "expired entry should be treated as fresh");
    }
}
