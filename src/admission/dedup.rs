//! Idempotency gate: "have I seen this key within the TTL window?"
//!
//! One atomic check-and-mark per call. On cache outage the gate fails open:
//! treating everything as unseen keeps traffic flowing at the cost of
//! possible duplicates, and the `cache_errors` counter surfaces the tradeoff
//! to the operator.

use crate::cache::{CacheStore, SetOptions, SetOutcome};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct DedupGate {
    cache: Arc<dyn CacheStore>,
}

impl DedupGate {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Returns true when `key` was already marked within its TTL window.
    ///
    /// The first call marks the key and returns false; repeats return true
    /// until the window lapses, after which the key counts as fresh again.
    pub async fn seen(&self, key: &str, ttl: Duration) -> bool {
        let cache_key = format!("dedup:{key}");
        match self.cache.set(&cache_key, "1", SetOptions::if_absent(ttl)).await {
            Ok(SetOutcome::Applied) => false,
            Ok(SetOutcome::Rejected) => true,
            Err(_) => {
                tracing::warn!("dedup check for {key} unavailable; treating as unseen");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_util::FailingCache;
    use crate::cache::MemoryStore;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn first_sighting_only_once_per_window() {
        let gate = DedupGate::new(Arc::new(MemoryStore::new("t")));
        let ttl = Duration::from_secs(60);

        assert!(!gate.seen("update:1", ttl).await);
        assert!(gate.seen("update:1", ttl).await);
        assert!(gate.seen("update:1", ttl).await);
        assert!(!gate.seen("update:2", ttl).await);
    }

    #[tokio::test]
    async fn id_is_fresh_again_after_window_lapses() {
        let gate = DedupGate::new(Arc::new(MemoryStore::new("t")));
        let ttl = Duration::from_millis(30);

        assert!(!gate.seen("update:1", ttl).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!gate.seen("update:1", ttl).await);
    }

    #[tokio::test]
    async fn fails_open_when_cache_is_down() {
        let cache = Arc::new(FailingCache::default());
        let gate = DedupGate::new(cache.clone());

        assert!(!gate.seen("update:1", Duration::from_secs(60)).await);
        assert!(!gate.seen("update:1", Duration::from_secs(60)).await);
        assert!(cache.calls.load(Ordering::Relaxed) >= 2);
    }
}
