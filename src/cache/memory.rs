//! Process-local cache backend.
//!
//! Same TTL and `only_if_absent` semantics as the Redis backend, implemented
//! with manual expiry checks under one mutex. Valid for a single-instance
//! deployment only; there is no cross-instance coordination in this mode.

use super::{CacheResult, CacheStore, SetOptions, SetOutcome, WindowCount};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory [`CacheStore`]; never reports unavailability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespace: String,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let key = self.key(key);
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> CacheResult<SetOutcome> {
        let key = self.key(key);
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if opts.only_if_absent {
            if let Some(existing) = entries.get(&key) {
                if existing.is_live(now) {
                    return Ok(SetOutcome::Rejected);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at: opts.ttl.map(|ttl| now + ttl),
            },
        );
        Ok(SetOutcome::Applied)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let key = self.key(key);
        self.entries.lock().remove(&key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let key = self.key(key);
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entries.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> CacheResult<WindowCount> {
        let key = self.key(key);
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let (mut count, expires_at) = match entries.get(&key) {
            Some(entry) if entry.is_live(now) => (
                entry.value.parse::<u64>().unwrap_or(0),
                entry.expires_at.unwrap_or(now + window),
            ),
            // Crossing the window boundary resets the scope.
            _ => (0, now + window),
        };
        count += 1;

        entries.insert(
            key,
            Entry {
                value: count.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(WindowCount {
            count,
            ttl: expires_at.saturating_duration_since(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips_within_ttl() {
        let store = MemoryStore::new("t");
        store
            .set("k", "v", SetOptions::with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn expired_entries_are_logically_absent() {
        let store = MemoryStore::new("t");
        store
            .set("k", "v", SetOptions::with_ttl(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn conditional_set_rejects_live_key_but_takes_expired_key() {
        let store = MemoryStore::new("t");
        let opts = SetOptions::if_absent(Duration::from_millis(30));

        assert_eq!(store.set("k", "a", opts).await.unwrap(), SetOutcome::Applied);
        assert_eq!(store.set("k", "b", opts).await.unwrap(), SetOutcome::Rejected);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.set("k", "b", opts).await.unwrap(), SetOutcome::Applied);
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let store = MemoryStore::new("t");
        store
            .set("k", "token-1", SetOptions::with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("k", "token-2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("token-1"));

        assert!(store.compare_and_delete("k", "token-1").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_counts_within_window_and_resets_after() {
        let store = MemoryStore::new("t");
        let window = Duration::from_millis(40);

        let first = store.increment("rate:x", window).await.unwrap();
        let second = store.increment("rate:x", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.ttl <= window);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let after = store.increment("rate:x", window).await.unwrap();
        assert_eq!(after.count, 1);
    }

    #[tokio::test]
    async fn namespaces_isolate_stores_sharing_key_names() {
        let a = MemoryStore::new("a");
        let b = MemoryStore::new("b");
        a.set("k", "va", SetOptions::default()).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), None);
    }
}
