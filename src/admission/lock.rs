//! TTL-bounded distributed mutual exclusion per conversation.
//!
//! Acquisition is one conditional set of a fresh random token; the token is
//! the sole proof of ownership and release is an owner-checked delete, so a
//! holder whose TTL already expired can never delete a successor's lock.
//! There is no fairness queueing: first acquirer wins, contenders skip.

use crate::cache::{CacheStore, SetOptions, SetOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Proof of lock ownership. Only the holder of the matching token can
/// release the key early; otherwise the TTL reclaims it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
}

#[derive(Clone)]
pub struct ChatLock {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ChatLock {
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// `None` means another holder is active, or the cache is unavailable.
    /// When exclusion cannot be verified, acquisition fails closed.
    pub async fn acquire(&self, key: &str) -> Option<LockHandle> {
        let cache_key = format!("lock:{key}");
        let token = Uuid::new_v4().to_string();
        match self
            .cache
            .set(&cache_key, &token, SetOptions::if_absent(self.ttl))
            .await
        {
            Ok(SetOutcome::Applied) => Some(LockHandle {
                key: cache_key,
                token,
            }),
            Ok(SetOutcome::Rejected) => None,
            Err(_) => None,
        }
    }

    pub async fn release(&self, handle: LockHandle) {
        match self
            .cache
            .compare_and_delete(&handle.key, &handle.token)
            .await
        {
            Ok(true) => {}
            // Our TTL lapsed and someone else holds the key now; their lock
            // stays untouched.
            Ok(false) => tracing::debug!("{} already reclaimed", handle.key),
            // Unreachable cache: the TTL bounds how long the key lingers.
            Err(_) => {}
        }
    }

    /// Run `fut` under the lock, releasing on every exit path. Returns
    /// `None` without running anything when the lock is contended, so
    /// callers can tell "ran" from "skipped". If the future is cancelled or
    /// panics mid-flight, a drop guard spawns the release; the TTL remains
    /// the backstop when no runtime is left to run it.
    pub async fn with_lock<T, F>(&self, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let handle = self.acquire(key).await?;
        let mut guard = ReleaseGuard {
            cache: Arc::clone(&self.cache),
            handle: Some(handle),
        };
        let out = fut.await;
        if let Some(handle) = guard.handle.take() {
            self.release(handle).await;
        }
        Some(out)
    }
}

/// Releases a still-held lock when dropped without a clean completion.
struct ReleaseGuard {
    cache: Arc<dyn CacheStore>,
    handle: Option<LockHandle>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // Drop is synchronous; the owner-checked delete has to run on a
        // spawned task. Without a live runtime the TTL reclaims the key.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        runtime.spawn(async move {
            let _ = cache.compare_and_delete(&handle.key, &handle.token).await;
        });
    }
}
