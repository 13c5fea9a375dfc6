//! Shared cache client: one contract over an external Redis store and a
//! process-local fallback.
//!
//! Transport failures never escape as backend error types. Every backend
//! catches them, logs, bumps the `cache_errors` counter, and returns
//! [`CacheUnavailable`] so each caller can decide fail-open vs fail-closed.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::config::CacheConfig;
use crate::metrics::MetricsStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Neutral "cache unavailable" signal. Carries no transport detail on purpose;
/// details go to the log and the error counter.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("shared cache unavailable")]
pub struct CacheUnavailable;

pub type CacheResult<T> = Result<T, CacheUnavailable>;

/// Options for [`CacheStore::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    /// Conditional set: succeed only when the key holds no live value.
    pub only_if_absent: bool,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            only_if_absent: false,
        }
    }

    pub fn if_absent(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            only_if_absent: true,
        }
    }
}

/// Result of a conditional or plain set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Applied,
    /// `only_if_absent` was requested and the key already held a live value.
    Rejected,
}

/// Fixed-window counter state returned by [`CacheStore::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    /// Remaining window; used as the retry-after hint.
    pub ttl: Duration,
}

/// Key/value store with conditional set, expiry, atomic counters, and
/// owner-checked delete. Expired entries are logically absent even when not
/// yet physically purged.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> CacheResult<SetOutcome>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete `key` only while it still holds `expected`. Returns whether the
    /// key was deleted. Atomic on both backends (Lua script / map mutex).
    async fn compare_and_delete(&self, key: &str, expected: &str) -> CacheResult<bool>;

    /// Increment-or-create a window counter: the first increment creates the
    /// key with `window` as its TTL, later increments reuse the live entry.
    async fn increment(&self, key: &str, window: Duration) -> CacheResult<WindowCount>;
}

/// Construct the configured backend once at startup. Hot paths only ever see
/// the trait object.
pub fn create_cache(
    config: &CacheConfig,
    metrics: Arc<MetricsStore>,
) -> anyhow::Result<Arc<dyn CacheStore>> {
    match config.url.as_deref().map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => {
            tracing::info!("using redis cache backend");
            Ok(Arc::new(RedisStore::new(
                url,
                &config.namespace,
                config.op_timeout(),
                metrics,
            )?))
        }
        None => {
            tracing::warn!(
                "cache url not set; falling back to in-memory store (single instance only)"
            );
            Ok(Arc::new(MemoryStore::new(&config.namespace)))
        }
    }
}
