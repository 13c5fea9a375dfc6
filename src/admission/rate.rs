//! Fixed-window admission control, global scope first, then per-chat.
//!
//! Approximate by design: counters reset at window boundaries, so a burst can
//! renew its allowance across a boundary. Good enough for abuse damping, not
//! for precise pacing. Cache outage denies (fail closed): admission cannot
//! be verified, and unlimited traffic during an outage is the worse failure.

use crate::cache::{CacheStore, WindowCount};
use crate::config::RateConfig;
use std::sync::Arc;
use std::time::Duration;

/// Rate-limiting partition: the whole system or one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Global,
    Chat,
}

impl RateScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RateScope::Global => "global",
            RateScope::Chat => "chat",
        }
    }
}

/// Allow/deny verdict with a backoff hint for the denied scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateVerdict {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
    pub scope: Option<RateScope>,
}

impl RateVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            scope: None,
        }
    }

    fn deny(scope: RateScope, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
            scope: Some(scope),
        }
    }
}

#[derive(Clone)]
pub struct RateController {
    cache: Arc<dyn CacheStore>,
    config: RateConfig,
}

impl RateController {
    pub fn new(cache: Arc<dyn CacheStore>, config: RateConfig) -> Self {
        Self { cache, config }
    }

    /// Check the global scope, then the per-chat scope when a conversation id
    /// is present. The first scope to reject short-circuits.
    pub async fn check(&self, chat_id: Option<i64>) -> RateVerdict {
        let window = self.config.window();

        match self.cache.increment("rate:global", window).await {
            Ok(count) if !within(&count, self.config.global_limit, self.config.global_burst) => {
                return RateVerdict::deny(RateScope::Global, count.ttl);
            }
            Ok(_) => {}
            Err(_) => return RateVerdict::deny(RateScope::Global, window),
        }

        let Some(chat_id) = chat_id else {
            return RateVerdict::allow();
        };

        let chat_key = format!("rate:chat:{chat_id}");
        match self.cache.increment(&chat_key, window).await {
            Ok(count) if !within(&count, self.config.chat_limit, self.config.chat_burst) => {
                RateVerdict::deny(RateScope::Chat, count.ttl)
            }
            Ok(_) => RateVerdict::allow(),
            Err(_) => RateVerdict::deny(RateScope::Chat, window),
        }
    }
}

fn within(count: &WindowCount, limit: u64, burst: u64) -> bool {
    count.count <= limit + burst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_util::FailingCache;
    use crate::cache::MemoryStore;

    fn controller(config: RateConfig) -> RateController {
        RateController::new(Arc::new(MemoryStore::new("t")), config)
    }

    fn small_config() -> RateConfig {
        RateConfig {
            window_secs: 60,
            global_limit: 100,
            global_burst: 0,
            chat_limit: 2,
            chat_burst: 1,
        }
    }

    #[tokio::test]
    async fn chat_scope_denies_past_limit_plus_burst() {
        let rate = controller(small_config());

        for _ in 0..3 {
            assert!(rate.check(Some(7)).await.allowed);
        }
        let verdict = rate.check(Some(7)).await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.scope, Some(RateScope::Chat));
        assert!(verdict.retry_after.is_some());
    }

    #[tokio::test]
    async fn chats_do_not_share_their_scope() {
        let rate = controller(small_config());
        for _ in 0..3 {
            assert!(rate.check(Some(1)).await.allowed);
        }
        assert!(!rate.check(Some(1)).await.allowed);
        assert!(rate.check(Some(2)).await.allowed);
    }

    #[tokio::test]
    async fn global_scope_rejects_first() {
        let rate = controller(RateConfig {
            window_secs: 60,
            global_limit: 2,
            global_burst: 0,
            chat_limit: 100,
            chat_burst: 0,
        });

        assert!(rate.check(Some(1)).await.allowed);
        assert!(rate.check(Some(2)).await.allowed);
        let verdict = rate.check(Some(3)).await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.scope, Some(RateScope::Global));
    }

    #[tokio::test]
    async fn window_boundary_resets_the_scope() {
        let rate = controller(RateConfig {
            window_secs: 1,
            global_limit: 1000,
            global_burst: 0,
            chat_limit: 1,
            chat_burst: 0,
        });

        assert!(rate.check(Some(5)).await.allowed);
        assert!(!rate.check(Some(5)).await.allowed);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(rate.check(Some(5)).await.allowed);
    }

    #[tokio::test]
    async fn updates_without_chat_only_consume_global() {
        let rate = controller(small_config());
        for _ in 0..10 {
            assert!(rate.check(None).await.allowed);
        }
    }

    #[tokio::test]
    async fn fails_closed_when_cache_is_down() {
        let rate = RateController::new(Arc::new(FailingCache::default()), small_config());
        let verdict = rate.check(Some(1)).await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.scope, Some(RateScope::Global));
        assert_eq!(verdict.retry_after, Some(Duration::from_secs(60)));
    }
}
