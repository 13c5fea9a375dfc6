//! Redis cache backend.
//!
//! Connects lazily through a [`ConnectionManager`] so a cache that is down at
//! startup does not keep the process from serving; operations fail into the
//! unavailable branch until the manager can establish a connection, and the
//! manager reconnects on its own afterwards. Every operation carries a
//! client-side timeout.

use super::{CacheResult, CacheStore, CacheUnavailable, SetOptions, SetOutcome, WindowCount};
use crate::metrics::{Counter, MetricsStore};
use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Owner-checked delete: remove the key only while it still holds the token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

/// Window counter in one round trip. Stamps the window TTL when the
/// increment created the key, and repairs a counter left without expiry,
/// so the counter can never persist past its window.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call("incr", KEYS[1])
local ttl = redis.call("ttl", KEYS[1])
if ttl < 0 then
  redis.call("expire", KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

pub struct RedisStore {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
    namespace: String,
    op_timeout: Duration,
    metrics: Arc<MetricsStore>,
    release: Script,
    window: Script,
}

impl RedisStore {
    pub fn new(
        url: &str,
        namespace: &str,
        op_timeout: Duration,
        metrics: Arc<MetricsStore>,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(None),
            namespace: namespace.to_string(),
            op_timeout,
            metrics,
            release: Script::new(RELEASE_SCRIPT),
            window: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn report(&self, op: &str, detail: impl std::fmt::Display) -> CacheUnavailable {
        self.metrics.incr(Counter::CacheErrors);
        tracing::warn!("redis {op} failed: {detail}");
        CacheUnavailable
    }

    async fn manager(&self) -> CacheResult<ConnectionManager> {
        let mut slot = self.conn.lock().await;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }
        match tokio::time::timeout(self.op_timeout, ConnectionManager::new(self.client.clone()))
            .await
        {
            Ok(Ok(manager)) => {
                *slot = Some(manager.clone());
                Ok(manager)
            }
            Ok(Err(err)) => Err(self.report("connect", err)),
            Err(_) => Err(self.report("connect", "client-side timeout")),
        }
    }

    async fn run<T, F>(&self, op: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.report(op, err)),
            Err(_) => Err(self.report(op, "client-side timeout")),
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.manager().await?;
        let key = self.key(key);
        self.run("get", async move {
            redis::cmd("GET")
                .arg(&key)
                .query_async::<Option<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> CacheResult<SetOutcome> {
        let mut conn = self.manager().await?;
        let key = self.key(key);
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(value);
        if let Some(ttl) = opts.ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        if opts.only_if_absent {
            cmd.arg("NX");
        }

        // With NX, Redis answers OK or nil; nil means the key already exists.
        let reply: Option<String> = self
            .run("set", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(if reply.is_some() {
            SetOutcome::Applied
        } else {
            SetOutcome::Rejected
        })
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.manager().await?;
        let key = self.key(key);
        let _deleted: i64 = self
            .run("del", async move {
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let mut conn = self.manager().await?;
        let key = self.key(key);
        let script = &self.release;
        let deleted: i64 = self
            .run("compare_and_delete", async move {
                script
                    .key(&key)
                    .arg(expected)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(deleted == 1)
    }

    async fn increment(&self, key: &str, window: Duration) -> CacheResult<WindowCount> {
        let mut conn = self.manager().await?;
        let key = self.key(key);
        let window_secs = window.as_secs().max(1);
        let script = &self.window;
        let (count, ttl_secs): (u64, u64) = self
            .run("rate_incr", async move {
                script
                    .key(&key)
                    .arg(window_secs)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(WindowCount {
            count,
            ttl: Duration::from_secs(ttl_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url_at_construction() {
        let metrics = Arc::new(MetricsStore::open(
            tempfile::tempdir().unwrap().path().join("m.json"),
        ));
        let Err(err) = RedisStore::new("not-a-url", "t", Duration::from_secs(1), metrics) else {
            panic!("construction should reject a malformed url");
        };
        assert!(err.to_string().contains("invalid redis url"));
    }
}
