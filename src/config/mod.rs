//! Configuration schema, loaded from `engbot.toml` with env overrides.
//!
//! Every section has serde defaults so a missing file or a partial file both
//! yield a runnable configuration (memory cache, local queue). Secrets can be
//! supplied through the environment instead of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration (`engbot.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub dedup: DedupConfig,
    pub lock: LockConfig,
    pub rate: RateConfig,
    pub ingest: IngestConfig,
    pub worker: WorkerConfig,
    pub metrics: MetricsConfig,
}

/// Shared cache connection (`[cache]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection URL (`redis://` / `rediss://`). Empty selects the
    /// process-local in-memory store, which is valid for a single instance
    /// only. Overridden by `REDIS_URL`.
    pub url: Option<String>,
    /// Key prefix for multi-tenant sharing of one backing store.
    pub namespace: String,
    /// Client-side timeout per cache operation; an unreachable cache fails
    /// fast into the unavailable branch instead of stalling a handler.
    pub op_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: "engbot".into(),
            op_timeout_ms: 2_000,
        }
    }
}

impl CacheConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDriver {
    /// Durable local file log plus in-process fan-out.
    Local,
    /// Google Cloud Pub/Sub.
    Gcp,
}

/// Queue backend selection (`[queue]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub driver: QueueDriver,
    pub topic: String,
    /// Pub/Sub subscription name; defaults to `{topic}-subscription`.
    pub subscription: Option<String>,
    /// GCP project id; the client library's default resolution applies when
    /// unset (metadata server, emulator env).
    pub project: Option<String>,
    /// Backing file for the local driver.
    pub store_path: String,
    /// Local driver replay poll interval.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            driver: QueueDriver::Local,
            topic: "telegram_updates".into(),
            subscription: None,
            project: None,
            store_path: ".pubsub-queue.json".into(),
            poll_interval_ms: 50,
        }
    }
}

impl QueueConfig {
    pub fn subscription_name(&self) -> String {
        self.subscription
            .clone()
            .unwrap_or_else(|| format!("{}-subscription", self.topic))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Dedup windows (`[dedup]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Worker-side once-per-update window.
    pub update_ttl_secs: u64,
    /// Ingest-side claim window; 0 disables ingest dedup.
    pub webhook_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            update_ttl_secs: 3_600,
            webhook_ttl_secs: 0,
        }
    }
}

impl DedupConfig {
    pub fn update_ttl(&self) -> Duration {
        Duration::from_secs(self.update_ttl_secs)
    }
}

/// Per-chat mutual exclusion (`[lock]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock TTL. Must exceed the slowest expected handler but stay short
    /// enough to bound contention drops for a stuck chat.
    pub chat_ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { chat_ttl_ms: 8_000 }
    }
}

impl LockConfig {
    pub fn chat_ttl(&self) -> Duration {
        Duration::from_millis(self.chat_ttl_ms)
    }
}

/// Fixed-window admission limits (`[rate]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub window_secs: u64,
    pub global_limit: u64,
    pub global_burst: u64,
    pub chat_limit: u64,
    pub chat_burst: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            global_limit: 300,
            global_burst: 50,
            chat_limit: 20,
            chat_burst: 10,
        }
    }
}

impl RateConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

/// Ingest HTTP server (`[ingest]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret expected in `x-telegram-bot-api-secret-token`.
    /// Overridden by `TELEGRAM_WEBHOOK_SECRET`. Unset disables the check.
    pub webhook_secret: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            webhook_secret: None,
        }
    }
}

/// Worker health server (`[worker]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { port: 8081 }
    }
}

/// Counter persistence (`[metrics]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub store_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            store_path: ".metrics-store.json".into(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or from `engbot.toml` when it exists,
    /// falling back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = path.unwrap_or_else(|| Path::new("engbot.toml"));
        let mut config = if candidate.exists() {
            let raw = std::fs::read_to_string(candidate)
                .with_context(|| format!("failed to read config at {}", candidate.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse config at {}", candidate.display()))?
        } else if path.is_some() {
            anyhow::bail!("config file not found: {}", candidate.display());
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment wins over the file for secrets and deploy wiring.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                self.cache.url = Some(url);
            }
        }
        if let Ok(secret) = std::env::var("TELEGRAM_WEBHOOK_SECRET") {
            if !secret.trim().is_empty() {
                self.ingest.webhook_secret = Some(secret);
            }
        }
    }
}
