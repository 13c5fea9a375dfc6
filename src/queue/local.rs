//! Local queue backend: an append-only JSON file log plus in-process fan-out.
//!
//! Every publish appends to the shared file and immediately fans out to the
//! subscribers registered in this process (fire-and-forget; handler errors
//! are logged, not propagated). A background poller per subscription re-scans
//! the file and delivers entries whose id is not in the in-memory processed
//! set, so a subscriber that registers after a publish, or a restarted
//! process, still drains missed messages. The processed set is not persisted:
//! a restart can redeliver older entries on the next poll. At-least-once,
//! not exactly-once. Entries are retained after delivery for replay/audit.

use super::{MessageConsumer, Queue, QueueMessage};
use crate::metrics::{Counter, MetricsStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    topic: String,
    payload: Value,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Default)]
struct LocalState {
    subscribers: HashMap<String, Vec<Arc<dyn MessageConsumer>>>,
    processed: HashSet<String>,
}

pub struct LocalQueue {
    path: PathBuf,
    poll_interval: Duration,
    metrics: Arc<MetricsStore>,
    state: Arc<Mutex<LocalState>>,
    /// Serializes the read-append-rewrite cycle on the log file. Without it,
    /// concurrent publishes interleave across the await points and overwrite
    /// each other's appends.
    log_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl LocalQueue {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, metrics: Arc<MetricsStore>) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            metrics,
            state: Arc::new(Mutex::new(LocalState::default())),
            log_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }
}

async fn read_log(path: &Path) -> Vec<StoredMessage> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

async fn write_log(path: &Path, log: &[StoredMessage]) {
    let raw = match serde_json::to_vec(log) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!("failed to serialize queue log: {err}");
            return;
        }
    };
    if let Err(err) = tokio::fs::write(path, raw).await {
        tracing::warn!("failed to write queue log {}: {err}", path.display());
    }
}

fn dispatch(consumer: Arc<dyn MessageConsumer>, topic: String, message: QueueMessage) {
    tokio::spawn(async move {
        if let Err(err) = consumer.handle(message).await {
            tracing::error!("local queue handler error on {topic}: {err:#}");
        }
    });
}

#[async_trait]
impl Queue for LocalQueue {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        attributes: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.metrics.incr(Counter::QueuePublished);

        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            attributes,
        };

        {
            let _guard = self.log_lock.lock().await;
            let mut log = read_log(&self.path).await;
            log.push(stored.clone());
            write_log(&self.path, &log).await;
        }

        // Fan out to live subscribers and mark the id processed so the poller
        // does not deliver it a second time in this process.
        let consumers: Vec<Arc<dyn MessageConsumer>> = {
            let mut state = self.state.lock();
            let consumers = state.subscribers.get(topic).cloned().unwrap_or_default();
            if !consumers.is_empty() {
                state.processed.insert(stored.id.clone());
            }
            consumers
        };
        for consumer in consumers {
            let message = QueueMessage {
                id: stored.id.clone(),
                payload: stored.payload.clone(),
                attributes: stored.attributes.clone(),
            };
            dispatch(consumer, stored.topic.clone(), message);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer: Arc<dyn MessageConsumer>,
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&consumer));
        tracing::info!("local queue subscribed to {topic}");

        let path = self.path.clone();
        let state = Arc::clone(&self.state);
        let topic = topic.to_string();
        let poll_interval = self.poll_interval;
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let log = read_log(&path).await;
                let deliverable: Vec<StoredMessage> = {
                    let mut state = state.lock();
                    // insert() returns false for ids already marked, so one
                    // pass both dedups and claims.
                    log.into_iter()
                        .filter(|item| {
                            item.topic == topic && state.processed.insert(item.id.clone())
                        })
                        .collect()
                };
                for item in deliverable {
                    let message = QueueMessage {
                        id: item.id,
                        payload: item.payload,
                        attributes: item.attributes,
                    };
                    dispatch(Arc::clone(&consumer), item.topic, message);
                }
            }
        });
        Ok(())
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
