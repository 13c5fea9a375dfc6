//! Worker pipeline: decode, dedup, lock, rate-check, dispatch.
//!
//! Every stage that drops an update bumps a dedicated counter, so "how many
//! and why" is always answerable from `/metrics`. Handle latency is recorded
//! for every delivery, dropped or dispatched.

pub mod handler;

pub use handler::{LoggingHandler, UpdateHandler};

use crate::admission::{ChatLock, DedupGate, RateController};
use crate::cache::create_cache;
use crate::config::Config;
use crate::metrics::{Counter, MetricsStore};
use crate::queue::{create_queue, MessageConsumer, QueueMessage};
use crate::telegram::Update;
use async_trait::async_trait;
use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Queue consumer that runs each update through the admission pipeline before
/// handing it to the [`UpdateHandler`].
pub struct UpdateWorker {
    dedup: DedupGate,
    lock: ChatLock,
    rate: RateController,
    metrics: Arc<MetricsStore>,
    handler: Arc<dyn UpdateHandler>,
    dedup_ttl: Duration,
}

impl UpdateWorker {
    pub fn new(
        dedup: DedupGate,
        lock: ChatLock,
        rate: RateController,
        metrics: Arc<MetricsStore>,
        handler: Arc<dyn UpdateHandler>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            dedup,
            lock,
            rate,
            metrics,
            handler,
            dedup_ttl,
        }
    }

    async fn process(&self, message: QueueMessage) {
        let update: Update = match serde_json::from_value(message.payload) {
            Ok(update) => update,
            Err(err) => {
                self.metrics.incr(Counter::WorkerUpdatesMalformed);
                tracing::warn!("dropping malformed queue message {}: {err}", message.id);
                return;
            }
        };
        self.metrics.incr(Counter::WorkerUpdatesReceived);

        let dedup_key = format!("update:{}", update.update_id);
        if self.dedup.seen(&dedup_key, self.dedup_ttl).await {
            self.metrics.incr(Counter::WorkerUpdatesDuplicate);
            tracing::info!("skipping duplicate update {}", update.update_id);
            return;
        }

        match update.chat_id() {
            Some(chat_id) => {
                let lock_key = format!("chat:{chat_id}");
                let held = self
                    .lock
                    .with_lock(&lock_key, self.admit_and_dispatch(&update, Some(chat_id)))
                    .await;
                if held.is_none() {
                    self.metrics.incr(Counter::WorkerLockContention);
                    tracing::info!(
                        "chat {chat_id} is busy, dropping update {}",
                        update.update_id
                    );
                }
            }
            // No conversation key, nothing to serialize against.
            None => self.admit_and_dispatch(&update, None).await,
        }
    }

    async fn admit_and_dispatch(&self, update: &Update, chat_id: Option<i64>) {
        let verdict = self.rate.check(chat_id).await;
        if !verdict.allowed {
            self.metrics.incr(Counter::WorkerRateLimitDrop);
            tracing::info!(
                "rate limit ({}) dropped update {}, retry after {:?}",
                verdict.scope.map_or("unknown", |scope| scope.as_str()),
                update.update_id,
                verdict.retry_after,
            );
            return;
        }

        match self.handler.handle(update, chat_id).await {
            Ok(()) => {
                self.metrics.incr(Counter::WorkerUpdatesProcessed);
            }
            Err(err) => {
                self.metrics.incr(Counter::WorkerErrors);
                tracing::error!("handler failed for update {}: {err:#}", update.update_id);
            }
        }
    }
}

#[async_trait]
impl MessageConsumer for UpdateWorker {
    /// Delivery entrypoint. Drops are terminal by design: the update was
    /// already claimed in the dedup gate, so a redelivery would be discarded
    /// as a duplicate anyway. The queue never sees an error here.
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()> {
        let started = Instant::now();
        self.process(message).await;
        self.metrics.record_worker_handle_latency(started.elapsed());
        Ok(())
    }
}

/// Run the worker: subscribe to the update topic and serve health/metrics
/// until ctrl-c.
pub async fn run(config: &Config) -> anyhow::Result<()> {
    let metrics = Arc::new(MetricsStore::open(&config.metrics.store_path));
    let cache = create_cache(&config.cache, Arc::clone(&metrics))?;
    let queue = create_queue(&config.queue, Arc::clone(&metrics)).await?;

    let worker = Arc::new(UpdateWorker::new(
        DedupGate::new(Arc::clone(&cache)),
        ChatLock::new(Arc::clone(&cache), config.lock.chat_ttl()),
        RateController::new(cache, config.rate.clone()),
        Arc::clone(&metrics),
        Arc::new(LoggingHandler),
        config.dedup.update_ttl(),
    ));
    queue.subscribe(&config.queue.topic, worker).await?;
    tracing::info!("worker subscribed to {}", config.queue.topic);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.worker.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("worker health server listening on {addr}");

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(worker_metrics))
        .with_state(Arc::clone(&metrics));

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
        })
        .await?;
    queue.shutdown();
    Ok(())
}

async fn worker_metrics(State(metrics): State<Arc<MetricsStore>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics.render_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_util::FailingCache;
    use crate::cache::{CacheStore, MemoryStore};
    use crate::config::RateConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    struct RecordingHandler {
        handled: Mutex<Vec<i64>>,
        delay: Duration,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handled: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                handled: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl UpdateHandler for RecordingHandler {
        async fn handle(&self, update: &Update, _chat_id: Option<i64>) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.handled.lock().push(update.update_id);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl UpdateHandler for FailingHandler {
        async fn handle(&self, _update: &Update, _chat_id: Option<i64>) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn build_worker(
        cache: Arc<dyn CacheStore>,
        metrics: Arc<MetricsStore>,
        handler: Arc<dyn UpdateHandler>,
    ) -> Arc<UpdateWorker> {
        Arc::new(UpdateWorker::new(
            DedupGate::new(Arc::clone(&cache)),
            ChatLock::new(Arc::clone(&cache), Duration::from_secs(8)),
            RateController::new(
                cache,
                RateConfig {
                    window_secs: 60,
                    global_limit: 100,
                    global_burst: 0,
                    chat_limit: 3,
                    chat_burst: 0,
                },
            ),
            metrics,
            handler,
            Duration::from_secs(3600),
        ))
    }

    fn temp_metrics(dir: &tempfile::TempDir) -> Arc<MetricsStore> {
        Arc::new(MetricsStore::open(dir.path().join("metrics.json")))
    }

    fn update_message(update_id: i64, chat_id: i64) -> QueueMessage {
        QueueMessage {
            id: format!("m{update_id}"),
            payload: json!({
                "update_id": update_id,
                "message": { "chat": { "id": chat_id }, "text": "hi" }
            }),
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn processes_update_and_counts_it() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let handler = RecordingHandler::new();
        let worker = build_worker(Arc::new(MemoryStore::new("t")), Arc::clone(&metrics), handler.clone());

        worker.handle(update_message(1, 10)).await.unwrap();

        assert_eq!(*handler.handled.lock(), vec![1]);
        let counters = metrics.snapshot().counters;
        assert_eq!(counters.worker_updates_received, 1);
        assert_eq!(counters.worker_updates_processed, 1);
        assert_eq!(counters.worker_updates_duplicate, 0);
    }

    #[tokio::test]
    async fn second_delivery_is_dropped_as_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let handler = RecordingHandler::new();
        let worker = build_worker(Arc::new(MemoryStore::new("t")), Arc::clone(&metrics), handler.clone());

        worker.handle(update_message(7, 10)).await.unwrap();
        worker.handle(update_message(7, 10)).await.unwrap();

        assert_eq!(*handler.handled.lock(), vec![7]);
        let counters = metrics.snapshot().counters;
        assert_eq!(counters.worker_updates_duplicate, 1);
        assert_eq!(counters.worker_updates_processed, 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_counted_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let handler = RecordingHandler::new();
        let worker = build_worker(Arc::new(MemoryStore::new("t")), Arc::clone(&metrics), handler.clone());

        let message = QueueMessage {
            id: "bad".into(),
            payload: json!({ "not_an_update": true }),
            attributes: HashMap::new(),
        };
        worker.handle(message).await.unwrap();

        assert!(handler.handled.lock().is_empty());
        let counters = metrics.snapshot().counters;
        assert_eq!(counters.worker_updates_malformed, 1);
        assert_eq!(counters.worker_updates_received, 0);
    }

    #[tokio::test]
    async fn concurrent_updates_for_one_chat_contend_on_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let handler = RecordingHandler::slow(Duration::from_millis(80));
        let worker = build_worker(Arc::new(MemoryStore::new("t")), Arc::clone(&metrics), handler.clone());

        let first = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.handle(update_message(1, 42)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.handle(update_message(2, 42)).await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(*handler.handled.lock(), vec![1]);
        let counters = metrics.snapshot().counters;
        assert_eq!(counters.worker_lock_contention, 1);
        assert_eq!(counters.worker_updates_processed, 1);
    }

    #[tokio::test]
    async fn chat_over_limit_is_rate_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let handler = RecordingHandler::new();
        let worker = build_worker(Arc::new(MemoryStore::new("t")), Arc::clone(&metrics), handler.clone());

        // chat_limit is 3 with no burst, so the fourth update is denied.
        for update_id in 1..=4 {
            worker.handle(update_message(update_id, 9)).await.unwrap();
        }

        assert_eq!(*handler.handled.lock(), vec![1, 2, 3]);
        let counters = metrics.snapshot().counters;
        assert_eq!(counters.worker_ratelimit_drop, 1);
        assert_eq!(counters.worker_updates_processed, 3);
    }

    #[tokio::test]
    async fn handler_error_is_counted_but_delivery_still_acks() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let worker = build_worker(
            Arc::new(MemoryStore::new("t")),
            Arc::clone(&metrics),
            Arc::new(FailingHandler),
        );

        assert!(worker.handle(update_message(1, 10)).await.is_ok());

        let counters = metrics.snapshot().counters;
        assert_eq!(counters.worker_errors, 1);
        assert_eq!(counters.worker_updates_processed, 0);
    }

    #[tokio::test]
    async fn cache_outage_with_chat_fails_closed_at_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let handler = RecordingHandler::new();
        let worker = build_worker(
            Arc::new(FailingCache::default()),
            Arc::clone(&metrics),
            handler.clone(),
        );

        worker.handle(update_message(1, 10)).await.unwrap();

        // Dedup fails open, the lock fails closed.
        assert!(handler.handled.lock().is_empty());
        let counters = metrics.snapshot().counters;
        assert_eq!(counters.worker_updates_duplicate, 0);
        assert_eq!(counters.worker_lock_contention, 1);
    }

    #[tokio::test]
    async fn cache_outage_without_chat_fails_closed_at_the_rate_check() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = temp_metrics(&dir);
        let handler = RecordingHandler::new();
        let worker = build_worker(
            Arc::new(FailingCache::default()),
            Arc::clone(&metrics),
            handler.clone(),
        );

        let message = QueueMessage {
            id: "m1".into(),
            payload: json!({ "update_id": 1 }),
            attributes: HashMap::new(),
        };
        worker.handle(message).await.unwrap();

        assert!(handler.handled.lock().is_empty());
        assert_eq!(metrics.snapshot().counters.worker_ratelimit_drop, 1);
    }
}
