//! Pub/sub queue contract with two interchangeable backends: a durable local
//! file log with in-process fan-out, and Google Cloud Pub/Sub.
//!
//! Delivery is at-least-once with no ordering guarantee; consumers must be
//! idempotent (the worker's dedup gate exists for exactly this reason).

pub mod gcp;
pub mod local;

pub use gcp::PubsubQueue;
pub use local::LocalQueue;

use crate::config::{QueueConfig, QueueDriver};
use crate::metrics::MetricsStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Message envelope as delivered to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub payload: Value,
    pub attributes: HashMap<String, String>,
}

/// Subscriber callback. May be invoked concurrently and independently for
/// each delivered message.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        attributes: HashMap<String, String>,
    ) -> anyhow::Result<()>;

    async fn subscribe(&self, topic: &str, consumer: Arc<dyn MessageConsumer>)
        -> anyhow::Result<()>;

    /// Stop background delivery tasks. Messages already handed to consumers
    /// run to completion or die with the runtime (drain-by-abandon).
    fn shutdown(&self) {}
}

/// Construct the configured backend once at startup.
pub async fn create_queue(
    config: &QueueConfig,
    metrics: Arc<MetricsStore>,
) -> anyhow::Result<Arc<dyn Queue>> {
    match config.driver {
        QueueDriver::Local => {
            tracing::info!("using local file queue at {}", config.store_path);
            Ok(Arc::new(LocalQueue::new(
                &config.store_path,
                config.poll_interval(),
                metrics,
            )))
        }
        QueueDriver::Gcp => {
            tracing::info!("using gcp pub/sub queue");
            Ok(Arc::new(PubsubQueue::connect(config, metrics).await?))
        }
    }
}
