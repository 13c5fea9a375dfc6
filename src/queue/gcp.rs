//! Google Cloud Pub/Sub queue backend.
//!
//! Publishing goes through one cached publisher per topic. Subscription uses
//! the broker's native at-least-once contract: a handler error nacks the
//! message for broker-side redelivery, while an undecodable payload is acked
//! away: redelivery cannot fix malformed bytes and this layer never retries
//! them.

use super::{MessageConsumer, Queue, QueueMessage};
use crate::config::QueueConfig;
use crate::metrics::{Counter, MetricsStore};
use anyhow::Context;
use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct PubsubQueue {
    client: Client,
    subscription_name: String,
    publishers: tokio::sync::Mutex<HashMap<String, Publisher>>,
    metrics: Arc<MetricsStore>,
    cancel: CancellationToken,
}

impl PubsubQueue {
    pub async fn connect(config: &QueueConfig, metrics: Arc<MetricsStore>) -> anyhow::Result<Self> {
        let mut client_config = ClientConfig::default()
            .with_auth()
            .await
            .context("gcp pub/sub auth setup failed")?;
        if let Some(project) = &config.project {
            client_config.project_id = Some(project.clone());
        }
        let client = Client::new(client_config)
            .await
            .context("gcp pub/sub client init failed")?;

        Ok(Self {
            client,
            subscription_name: config.subscription_name(),
            publishers: tokio::sync::Mutex::new(HashMap::new()),
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    async fn publisher(&self, topic: &str) -> Publisher {
        let mut cache = self.publishers.lock().await;
        cache
            .entry(topic.to_string())
            .or_insert_with(|| self.client.topic(topic).new_publisher(None))
            .clone()
    }
}

#[async_trait]
impl Queue for PubsubQueue {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        attributes: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.metrics.incr(Counter::QueuePublished);

        let data = serde_json::to_vec(&payload).context("queue payload serialization failed")?;
        let publisher = self.publisher(topic).await;
        let awaiter = publisher
            .publish(PubsubMessage {
                data: data.into(),
                attributes,
                ..Default::default()
            })
            .await;
        awaiter
            .get()
            .await
            .with_context(|| format!("publish to {topic} failed"))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer: Arc<dyn MessageConsumer>,
    ) -> anyhow::Result<()> {
        let subscription = self.client.subscription(&self.subscription_name);
        let cancel = self.cancel.child_token();
        let topic = topic.to_string();
        let subscription_name = self.subscription_name.clone();

        tokio::spawn(async move {
            let outcome = subscription
                .receive(
                    move |received, _ctx| {
                        let consumer = Arc::clone(&consumer);
                        let topic = topic.clone();
                        async move {
                            let payload: Value =
                                match serde_json::from_slice(&received.message.data) {
                                    Ok(payload) => payload,
                                    Err(err) => {
                                        tracing::warn!(
                                            "dropping undecodable message on {topic}: {err}"
                                        );
                                        let _ = received.ack().await;
                                        return;
                                    }
                                };
                            let message = QueueMessage {
                                id: received.message.message_id.clone(),
                                payload,
                                attributes: received.message.attributes.clone(),
                            };
                            match consumer.handle(message).await {
                                Ok(()) => {
                                    let _ = received.ack().await;
                                }
                                Err(err) => {
                                    tracing::error!("handler failed on {topic}: {err:#}");
                                    let _ = received.nack().await;
                                }
                            }
                        }
                    },
                    cancel,
                    None,
                )
                .await;
            if let Err(status) = outcome {
                tracing::error!("pub/sub receive loop for {subscription_name} ended: {status}");
            }
        });
        Ok(())
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
