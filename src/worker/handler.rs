//! Business-logic boundary for the worker pipeline.

use crate::telegram::Update;
use async_trait::async_trait;

/// Receives updates that survived dedup, locking, and rate admission.
///
/// Implementations hold the actual bot behavior; the pipeline only promises
/// that calls for one chat never overlap.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, update: &Update, chat_id: Option<i64>) -> anyhow::Result<()>;
}

/// Default handler for the worker binary: logs the update and returns.
pub struct LoggingHandler;

#[async_trait]
impl UpdateHandler for LoggingHandler {
    async fn handle(&self, update: &Update, chat_id: Option<i64>) -> anyhow::Result<()> {
        let text = update
            .message
            .as_ref()
            .and_then(|message| message.text.as_deref())
            .unwrap_or("<no text>");
        tracing::info!(
            "handling update {} for chat {:?}: {text}",
            update.update_id,
            chat_id
        );
        Ok(())
    }
}
