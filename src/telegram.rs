//! Minimal Telegram update model: only the fields the pipeline inspects.
//!
//! Unknown fields are preserved nowhere; the ingest endpoint forwards the raw
//! JSON payload to the queue, so the worker re-decodes the full update and the
//! handler boundary receives everything Telegram sent.

use serde::{Deserialize, Serialize};

/// An inbound update pushed by the Telegram Bot API webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<Chat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackQuery {
    pub from: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
}

impl Update {
    /// Conversation key for locking and per-chat rate limiting.
    ///
    /// Falls back to the callback sender's user id when the callback carries
    /// no message (e.g. answers to inline-mode queries).
    pub fn chat_id(&self) -> Option<i64> {
        if let Some(chat) = self.message.as_ref().and_then(|m| m.chat.as_ref()) {
            return Some(chat.id);
        }
        if let Some(cb) = &self.callback_query {
            if let Some(chat) = cb.message.as_ref().and_then(|m| m.chat.as_ref()) {
                return Some(chat.id);
            }
            return Some(cb.from.id);
        }
        None
    }
}
