use crate::traits::ChannelAdapter;
use crate::types::{Classification, CommandEnvelope, EnvironmentMode, parse_command_text};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

const OUTBOX_CAP_PER_THREAD: usize = 50;

/// Replies delivered to the in-application chat surface. Kept in memory per
/// thread so the app can fetch them; oldest entries are dropped at the cap.
#[derive(Debug, Clone)]
pub struct InternalReply {
    pub text: String,
    pub delivered_at: DateTime<Utc>,
}

/// Same-process chat surface. No transport signature exists on this channel,
/// so signature verification is vacuously true and the first chain gate
/// treats the channel as exempt.
#[derive(Clone)]
pub struct InternalChatAdapter {
    webhook_path: String,
    max_classification: Classification,
    outbox: Arc<DashMap<String, Vec<InternalReply>>>,
}

#[derive(Debug, Deserialize)]
struct InternalChatPayload {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    text: String,
    #[serde(default)]
    sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    from_bot: bool,
}

impl InternalChatAdapter {
    pub fn new(webhook_path: impl Into<String>, max_classification: Classification) -> Self {
        Self {
            webhook_path: webhook_path.into(),
            max_classification,
            outbox: Arc::new(DashMap::new()),
        }
    }

    /// Drains and returns replies queued for a thread.
    pub fn take_replies(&self, thread_id: &str) -> Vec<InternalReply> {
        self.outbox
            .remove(thread_id)
            .map(|(_, replies)| replies)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChannelAdapter for InternalChatAdapter {
    fn channel_name(&self) -> &str {
        "internal"
    }

    fn webhook_path(&self) -> &str {
        &self.webhook_path
    }

    fn signature_exempt(&self) -> bool {
        true
    }

    fn verify_signature(&self, _raw_body: &[u8], _headers: &HeaderMap) -> bool {
        true
    }

    fn parse(&self, raw_body: &[u8], _headers: &HeaderMap) -> Option<CommandEnvelope> {
        let payload: InternalChatPayload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(%error, "internal chat payload is not valid json");
                return None;
            }
        };
        if payload.user_id.trim().is_empty() {
            return None;
        }
        let parsed = parse_command_text(&payload.text)?;

        let message_id = payload
            .message_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut envelope = CommandEnvelope::new(
            self.channel_name(),
            payload.user_id.trim().into(),
            message_id.into(),
            parsed,
        );
        envelope.display_name = payload.display_name.filter(|name| !name.trim().is_empty());
        envelope.thread_id = payload
            .thread_id
            .filter(|id| !id.trim().is_empty())
            .map(Into::into);
        if let Some(sent_at) = payload.sent_at {
            envelope.timestamp = sent_at;
        }
        envelope.from_bot = payload.from_bot;
        envelope.signature_present = false;
        Some(envelope)
    }

    async fn send_message(&self, target_id: &str, text: &str, _thread_id: Option<&str>) -> bool {
        let mut entry = self.outbox.entry(target_id.to_string()).or_default();
        entry.push(InternalReply {
            text: text.to_string(),
            delivered_at: Utc::now(),
        });
        if entry.len() > OUTBOX_CAP_PER_THREAD {
            let drop_len = entry.len() - OUTBOX_CAP_PER_THREAD;
            entry.drain(0..drop_len);
        }
        true
    }

    fn is_available(&self, _mode: EnvironmentMode) -> bool {
        true
    }

    fn max_classification(&self) -> Classification {
        self.max_classification
    }
}
