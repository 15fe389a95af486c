use crate::signature::constant_time_eq;
use crate::traits::ChannelAdapter;
use crate::types::{Classification, CommandEnvelope, EnvironmentMode, parse_command_text};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Team-chat outgoing-webhook adapter (Mattermost wire format). The provider
/// authenticates with a shared webhook token carried in the payload; replies
/// are posted to a configured incoming-webhook URL on the same deployment,
/// which keeps the adapter usable in network-isolated environments.
#[derive(Clone)]
pub struct MattermostAdapter {
    webhook_path: String,
    outgoing_token: String,
    reply_url: String,
    max_classification: Classification,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MattermostOutgoingPayload {
    #[serde(default)]
    token: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    post_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    text: String,
    /// Unix milliseconds on the wire.
    #[serde(default)]
    timestamp: Option<i64>,
}

impl MattermostAdapter {
    pub fn new(
        webhook_path: impl Into<String>,
        outgoing_token: &str,
        reply_url: &str,
        max_classification: Classification,
    ) -> anyhow::Result<Self> {
        let outgoing_token = outgoing_token.trim();
        if outgoing_token.is_empty() {
            return Err(anyhow::anyhow!("mattermost outgoing webhook token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            webhook_path: webhook_path.into(),
            outgoing_token: outgoing_token.to_string(),
            reply_url: reply_url.trim().to_string(),
            max_classification,
            http,
        })
    }
}

#[async_trait]
impl ChannelAdapter for MattermostAdapter {
    fn channel_name(&self) -> &str {
        "mattermost"
    }

    fn webhook_path(&self) -> &str {
        &self.webhook_path
    }

    fn verify_signature(&self, raw_body: &[u8], _headers: &HeaderMap) -> bool {
        let payload: MattermostOutgoingPayload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        constant_time_eq(payload.token.trim(), &self.outgoing_token)
    }

    fn parse(&self, raw_body: &[u8], _headers: &HeaderMap) -> Option<CommandEnvelope> {
        let payload: MattermostOutgoingPayload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(%error, "mattermost payload is not valid json");
                return None;
            }
        };
        let user = payload.user_id.trim();
        if user.is_empty() {
            return None;
        }
        let parsed = parse_command_text(&payload.text)?;

        let message_id = payload
            .post_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?
            .to_string();
        let mut envelope =
            CommandEnvelope::new(self.channel_name(), user.into(), message_id.into(), parsed);
        envelope.display_name = payload
            .user_name
            .filter(|name| !name.trim().is_empty());
        envelope.thread_id = payload
            .channel_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(Into::into);
        envelope.signature_present = !payload.token.trim().is_empty();
        if let Some(timestamp) = payload
            .timestamp
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        {
            envelope.timestamp = timestamp;
        }
        Some(envelope)
    }

    async fn send_message(&self, _target_id: &str, text: &str, thread_id: Option<&str>) -> bool {
        if self.reply_url.is_empty() {
            tracing::warn!("mattermost reply skipped: no incoming webhook url configured");
            return false;
        }
        if text.trim().is_empty() {
            tracing::warn!("mattermost reply skipped: empty body");
            return false;
        }
        let mut payload = serde_json::json!({ "text": text });
        if let Some(root_id) = thread_id.map(str::trim).filter(|id| !id.is_empty()) {
            payload["root_id"] = serde_json::json!(root_id);
        }

        match self.http.post(&self.reply_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "mattermost reply rejected");
                false
            }
            Err(error) => {
                tracing::warn!(%error, "mattermost reply request failed");
                false
            }
        }
    }

    fn is_available(&self, _mode: EnvironmentMode) -> bool {
        true
    }

    fn max_classification(&self) -> Classification {
        self.max_classification
    }
}

#[cfg(test)]
mod tests {
    use super::MattermostAdapter;
    use crate::traits::ChannelAdapter;
    use crate::types::Classification;
    use axum::http::HeaderMap;

    fn adapter() -> MattermostAdapter {
        MattermostAdapter::new(
            "/mattermost-webhook",
            "hook-token",
            "https://chat.internal.example/hooks/abc",
            Classification::Internal,
        )
        .expect("adapter should build")
    }

    fn payload(token: &str, text: &str) -> Vec<u8> {
        serde_json::json!({
            "token": token,
            "user_id": "mm-user-1",
            "user_name": "dana",
            "post_id": "post-9",
            "channel_id": "town-square",
            "text": text,
            "timestamp": 1716572940000_i64,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn verify_signature_compares_webhook_token() {
        let adapter = adapter();
        assert!(adapter.verify_signature(&payload("hook-token", "/status"), &HeaderMap::new()));
        assert!(!adapter.verify_signature(&payload("stolen", "/status"), &HeaderMap::new()));
        assert!(!adapter.verify_signature(b"not json", &HeaderMap::new()));
    }

    #[test]
    fn parse_builds_envelope_and_keeps_wire_timestamp() {
        let adapter = adapter();
        let envelope = adapter
            .parse(&payload("hook-token", "/scan proj-7"), &HeaderMap::new())
            .expect("command payload should parse");
        assert_eq!(envelope.channel, "mattermost");
        assert_eq!(envelope.channel_user_id.as_str(), "mm-user-1");
        assert_eq!(envelope.display_name.as_deref(), Some("dana"));
        assert_eq!(envelope.command, "scan");
        assert_eq!(envelope.project_id.as_deref(), Some("proj-7"));
        assert_eq!(envelope.thread_id.as_deref(), Some("town-square"));
        assert_eq!(envelope.timestamp.timestamp(), 1716572940);
    }

    #[test]
    fn parse_ignores_chatter_and_missing_post_id() {
        let adapter = adapter();
        assert!(
            adapter
                .parse(&payload("hook-token", "lunch anyone?"), &HeaderMap::new())
                .is_none()
        );
        let missing_post = serde_json::json!({
            "token": "hook-token",
            "user_id": "mm-user-1",
            "text": "/status",
        });
        assert!(
            adapter
                .parse(missing_post.to_string().as_bytes(), &HeaderMap::new())
                .is_none()
        );
    }
}
