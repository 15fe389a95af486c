use crate::signature::{constant_time_eq, hmac_sha256_hex};
use crate::traits::ChannelAdapter;
use crate::types::{Classification, CommandEnvelope, EnvironmentMode, parse_command_text};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Slack Events API adapter. Verifies the `v0=` request signature over
/// `v0:{timestamp}:{body}` with the app signing secret and replies through
/// `chat.postMessage`, so it needs outbound internet.
#[derive(Clone)]
pub struct SlackGatewayAdapter {
    webhook_path: String,
    signing_secret: String,
    bot_token: String,
    max_classification: Classification,
    http: reqwest::Client,
}

impl SlackGatewayAdapter {
    pub fn new(
        webhook_path: impl Into<String>,
        signing_secret: &str,
        bot_token: &str,
        max_classification: Classification,
    ) -> anyhow::Result<Self> {
        let signing_secret = signing_secret.trim();
        if signing_secret.is_empty() {
            return Err(anyhow::anyhow!("slack signing secret is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            webhook_path: webhook_path.into(),
            signing_secret: signing_secret.to_string(),
            bot_token: bot_token.trim().to_string(),
            max_classification,
            http,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SlackEventCallback {
    #[serde(rename = "type")]
    callback_type: String,
    #[serde(default)]
    event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackPostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ChannelAdapter for SlackGatewayAdapter {
    fn channel_name(&self) -> &str {
        "slack"
    }

    fn webhook_path(&self) -> &str {
        &self.webhook_path
    }

    fn verify_signature(&self, raw_body: &[u8], headers: &HeaderMap) -> bool {
        let Some(signature) = header_str(headers, SIGNATURE_HEADER) else {
            return false;
        };
        let Some(timestamp) = header_str(headers, TIMESTAMP_HEADER) else {
            return false;
        };
        if timestamp.parse::<i64>().is_err() {
            return false;
        }
        let mut base = Vec::with_capacity(raw_body.len() + timestamp.len() + 4);
        base.extend_from_slice(b"v0:");
        base.extend_from_slice(timestamp.as_bytes());
        base.extend_from_slice(b":");
        base.extend_from_slice(raw_body);
        let expected = format!(
            "v0={}",
            hmac_sha256_hex(self.signing_secret.as_bytes(), &base)
        );
        constant_time_eq(&expected, signature)
    }

    fn parse(&self, raw_body: &[u8], headers: &HeaderMap) -> Option<CommandEnvelope> {
        let callback: SlackEventCallback = match serde_json::from_slice(raw_body) {
            Ok(callback) => callback,
            Err(error) => {
                tracing::debug!(%error, "slack payload is not a recognizable event");
                return None;
            }
        };
        // Handshake pings and anything that is not an event callback.
        if callback.callback_type != "event_callback" {
            return None;
        }
        let event = callback.event?;
        if event.event_type != "message" && event.event_type != "app_mention" {
            return None;
        }
        // Edits, joins, and our own bot echoes arrive with a subtype.
        if event.subtype.is_some() {
            return None;
        }

        let user = event.user.as_deref().map(str::trim).unwrap_or_default();
        if user.is_empty() {
            return None;
        }
        let text = strip_leading_mentions(event.text.as_deref().unwrap_or_default());
        let parsed = parse_command_text(&text)?;
        let ts = event.ts.as_deref().map(str::trim).unwrap_or_default();
        if ts.is_empty() {
            return None;
        }

        let mut envelope =
            CommandEnvelope::new(self.channel_name(), user.into(), ts.to_string().into(), parsed);
        envelope.thread_id = event
            .channel
            .as_deref()
            .map(str::trim)
            .filter(|channel| !channel.is_empty())
            .map(Into::into);
        envelope.from_bot = event.bot_id.is_some();
        envelope.signature_present = headers.contains_key(SIGNATURE_HEADER);
        if let Some(timestamp) = header_str(headers, TIMESTAMP_HEADER)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            envelope.timestamp = timestamp;
        } else if let Some(timestamp) = parse_slack_ts(ts) {
            envelope.timestamp = timestamp;
        }
        Some(envelope)
    }

    async fn send_message(&self, target_id: &str, text: &str, thread_id: Option<&str>) -> bool {
        let channel = target_id.trim();
        if channel.is_empty() || text.trim().is_empty() {
            tracing::warn!("slack reply skipped: empty channel or body");
            return false;
        }
        let mut payload = serde_json::json!({
            "channel": channel,
            "text": text,
        });
        if let Some(thread_ts) = thread_id.map(str::trim).filter(|ts| !ts.is_empty()) {
            payload["thread_ts"] = serde_json::json!(thread_ts);
        }

        let response = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.bot_token)
            .json(&payload)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, channel, "slack chat.postMessage request failed");
                return false;
            }
        };
        let status = response.status();
        let body: SlackPostMessageResponse = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(%error, channel, "slack chat.postMessage returned invalid json");
                return false;
            }
        };
        if !status.is_success() || !body.ok {
            tracing::warn!(
                %status,
                channel,
                error = body.error.as_deref().unwrap_or("unknown"),
                "slack chat.postMessage rejected"
            );
            return false;
        }
        true
    }

    fn is_available(&self, mode: EnvironmentMode) -> bool {
        mode == EnvironmentMode::Connected
    }

    fn max_classification(&self) -> Classification {
        self.max_classification
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// App mentions arrive as `<@U123> /status proj-1`; drop the mention tokens.
fn strip_leading_mentions(text: &str) -> String {
    let mut rest = text.trim();
    while rest.starts_with("<@") {
        let Some(end) = rest.find('>') else {
            break;
        };
        rest = rest[end + 1..].trim_start();
    }
    rest.to_string()
}

fn parse_slack_ts(raw: &str) -> Option<DateTime<Utc>> {
    let seconds = raw.split('.').next()?.parse::<i64>().ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}
