use crate::types::{Classification, CommandEnvelope, EnvironmentMode};
use async_trait::async_trait;
use axum::http::HeaderMap;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "internal", "slack", "mattermost".
    fn channel_name(&self) -> &str;

    /// Webhook path this adapter is mounted on.
    fn webhook_path(&self) -> &str;

    /// True for same-process channels that carry no transport signature.
    fn signature_exempt(&self) -> bool {
        false
    }

    /// Verifies the provider's transport signature over the raw body.
    /// Implementations must use constant-time comparison for secret material
    /// and return false (never panic) on malformed input.
    fn verify_signature(&self, raw_body: &[u8], headers: &HeaderMap) -> bool;

    /// Normalizes a channel payload into an envelope. `None` means the
    /// payload is not a recognizable command (handshake pings, bot echoes,
    /// ordinary chatter) and is silently ignored.
    fn parse(&self, raw_body: &[u8], headers: &HeaderMap) -> Option<CommandEnvelope>;

    /// Best-effort reply delivery. Failures are logged by the implementation
    /// and surface only as `false`.
    async fn send_message(&self, target_id: &str, text: &str, thread_id: Option<&str>) -> bool;

    /// Whether this adapter can operate under the given deployment mode.
    /// Adapters that need outbound internet must report false for
    /// `Isolated` deployments.
    fn is_available(&self, mode: EnvironmentMode) -> bool;

    /// Maximum classification this channel is cleared to carry.
    fn max_classification(&self) -> Classification;
}
