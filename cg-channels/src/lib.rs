//! Channel adapters for the cmdgate remote command gateway.
//!
//! Adapters are pure transport: they verify a provider signature, normalize a
//! channel payload into a `CommandEnvelope`, and push replies back out. All
//! authorization happens downstream in the security chain.

mod internal;
mod mattermost;
mod signature;
mod slack;
mod traits;
mod types;

pub use internal::{InternalChatAdapter, InternalReply};
pub use mattermost::MattermostAdapter;
pub use signature::{constant_time_eq, hmac_sha256_hex};
pub use slack::SlackGatewayAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    BindingId, ChannelUserId, Classification, CommandEnvelope, EnvironmentMode, GateResult,
    MessageId, ParsedCommand, SecurityContext, ThreadId, parse_command_text,
};
