use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ThreadId);
id_newtype!(ChannelUserId);
id_newtype!(BindingId);

/// Sensitivity tier for command output and channel clearance.
///
/// Ordering matters: a channel cleared for `Internal` may carry `Public` and
/// `Internal` output but nothing above.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    #[default]
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment network posture. Adapters that need outbound internet report
/// themselves unavailable under `Isolated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentMode {
    #[default]
    Connected,
    Isolated,
}

/// Outcome of one authorization gate, kept on the envelope for audit and for
/// the rejection notice shown to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub reason: String,
}

/// Security context accumulated as the envelope moves through the chain.
/// Fields are populated by the gate that owns them and must not be read
/// before that gate has passed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub binding_id: Option<BindingId>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub role: Option<String>,
}

/// Channel-agnostic representation of one inbound command. Created fresh per
/// request, owned by the handling pipeline, discarded after the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub envelope_id: String,
    pub channel: String,
    pub channel_user_id: ChannelUserId,
    /// Display name is diagnostic only and never consulted for authorization.
    pub display_name: Option<String>,
    pub message_id: MessageId,
    pub thread_id: Option<ThreadId>,
    pub raw_text: String,
    pub command: String,
    pub args: BTreeMap<String, String>,
    pub project_id: Option<String>,
    pub security: SecurityContext,
    pub timestamp: DateTime<Utc>,
    pub signature_present: bool,
    pub from_bot: bool,
    pub gate_results: Vec<GateResult>,
}

impl CommandEnvelope {
    pub fn new(
        channel: impl Into<String>,
        channel_user_id: ChannelUserId,
        message_id: MessageId,
        parsed: ParsedCommand,
    ) -> Self {
        Self {
            envelope_id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            channel_user_id,
            display_name: None,
            message_id,
            thread_id: None,
            raw_text: parsed.raw_text,
            command: parsed.command,
            args: parsed.args,
            project_id: parsed.project_id,
            security: SecurityContext::default(),
            timestamp: Utc::now(),
            signature_present: false,
            from_bot: false,
            gate_results: Vec::new(),
        }
    }

    pub fn record_gate(&mut self, gate: &str, passed: bool, reason: impl Into<String>) {
        self.gate_results.push(GateResult {
            gate: gate.to_string(),
            passed,
            reason: reason.into(),
        });
    }

    /// Reply target: the originating thread where one exists, else the sender.
    pub fn reply_target(&self) -> &str {
        self.thread_id
            .as_deref()
            .unwrap_or_else(|| self.channel_user_id.as_str())
    }
}

/// Command text split into name, key=value arguments, and an optional bare
/// project identifier. `/status proj-42 depth=full` parses to command
/// `status`, project `proj-42`, args `{depth: full}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub raw_text: String,
    pub command: String,
    pub args: BTreeMap<String, String>,
    pub project_id: Option<String>,
}

/// Parses command text of the form `/name [project] [key=value ...]`.
/// Returns `None` for anything that is not a slash command, so ordinary
/// chatter is ignored rather than rejected.
pub fn parse_command_text(text: &str) -> Option<ParsedCommand> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    let mut tokens = rest.split_whitespace();
    let command = tokens.next()?.to_ascii_lowercase();
    if command.is_empty() {
        return None;
    }

    let mut args = BTreeMap::new();
    let mut project_id = None;
    for token in tokens {
        if let Some((key, value)) = token.split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() || value.trim().is_empty() {
                continue;
            }
            args.insert(key, value.trim().to_string());
        } else if project_id.is_none() {
            project_id = Some(token.to_string());
        }
    }

    Some(ParsedCommand {
        raw_text: trimmed.to_string(),
        command,
        args,
        project_id,
    })
}
