use crate::error::{ExecError, Result};
use cg_channels::Classification;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Permission category of an allowlisted command. Roles are granted a fixed
/// set of categories; a read-only role can never reach a write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandCategory {
    Read,
    Execute,
    Write,
}

impl CommandCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Execute => "execute",
            Self::Write => "write",
        }
    }
}

/// One element of a command's argument vector. Typed so required fields are
/// validated before the child process is built; nothing is ever interpolated
/// into a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgSpec {
    /// Fixed literal passed as-is.
    Flag { value: String },
    /// The envelope's target-project identifier, optionally behind a flag.
    Project {
        #[serde(default)]
        required: bool,
        #[serde(default)]
        flag: Option<String>,
    },
    /// A named key from the envelope's parsed argument map.
    Arg {
        key: String,
        #[serde(default)]
        required: bool,
        #[serde(default)]
        flag: Option<String>,
    },
}

/// Static allowlist entry: which program backs a command and under what
/// constraints it may be invoked. Loaded from deployment configuration and
/// never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub program: String,
    pub category: CommandCategory,
    #[serde(default)]
    pub max_classification: Classification,
    /// Channels permitted to invoke this command; empty means all.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Sensitive-domain tag (security scanning, compliance, deployment)
    /// surfaced in the audit trail by the final chain gate.
    #[serde(default)]
    pub sensitive_domain: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
}

impl CommandSpec {
    pub fn allowed_on_channel(&self, channel: &str) -> bool {
        self.channels.is_empty()
            || self
                .channels
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(channel))
    }

    /// Builds the child-process argument vector from the envelope's parsed
    /// fields, rejecting the request when a required field is absent.
    pub fn build_args(
        &self,
        project_id: Option<&str>,
        args: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let mut argv = Vec::with_capacity(self.args.len() * 2);
        for spec in &self.args {
            match spec {
                ArgSpec::Flag { value } => argv.push(value.clone()),
                ArgSpec::Project { required, flag } => match project_id {
                    Some(project) if !project.trim().is_empty() => {
                        if let Some(flag) = flag {
                            argv.push(flag.clone());
                        }
                        argv.push(project.trim().to_string());
                    }
                    _ if *required => {
                        return Err(ExecError::InvalidArguments(format!(
                            "command {} requires a project id",
                            self.name
                        )));
                    }
                    _ => {}
                },
                ArgSpec::Arg {
                    key,
                    required,
                    flag,
                } => match args.get(key).map(String::as_str) {
                    Some(value) if !value.trim().is_empty() => {
                        if let Some(flag) = flag {
                            argv.push(flag.clone());
                        }
                        argv.push(value.trim().to_string());
                    }
                    _ if *required => {
                        return Err(ExecError::InvalidArguments(format!(
                            "command {} requires {}=<value>",
                            self.name, key
                        )));
                    }
                    _ => {}
                },
            }
        }
        Ok(argv)
    }
}

/// The per-deployment command allowlist.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    entries: Vec<CommandSpec>,
}

impl CommandCatalog {
    pub fn new(entries: Vec<CommandSpec>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, command: &str) -> Option<&CommandSpec> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(command))
    }

    /// Pre-chain allowlist check: is this command known and permitted on the
    /// requesting channel?
    pub fn is_command_allowed(&self, command: &str, channel: &str) -> (bool, Option<&CommandSpec>) {
        match self.lookup(command) {
            Some(entry) if entry.allowed_on_channel(channel) => (true, Some(entry)),
            Some(entry) => (false, Some(entry)),
            None => (false, None),
        }
    }

    pub fn entries(&self) -> &[CommandSpec] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
