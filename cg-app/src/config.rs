//! cmdgate configuration loader.
//!
//! TOML on disk, environment overrides for secrets, one `validate()` pass at
//! startup. A request always sees the snapshot loaded at process start.

use cg_channels::{Classification, EnvironmentMode};
use cg_exec::CommandSpec;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default)]
    pub environment_mode: EnvironmentMode,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_instance_name() -> String {
    "cmdgate".to_string()
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8460))
}

fn default_http_timeout_seconds() -> u64 {
    150
}

fn default_http_max_in_flight() -> usize {
    64
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            environment_mode: EnvironmentMode::default(),
            bind_addr: default_bind_addr(),
            data_dir: None,
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_replay_window_seconds")]
    pub replay_window_seconds: u64,
    #[serde(default = "default_clock_skew_seconds")]
    pub clock_skew_seconds: u64,
    #[serde(default = "default_rate_user_ceiling")]
    pub rate_user_ceiling: usize,
    #[serde(default = "default_rate_channel_ceiling")]
    pub rate_channel_ceiling: usize,
    #[serde(default = "default_rate_window_seconds")]
    pub rate_window_seconds: u64,
    #[serde(default = "default_challenge_ttl_minutes")]
    pub challenge_ttl_minutes: i64,
    /// Active tenants. Empty means a single-tenant deployment where binding
    /// existence alone satisfies the authentication gate.
    #[serde(default)]
    pub tenants: Vec<String>,
}

fn default_replay_window_seconds() -> u64 {
    300
}

fn default_clock_skew_seconds() -> u64 {
    90
}

fn default_rate_user_ceiling() -> usize {
    10
}

fn default_rate_channel_ceiling() -> usize {
    60
}

fn default_rate_window_seconds() -> u64 {
    60
}

fn default_challenge_ttl_minutes() -> i64 {
    15
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            replay_window_seconds: default_replay_window_seconds(),
            clock_skew_seconds: default_clock_skew_seconds(),
            rate_user_ceiling: default_rate_user_ceiling(),
            rate_channel_ceiling: default_rate_channel_ceiling(),
            rate_window_seconds: default_rate_window_seconds(),
            challenge_ttl_minutes: default_challenge_ttl_minutes(),
            tenants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolesConfig {
    #[serde(default = "default_role")]
    pub default: String,
    /// Internal user id to role name. Role provisioning itself is an
    /// external concern; this table is a deployment snapshot of it.
    #[serde(default)]
    pub assignments: BTreeMap<String, String>,
}

fn default_role() -> String {
    "viewer".to_string()
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            default: default_role(),
            assignments: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub internal: InternalChannelConfig,
    #[serde(default)]
    pub slack: SlackChannelConfig,
    #[serde(default)]
    pub mattermost: MattermostChannelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InternalChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_internal_webhook_path")]
    pub webhook_path: String,
    #[serde(default = "default_internal_max_classification")]
    pub max_classification: Classification,
}

fn default_true() -> bool {
    true
}

fn default_internal_webhook_path() -> String {
    "/internal-webhook".to_string()
}

fn default_internal_max_classification() -> Classification {
    Classification::Restricted
}

impl Default for InternalChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_path: default_internal_webhook_path(),
            max_classification: default_internal_max_classification(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_slack_webhook_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub signing_secret: String,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub max_classification: Classification,
}

fn default_slack_webhook_path() -> String {
    "/slack-webhook".to_string()
}

impl Default for SlackChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_path: default_slack_webhook_path(),
            signing_secret: String::new(),
            bot_token: String::new(),
            max_classification: Classification::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MattermostChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mattermost_webhook_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub outgoing_token: String,
    #[serde(default)]
    pub reply_url: String,
    #[serde(default)]
    pub max_classification: Classification,
}

fn default_mattermost_webhook_path() -> String {
    "/mattermost-webhook".to_string()
}

impl Default for MattermostChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_path: default_mattermost_webhook_path(),
            outgoing_token: String::new(),
            reply_url: String::new(),
            max_classification: Classification::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,
}

fn default_execution_timeout_seconds() -> u64 {
    120
}

fn default_env_allowlist() -> Vec<String> {
    vec!["PATH".to_string(), "LANG".to_string(), "LC_ALL".to_string()]
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_execution_timeout_seconds(),
            env_allowlist: default_env_allowlist(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default = "default_full_access_url")]
    pub full_access_url: String,
    #[serde(default = "default_markers")]
    pub markers: Vec<MarkerRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkerRuleConfig {
    pub classification: Classification,
    pub patterns: Vec<String>,
}

fn default_max_reply_chars() -> usize {
    3500
}

fn default_full_access_url() -> String {
    "https://console.internal/audit".to_string()
}

fn default_markers() -> Vec<MarkerRuleConfig> {
    vec![
        MarkerRuleConfig {
            classification: Classification::Restricted,
            patterns: vec!["RESTRICTED//".to_string(), "SECRET//".to_string()],
        },
        MarkerRuleConfig {
            classification: Classification::Confidential,
            patterns: vec!["CONFIDENTIAL//".to_string(), "CUI//".to_string()],
        },
        MarkerRuleConfig {
            classification: Classification::Internal,
            patterns: vec![
                "INTERNAL//".to_string(),
                "INTERNAL USE ONLY".to_string(),
            ],
        },
    ]
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_reply_chars: default_max_reply_chars(),
            full_access_url: default_full_access_url(),
            markers: default_markers(),
        }
    }
}

impl GatewayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: GatewayConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CMDGATE_ENVIRONMENT_MODE") {
            match v.trim().to_ascii_lowercase().as_str() {
                "connected" => self.general.environment_mode = EnvironmentMode::Connected,
                "isolated" => self.general.environment_mode = EnvironmentMode::Isolated,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("CMDGATE_SLACK_SIGNING_SECRET") {
            if !v.trim().is_empty() {
                self.channels.slack.signing_secret = v;
            }
        }
        if let Ok(v) = std::env::var("CMDGATE_SLACK_BOT_TOKEN") {
            if !v.trim().is_empty() {
                self.channels.slack.bot_token = v;
            }
        }
        if let Ok(v) = std::env::var("CMDGATE_MATTERMOST_TOKEN") {
            if !v.trim().is_empty() {
                self.channels.mattermost.outgoing_token = v;
            }
        }
        if let Ok(v) = std::env::var("CMDGATE_MATTERMOST_REPLY_URL") {
            if !v.trim().is_empty() {
                self.channels.mattermost.reply_url = v;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.instance_name.trim().is_empty() {
            return Err(anyhow::anyhow!("general.instance_name is required"));
        }
        if self.general.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("general.http_timeout_seconds must be > 0"));
        }
        if self.security.replay_window_seconds == 0 {
            return Err(anyhow::anyhow!("security.replay_window_seconds must be > 0"));
        }
        if self.security.rate_user_ceiling == 0 || self.security.rate_channel_ceiling == 0 {
            return Err(anyhow::anyhow!("security rate ceilings must be > 0"));
        }
        if self.security.rate_window_seconds == 0 {
            return Err(anyhow::anyhow!("security.rate_window_seconds must be > 0"));
        }
        if self.security.challenge_ttl_minutes <= 0 {
            return Err(anyhow::anyhow!("security.challenge_ttl_minutes must be > 0"));
        }
        if self.execution.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("execution.timeout_seconds must be > 0"));
        }
        if self.channels.slack.enabled {
            if self.channels.slack.signing_secret.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "channels.slack.signing_secret is required when slack is enabled"
                ));
            }
            if self.channels.slack.bot_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "channels.slack.bot_token is required when slack is enabled"
                ));
            }
        }
        if self.channels.mattermost.enabled
            && self.channels.mattermost.outgoing_token.trim().is_empty()
        {
            return Err(anyhow::anyhow!(
                "channels.mattermost.outgoing_token is required when mattermost is enabled"
            ));
        }

        let mut paths = HashSet::new();
        for (enabled, path) in [
            (
                self.channels.internal.enabled,
                self.channels.internal.webhook_path.as_str(),
            ),
            (
                self.channels.slack.enabled,
                self.channels.slack.webhook_path.as_str(),
            ),
            (
                self.channels.mattermost.enabled,
                self.channels.mattermost.webhook_path.as_str(),
            ),
        ] {
            if !enabled {
                continue;
            }
            if !path.starts_with('/') {
                return Err(anyhow::anyhow!("webhook path {path:?} must start with '/'"));
            }
            if !paths.insert(path.to_string()) {
                return Err(anyhow::anyhow!("webhook path {path:?} is used twice"));
            }
        }

        if self.commands.is_empty() {
            return Err(anyhow::anyhow!("at least one [[commands]] entry is required"));
        }
        let mut names = HashSet::new();
        for command in &self.commands {
            if command.name.trim().is_empty() || command.program.trim().is_empty() {
                return Err(anyhow::anyhow!("command entries need a name and a program"));
            }
            if !names.insert(command.name.to_ascii_lowercase()) {
                return Err(anyhow::anyhow!(
                    "command {:?} is declared more than once",
                    command.name
                ));
            }
        }
        Ok(())
    }

    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        match self.general.data_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => Ok(default_data_dir()),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".cmdgate").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".cmdgate").join("data")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::GatewayConfig;
    use cg_channels::Classification;

    fn minimal_toml() -> &'static str {
        r#"
            [[commands]]
            name = "platform-status"
            program = "/opt/platform/bin/status"
            category = "read"
            max_classification = "internal"
        "#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: GatewayConfig = toml::from_str(minimal_toml()).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.general.instance_name, "cmdgate");
        assert!(cfg.channels.internal.enabled);
        assert!(!cfg.channels.slack.enabled);
        assert_eq!(cfg.security.replay_window_seconds, 300);
        assert_eq!(cfg.commands.len(), 1);
        assert_eq!(
            cfg.commands[0].max_classification,
            Classification::Internal
        );
        assert!(!cfg.filter.markers.is_empty());
    }

    #[test]
    fn validate_rejects_enabled_slack_without_secrets() {
        let raw = format!(
            "{}\n[channels.slack]\nenabled = true\n",
            minimal_toml()
        );
        let cfg: GatewayConfig = toml::from_str(&raw).expect("parse");
        let err = cfg.validate().expect_err("missing secrets must fail");
        assert!(err.to_string().contains("signing_secret"));
    }

    #[test]
    fn validate_rejects_duplicate_webhook_paths() {
        let raw = format!(
            r#"{}
            [channels.internal]
            webhook_path = "/hook"
            [channels.mattermost]
            enabled = true
            outgoing_token = "t"
            webhook_path = "/hook"
            "#,
            minimal_toml()
        );
        let cfg: GatewayConfig = toml::from_str(&raw).expect("parse");
        let err = cfg.validate().expect_err("duplicate path must fail");
        assert!(err.to_string().contains("used twice"));
    }

    #[test]
    fn validate_rejects_duplicate_command_names() {
        let raw = format!("{}{}", minimal_toml(), minimal_toml());
        let cfg: GatewayConfig = toml::from_str(&raw).expect("parse");
        let err = cfg.validate().expect_err("duplicate command must fail");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn validate_rejects_empty_allowlist() {
        let cfg: GatewayConfig = toml::from_str("").expect("parse");
        let err = cfg.validate().expect_err("empty allowlist must fail");
        assert!(err.to_string().contains("commands"));
    }

    #[tokio::test]
    async fn load_with_path_reads_and_validates_a_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml()).expect("write config");

        let (cfg, loaded_path) = GatewayConfig::load_with_path(Some(path.clone()))
            .await
            .expect("load");
        assert_eq!(loaded_path, path);
        assert_eq!(cfg.commands.len(), 1);

        let err = GatewayConfig::load(Some(dir.path().join("missing.toml")))
            .await
            .expect_err("missing file must fail");
        assert!(err.to_string().contains("read config"));
    }

    #[test]
    fn command_arg_specs_parse_from_toml() {
        let raw = r#"
            [[commands]]
            name = "compliance-report"
            program = "/opt/platform/bin/compliance-report"
            category = "read"
            max_classification = "confidential"
            channels = ["internal"]
            sensitive_domain = "compliance"
            args = [
                { kind = "flag", value = "--summary" },
                { kind = "project", required = true },
                { kind = "arg", key = "framework", flag = "--framework" },
            ]
        "#;
        let cfg: GatewayConfig = toml::from_str(raw).expect("parse");
        cfg.validate().expect("valid");
        let spec = &cfg.commands[0];
        assert_eq!(spec.args.len(), 3);
        assert_eq!(spec.sensitive_domain.as_deref(), Some("compliance"));
        assert!(spec.allowed_on_channel("internal"));
        assert!(!spec.allowed_on_channel("slack"));
    }
}
