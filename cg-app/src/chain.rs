//! The authorization chain: eight ordered gates between a parsed envelope
//! and command execution. The chain is fail-closed; the first failing gate
//! halts it and nothing downstream runs. Every outcome, pass or fail, lands
//! in the envelope's gate-result list for audit.

use crate::audit::{AuditEvent, AuditSink};
use crate::binder::UserBinder;
use crate::config::{RolesConfig, SecurityConfig};
use crate::ratelimit::RateLimiter;
use cg_channels::{Classification, CommandEnvelope};
use cg_exec::{CommandCategory, CommandSpec};
use chrono::{Duration, Utc};
use std::sync::Arc;

pub const GATE_SIGNATURE: &str = "signature";
pub const GATE_BOT_REPLAY: &str = "bot_replay";
pub const GATE_IDENTITY: &str = "identity";
pub const GATE_AUTHENTICATION: &str = "authentication";
pub const GATE_CLASSIFICATION: &str = "classification";
pub const GATE_RBAC: &str = "rbac";
pub const GATE_RATE_LIMIT: &str = "rate_limit";
pub const GATE_DOMAIN_AUTHORITY: &str = "domain_authority";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    Approved,
    Rejected { gate: &'static str, reason: String },
}

impl ChainVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Fixed role to permission-category mapping. Unknown roles grant nothing.
fn role_categories(role: &str) -> &'static [CommandCategory] {
    match role {
        "viewer" => &[CommandCategory::Read],
        "developer" => &[CommandCategory::Read, CommandCategory::Execute],
        "operator" => &[
            CommandCategory::Read,
            CommandCategory::Execute,
            CommandCategory::Write,
        ],
        _ => &[],
    }
}

pub struct SecurityChain {
    binder: Arc<UserBinder>,
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
    roles: RolesConfig,
    replay_window: Duration,
    clock_skew: Duration,
    tenants: Vec<String>,
}

impl SecurityChain {
    pub fn new(
        binder: Arc<UserBinder>,
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditSink>,
        security: &SecurityConfig,
        roles: RolesConfig,
    ) -> Self {
        Self {
            binder,
            limiter,
            audit,
            roles,
            replay_window: Duration::seconds(security.replay_window_seconds as i64),
            clock_skew: Duration::seconds(security.clock_skew_seconds as i64),
            tenants: security.tenants.clone(),
        }
    }

    /// Runs the envelope through all eight gates in order. The returned
    /// verdict carries only the failing gate's name and reason; the detailed
    /// trail is in the envelope and the audit sink.
    #[tracing::instrument(level = "info", skip_all, fields(envelope_id = %envelope.envelope_id, command = %envelope.command))]
    pub fn run(
        &self,
        envelope: &mut CommandEnvelope,
        spec: &CommandSpec,
        channel_max: Classification,
        signature_exempt: bool,
    ) -> ChainVerdict {
        let outcome = self.gate_signature(envelope, signature_exempt);
        if let Some(verdict) = self.settle(envelope, GATE_SIGNATURE, outcome) {
            return verdict;
        }
        let outcome = self.gate_bot_replay(envelope);
        if let Some(verdict) = self.settle(envelope, GATE_BOT_REPLAY, outcome) {
            return verdict;
        }
        let outcome = self.gate_identity(envelope);
        if let Some(verdict) = self.settle(envelope, GATE_IDENTITY, outcome) {
            return verdict;
        }
        let outcome = self.gate_authentication(envelope);
        if let Some(verdict) = self.settle(envelope, GATE_AUTHENTICATION, outcome) {
            return verdict;
        }
        let outcome = self.gate_classification(spec, channel_max);
        if let Some(verdict) = self.settle(envelope, GATE_CLASSIFICATION, outcome) {
            return verdict;
        }
        let outcome = self.gate_rbac(envelope, spec);
        if let Some(verdict) = self.settle(envelope, GATE_RBAC, outcome) {
            return verdict;
        }
        let outcome = self.gate_rate_limit(envelope);
        if let Some(verdict) = self.settle(envelope, GATE_RATE_LIMIT, outcome) {
            return verdict;
        }
        let outcome = self.gate_domain_authority(envelope, spec);
        if let Some(verdict) = self.settle(envelope, GATE_DOMAIN_AUTHORITY, outcome) {
            return verdict;
        }

        tracing::debug!("authorization chain approved request");
        ChainVerdict::Approved
    }

    /// Records the gate outcome on the envelope. A failure emits the audit
    /// event and yields the rejection verdict that halts the chain.
    fn settle(
        &self,
        envelope: &mut CommandEnvelope,
        gate: &'static str,
        outcome: Result<String, String>,
    ) -> Option<ChainVerdict> {
        match outcome {
            Ok(reason) => {
                envelope.record_gate(gate, true, reason);
                None
            }
            Err(reason) => {
                envelope.record_gate(gate, false, reason.clone());
                tracing::warn!(gate, %reason, "authorization chain rejected request");
                self.audit.log_event(
                    AuditEvent::new(
                        "authorization",
                        envelope.security.user_id.clone().unwrap_or_else(|| {
                            format!("{}:{}", envelope.channel, envelope.channel_user_id)
                        }),
                        format!("rejected:{gate}"),
                        reason.clone(),
                    )
                    .with_project(envelope.project_id.as_deref()),
                );
                Some(ChainVerdict::Rejected { gate, reason })
            }
        }
    }

    fn gate_signature(
        &self,
        envelope: &CommandEnvelope,
        signature_exempt: bool,
    ) -> Result<String, String> {
        if signature_exempt {
            return Ok("channel is exempt from transport signatures".to_string());
        }
        if envelope.signature_present {
            return Ok("transport signature verified by the channel adapter".to_string());
        }
        Err("a transport signature is required but was absent".to_string())
    }

    fn gate_bot_replay(&self, envelope: &CommandEnvelope) -> Result<String, String> {
        if envelope.from_bot {
            return Err("sender is a bot account".to_string());
        }
        let now = Utc::now();
        let age = now.signed_duration_since(envelope.timestamp);
        if age > self.replay_window {
            return Err(format!(
                "message timestamp is {}s old, outside the {}s replay window",
                age.num_seconds(),
                self.replay_window.num_seconds()
            ));
        }
        if envelope.timestamp.signed_duration_since(now) > self.clock_skew {
            return Err("message timestamp is implausibly far in the future".to_string());
        }
        Ok("sender is human and the timestamp is fresh".to_string())
    }

    fn gate_identity(&self, envelope: &mut CommandEnvelope) -> Result<String, String> {
        let binding = self
            .binder
            .resolve_binding(&envelope.channel, envelope.channel_user_id.as_str())
            .map_err(|error| format!("binding lookup failed: {error}"))?;
        let Some(binding) = binding else {
            return Err("no active binding for this channel identity".to_string());
        };
        if binding.user_id.trim().is_empty() {
            return Err("binding has no internal user attached".to_string());
        }
        envelope.security.binding_id = Some(binding.id.clone().into());
        envelope.security.user_id = Some(binding.user_id.clone());
        envelope.security.tenant_id = binding.tenant_id.clone();
        Ok(format!("resolved binding {}", binding.id))
    }

    fn gate_authentication(&self, envelope: &CommandEnvelope) -> Result<String, String> {
        let Some(user_id) = envelope.security.user_id.as_deref() else {
            return Err("no resolved internal user".to_string());
        };
        if self.tenants.is_empty() {
            return Ok(format!("user {user_id} accepted (single-tenant deployment)"));
        }
        match envelope.security.tenant_id.as_deref() {
            Some(tenant) if self.tenants.iter().any(|t| t == tenant) => {
                Ok(format!("user {user_id} accepted in active tenant {tenant}"))
            }
            Some(tenant) => Err(format!("tenant {tenant} is not active")),
            None => Err("binding carries no tenant in a multi-tenant deployment".to_string()),
        }
    }

    fn gate_classification(
        &self,
        spec: &CommandSpec,
        channel_max: Classification,
    ) -> Result<String, String> {
        if spec.max_classification > channel_max {
            return Err(format!(
                "command output may reach {} but the channel is cleared only for {}",
                spec.max_classification, channel_max
            ));
        }
        Ok(format!(
            "command ceiling {} fits channel clearance {}",
            spec.max_classification, channel_max
        ))
    }

    fn gate_rbac(
        &self,
        envelope: &mut CommandEnvelope,
        spec: &CommandSpec,
    ) -> Result<String, String> {
        if !spec.allowed_on_channel(&envelope.channel) {
            return Err(format!(
                "command {} is not permitted on channel {}",
                spec.name, envelope.channel
            ));
        }
        let Some(user_id) = envelope.security.user_id.as_deref() else {
            return Err("no resolved internal user".to_string());
        };
        let role = self
            .roles
            .assignments
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.roles.default.clone());
        let categories = role_categories(&role);
        if categories.is_empty() {
            return Err(format!("role {role} grants no command categories"));
        }
        if !categories.contains(&spec.category) {
            return Err(format!(
                "role {role} may not invoke {}-category commands",
                spec.category.as_str()
            ));
        }
        envelope.security.role = Some(role.clone());
        Ok(format!(
            "role {role} grants {} commands",
            spec.category.as_str()
        ))
    }

    fn gate_rate_limit(&self, envelope: &CommandEnvelope) -> Result<String, String> {
        let Some(user_id) = envelope.security.user_id.as_deref() else {
            return Err("no resolved internal user".to_string());
        };
        let decision = self.limiter.check_and_record(user_id, &envelope.channel);
        if decision.is_allowed() {
            Ok("within rate limits".to_string())
        } else {
            Err(decision.reason())
        }
    }

    /// Observational only today: sensitive-domain commands are annotated in
    /// the audit trail but never blocked here. This gate stays last so any
    /// future veto logic sees a fully populated envelope.
    fn gate_domain_authority(
        &self,
        envelope: &CommandEnvelope,
        spec: &CommandSpec,
    ) -> Result<String, String> {
        let Some(domain) = spec.sensitive_domain.as_deref() else {
            return Ok("command touches no sensitive domain".to_string());
        };
        self.audit.log_event(
            AuditEvent::new(
                "domain_authority",
                envelope
                    .security
                    .user_id
                    .clone()
                    .unwrap_or_else(|| envelope.channel_user_id.to_string()),
                "observed",
                format!("command {} touches sensitive domain {domain}", spec.name),
            )
            .with_project(envelope.project_id.as_deref()),
        );
        Ok(format!("sensitive domain {domain} recorded for audit"))
    }
}
