//! The webhook pipeline: adapter verify and parse, the in-channel link
//! shortcut, the allowlist check, the security chain, execution, filtering,
//! and the best-effort reply. One envelope per request, nothing shared.

use crate::audit::{AuditEvent, AuditSink};
use crate::binder::UserBinder;
use crate::chain::{ChainVerdict, SecurityChain};
use crate::filter::ResponseFilter;
use crate::store::{ExecutionRecord, GatewayStore};
use axum::http::HeaderMap;
use cg_channels::{ChannelAdapter, CommandEnvelope};
use cg_exec::{CommandCatalog, CommandRunner, CommandSpec};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// The in-channel bind-request command. It short-circuits straight to the
/// user binder; verification happens out of band via the bind endpoint.
const BIND_COMMAND: &str = "link";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookOutcome {
    /// Hard transport-signature failure: the only case that surfaces as 401.
    pub unauthorized: bool,
    pub status: &'static str,
    pub envelope_id: Option<String>,
}

impl WebhookOutcome {
    fn status_only(status: &'static str) -> Self {
        Self {
            unauthorized: false,
            status,
            envelope_id: None,
        }
    }

    fn for_envelope(status: &'static str, envelope: &CommandEnvelope) -> Self {
        Self {
            unauthorized: false,
            status,
            envelope_id: Some(envelope.envelope_id.clone()),
        }
    }
}

pub struct CommandGateway {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    catalog: CommandCatalog,
    chain: SecurityChain,
    runner: CommandRunner,
    filter: ResponseFilter,
    binder: Arc<UserBinder>,
    store: Arc<GatewayStore>,
    audit: Arc<dyn AuditSink>,
    challenge_ttl_minutes: i64,
}

impl CommandGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
        catalog: CommandCatalog,
        chain: SecurityChain,
        runner: CommandRunner,
        filter: ResponseFilter,
        binder: Arc<UserBinder>,
        store: Arc<GatewayStore>,
        audit: Arc<dyn AuditSink>,
        challenge_ttl_minutes: i64,
    ) -> Self {
        Self {
            adapters,
            catalog,
            chain,
            runner,
            filter,
            binder,
            store,
            audit,
            challenge_ttl_minutes,
        }
    }

    pub fn adapters(&self) -> &HashMap<String, Arc<dyn ChannelAdapter>> {
        &self.adapters
    }

    pub fn binder(&self) -> &Arc<UserBinder> {
        &self.binder
    }

    #[tracing::instrument(level = "info", skip_all, fields(channel = %channel))]
    pub async fn handle_webhook(
        &self,
        channel: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> WebhookOutcome {
        let Some(adapter) = self.adapters.get(channel).cloned() else {
            tracing::warn!("webhook received for unloaded channel");
            return WebhookOutcome::status_only("failed");
        };

        if !adapter.signature_exempt() && !adapter.verify_signature(body, headers) {
            tracing::warn!("transport signature verification failed");
            self.audit.log_event(AuditEvent::new(
                "transport",
                channel,
                "signature_rejected",
                "webhook body failed transport signature verification",
            ));
            return WebhookOutcome {
                unauthorized: true,
                status: "rejected",
                envelope_id: None,
            };
        }

        let Some(mut envelope) = adapter.parse(body, headers) else {
            return WebhookOutcome::status_only("ignored");
        };
        tracing::info!(
            envelope_id = %envelope.envelope_id,
            command = %envelope.command,
            "command envelope accepted"
        );

        if envelope.command == BIND_COMMAND {
            return self.handle_bind_request(adapter.as_ref(), &envelope).await;
        }

        let (allowed, entry) = self
            .catalog
            .is_command_allowed(&envelope.command, &envelope.channel);
        let spec = match (allowed, entry) {
            (true, Some(spec)) => spec.clone(),
            (false, Some(_)) => {
                self.reply(
                    adapter.as_ref(),
                    &envelope,
                    &format!(
                        "The {} command is not available on this channel.",
                        envelope.command
                    ),
                )
                .await;
                return WebhookOutcome::for_envelope("rejected", &envelope);
            }
            (_, None) => {
                self.reply(
                    adapter.as_ref(),
                    &envelope,
                    &format!("Unknown or disabled command: {}", envelope.command),
                )
                .await;
                return WebhookOutcome::for_envelope("rejected", &envelope);
            }
        };
        if spec.requires_confirmation {
            self.reply(
                adapter.as_ref(),
                &envelope,
                &format!(
                    "The {} command needs interactive confirmation and can only be run from the operator console.",
                    spec.name
                ),
            )
            .await;
            return WebhookOutcome::for_envelope("rejected", &envelope);
        }

        let verdict = self.chain.run(
            &mut envelope,
            &spec,
            adapter.max_classification(),
            adapter.signature_exempt(),
        );
        if let ChainVerdict::Rejected { gate, .. } = verdict {
            // The requester only learns which gate category declined them;
            // the detailed reason stays in the audit trail.
            self.reply(
                adapter.as_ref(),
                &envelope,
                &format!("Request declined ({gate})."),
            )
            .await;
            return WebhookOutcome::for_envelope("rejected", &envelope);
        }

        self.execute_and_reply(adapter.as_ref(), &mut envelope, &spec)
            .await
    }

    async fn handle_bind_request(
        &self,
        adapter: &dyn ChannelAdapter,
        envelope: &CommandEnvelope,
    ) -> WebhookOutcome {
        match self.binder.create_challenge(
            &envelope.channel,
            envelope.channel_user_id.as_str(),
            self.challenge_ttl_minutes,
        ) {
            Ok(challenge) => {
                self.audit.log_event(AuditEvent::new(
                    "binding",
                    format!("{}:{}", envelope.channel, envelope.channel_user_id),
                    "challenge_issued",
                    format!("expires at {}", challenge.expires_at.to_rfc3339()),
                ));
                self.reply(
                    adapter,
                    envelope,
                    &format!(
                        "Link code: {} (valid for {} minutes). Ask a platform administrator to verify it against your account.",
                        challenge.code, self.challenge_ttl_minutes
                    ),
                )
                .await;
                WebhookOutcome::for_envelope("accepted", envelope)
            }
            Err(error) => {
                tracing::warn!(%error, "challenge creation failed");
                self.reply(adapter, envelope, "Could not start account linking.")
                    .await;
                WebhookOutcome::for_envelope("failed", envelope)
            }
        }
    }

    async fn execute_and_reply(
        &self,
        adapter: &dyn ChannelAdapter,
        envelope: &mut CommandEnvelope,
        spec: &CommandSpec,
    ) -> WebhookOutcome {
        let mut result = self
            .runner
            .execute(spec, envelope.project_id.as_deref(), &envelope.args)
            .await;

        let (body, was_filtered, detected) = self.filter.filter(
            &result.output,
            adapter.max_classification(),
            &envelope.envelope_id,
            self.audit.as_ref(),
        );
        result.detected_classification = Some(detected);
        result.filtered = was_filtered;

        let record = ExecutionRecord {
            audit_id: result.audit_id.clone(),
            envelope_id: envelope.envelope_id.clone(),
            channel: envelope.channel.clone(),
            user_id: envelope
                .security
                .user_id
                .clone()
                .unwrap_or_else(|| envelope.channel_user_id.to_string()),
            command: spec.name.clone(),
            success: result.success,
            classification: Some(detected.as_str().to_string()),
            filtered: was_filtered,
            elapsed_ms: result.elapsed_ms,
        };
        if let Err(error) = self.store.record_execution(&record, Utc::now()) {
            tracing::warn!(%error, audit_id = %result.audit_id, "command log write failed");
        }
        self.audit.log_event(
            AuditEvent::new(
                "execution",
                record.user_id.clone(),
                if result.success { "completed" } else { "failed" },
                format!(
                    "command {} finished in {}ms (filtered: {was_filtered})",
                    spec.name, result.elapsed_ms
                ),
            )
            .with_project(envelope.project_id.as_deref()),
        );

        let reply = self.filter.format(
            &self.filter.truncate(&body),
            &spec.name,
            result.elapsed_ms,
            &result.audit_id,
            true,
            true,
        );
        self.reply(adapter, envelope, &reply).await;

        if result.success {
            WebhookOutcome::for_envelope("completed", envelope)
        } else {
            WebhookOutcome::for_envelope("failed", envelope)
        }
    }

    async fn reply(&self, adapter: &dyn ChannelAdapter, envelope: &CommandEnvelope, text: &str) {
        let delivered = adapter
            .send_message(
                envelope.reply_target(),
                text,
                Some(envelope.message_id.as_str()),
            )
            .await;
        if !delivered {
            tracing::warn!(
                envelope_id = %envelope.envelope_id,
                channel = %envelope.channel,
                "reply delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandGateway, WebhookOutcome};
    use crate::audit::{AuditSink, MemoryAuditSink};
    use crate::binder::UserBinder;
    use crate::chain::SecurityChain;
    use crate::config::{FilterConfig, RolesConfig, SecurityConfig};
    use crate::filter::ResponseFilter;
    use crate::ratelimit::RateLimiter;
    use crate::store::GatewayStore;
    use axum::http::HeaderMap;
    use cg_channels::{ChannelAdapter, Classification, InternalChatAdapter};
    use cg_exec::{ArgSpec, CommandCatalog, CommandCategory, CommandRunner, CommandSpec};
    use chrono::{Duration, Utc};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    struct Fixture {
        gateway: CommandGateway,
        adapter: Arc<InternalChatAdapter>,
        binder: Arc<UserBinder>,
        audit: Arc<MemoryAuditSink>,
        store: Arc<GatewayStore>,
    }

    fn fixture(channel_max: Classification, commands: Vec<CommandSpec>) -> Fixture {
        let adapter = Arc::new(InternalChatAdapter::new("/internal-webhook", channel_max));
        let store = Arc::new(GatewayStore::open_in_memory().expect("store"));
        let binder = Arc::new(UserBinder::new(store.clone()));
        let audit = Arc::new(MemoryAuditSink::default());
        let mut roles = RolesConfig::default();
        roles
            .assignments
            .insert("user-1".to_string(), "developer".to_string());
        let chain = SecurityChain::new(
            binder.clone(),
            Arc::new(RateLimiter::new(10, 100, StdDuration::from_secs(60))),
            audit.clone() as Arc<dyn AuditSink>,
            &SecurityConfig::default(),
            roles,
        );
        let mut adapters: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        adapters.insert("internal".to_string(), adapter.clone());
        let gateway = CommandGateway::new(
            adapters,
            CommandCatalog::new(commands),
            chain,
            CommandRunner::new(StdDuration::from_secs(10), vec!["PATH".to_string()]),
            ResponseFilter::new(&FilterConfig::default()),
            binder.clone(),
            store.clone(),
            audit.clone() as Arc<dyn AuditSink>,
            15,
        );
        Fixture {
            gateway,
            adapter,
            binder,
            audit,
            store,
        }
    }

    fn echo_spec(prefix: &str) -> CommandSpec {
        CommandSpec {
            name: "platform-status".to_string(),
            program: "/bin/echo".to_string(),
            category: CommandCategory::Read,
            max_classification: Classification::Internal,
            channels: Vec::new(),
            requires_confirmation: false,
            sensitive_domain: None,
            args: vec![
                ArgSpec::Flag {
                    value: prefix.to_string(),
                },
                ArgSpec::Project {
                    required: false,
                    flag: None,
                },
            ],
        }
    }

    fn payload(text: &str) -> Vec<u8> {
        serde_json::json!({
            "user_id": "u-1",
            "thread_id": "th-1",
            "text": text,
        })
        .to_string()
        .into_bytes()
    }

    async fn post(fixture: &Fixture, text: &str) -> WebhookOutcome {
        fixture
            .gateway
            .handle_webhook("internal", &HeaderMap::new(), &payload(text))
            .await
    }

    #[tokio::test]
    async fn happy_path_executes_and_replies_with_footer() {
        let fixture = fixture(Classification::Restricted, vec![echo_spec("status for")]);
        fixture
            .binder
            .provision_binding("internal", "u-1", "user-1", None)
            .expect("provision");

        let outcome = post(&fixture, "/platform-status proj-42").await;
        assert_eq!(outcome.status, "completed");
        assert!(!outcome.unauthorized);

        let replies = fixture.adapter.take_replies("th-1");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].text.contains("status for proj-42"));
        assert!(replies[0].text.contains("platform-status"));
        assert!(replies[0].text.contains("audit "));
        assert_eq!(fixture.store.execution_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn unbound_user_gets_generic_notice_and_detailed_audit() {
        let fixture = fixture(Classification::Restricted, vec![echo_spec("ok")]);

        let outcome = post(&fixture, "/platform-status proj-42").await;
        assert_eq!(outcome.status, "rejected");

        let replies = fixture.adapter.take_replies("th-1");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "Request declined (identity).");
        assert!(!replies[0].text.contains("binding"));
        let events = fixture.audit.events();
        assert!(
            events
                .iter()
                .any(|event| event.action == "rejected:identity"
                    && event.details.contains("no active binding"))
        );
    }

    #[tokio::test]
    async fn over_classified_output_is_withheld_from_the_channel() {
        let fixture = fixture(
            Classification::Internal,
            vec![echo_spec("RESTRICTED// scanner findings:")],
        );
        fixture
            .binder
            .provision_binding("internal", "u-1", "user-1", None)
            .expect("provision");

        let outcome = post(&fixture, "/platform-status proj-42").await;
        assert_eq!(outcome.status, "completed");

        let replies = fixture.adapter.take_replies("th-1");
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].text.contains("RESTRICTED//"));
        assert!(!replies[0].text.contains("scanner findings"));
        assert!(replies[0].text.contains("exceeds this channel's clearance"));
        assert!(
            fixture
                .audit
                .events()
                .iter()
                .any(|event| event.event_type == "redaction")
        );
    }

    #[tokio::test]
    async fn replayed_payload_is_rejected_by_the_chain() {
        let fixture = fixture(Classification::Restricted, vec![echo_spec("ok")]);
        fixture
            .binder
            .provision_binding("internal", "u-1", "user-1", None)
            .expect("provision");

        let stale = (Utc::now() - Duration::seconds(900)).to_rfc3339();
        let body = serde_json::json!({
            "user_id": "u-1",
            "thread_id": "th-1",
            "text": "/platform-status proj-42",
            "sent_at": stale,
        })
        .to_string()
        .into_bytes();
        let outcome = fixture
            .gateway
            .handle_webhook("internal", &HeaderMap::new(), &body)
            .await;
        assert_eq!(outcome.status, "rejected");
        let replies = fixture.adapter.take_replies("th-1");
        assert_eq!(replies[0].text, "Request declined (bot_replay).");
    }

    #[tokio::test]
    async fn non_command_chatter_is_ignored() {
        let fixture = fixture(Classification::Restricted, vec![echo_spec("ok")]);
        let outcome = post(&fixture, "shipping the release today").await;
        assert_eq!(outcome.status, "ignored");
        assert!(fixture.adapter.take_replies("th-1").is_empty());
    }

    #[tokio::test]
    async fn unknown_command_gets_friendly_rejection_before_the_chain() {
        let fixture = fixture(Classification::Restricted, vec![echo_spec("ok")]);
        let outcome = post(&fixture, "/not-a-command").await;
        assert_eq!(outcome.status, "rejected");
        let replies = fixture.adapter.take_replies("th-1");
        assert!(replies[0].text.contains("Unknown or disabled command"));
        // The chain never ran, so no authorization audit events exist.
        assert!(
            fixture
                .audit
                .events()
                .iter()
                .all(|event| event.event_type != "authorization")
        );
    }

    #[tokio::test]
    async fn confirmation_required_commands_are_deferred_to_the_console() {
        let mut spec = echo_spec("ok");
        spec.requires_confirmation = true;
        let fixture = fixture(Classification::Restricted, vec![spec]);
        let outcome = post(&fixture, "/platform-status proj-1").await;
        assert_eq!(outcome.status, "rejected");
        let replies = fixture.adapter.take_replies("th-1");
        assert!(replies[0].text.contains("operator console"));
    }

    #[tokio::test]
    async fn link_command_issues_a_challenge_code() {
        let fixture = fixture(Classification::Restricted, vec![echo_spec("ok")]);
        let outcome = post(&fixture, "/link").await;
        assert_eq!(outcome.status, "accepted");

        let replies = fixture.adapter.take_replies("th-1");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].text.contains("Link code: "));
        assert_eq!(fixture.binder.pending_challenges(), 1);

        let code = replies[0]
            .text
            .split("Link code: ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .expect("code in reply");
        let binding_id = fixture
            .binder
            .verify_challenge(code, "user-1", None)
            .expect("verify");
        assert!(!binding_id.is_empty());
    }

    #[tokio::test]
    async fn failed_execution_reports_failed_status_but_still_logs() {
        let mut spec = echo_spec("ok");
        spec.program = "/nonexistent/bin/missing".to_string();
        let fixture = fixture(Classification::Restricted, vec![spec]);
        fixture
            .binder
            .provision_binding("internal", "u-1", "user-1", None)
            .expect("provision");

        let outcome = post(&fixture, "/platform-status proj-1").await;
        assert_eq!(outcome.status, "failed");
        assert_eq!(fixture.store.execution_count().expect("count"), 1);
        let replies = fixture.adapter.take_replies("th-1");
        assert!(replies[0].text.contains("not installed"));
    }

    #[tokio::test]
    async fn unloaded_channel_reports_failed() {
        let fixture = fixture(Classification::Restricted, vec![echo_spec("ok")]);
        let outcome = fixture
            .gateway
            .handle_webhook("slack", &HeaderMap::new(), &payload("/platform-status"))
            .await;
        assert_eq!(outcome.status, "failed");
    }
}
