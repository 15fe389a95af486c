//! Fire-and-forget audit sink. Failures are swallowed: the audit trail must
//! never take a request down with it.

use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub event_type: String,
    pub actor: String,
    pub action: String,
    pub details: String,
    pub project_id: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            actor: actor.into(),
            action: action.into(),
            details: details.into(),
            project_id: None,
        }
    }

    pub fn with_project(mut self, project_id: Option<&str>) -> Self {
        self.project_id = project_id.map(ToOwned::to_owned);
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn log_event(&self, event: AuditEvent);
}

/// Writes audit events as structured tracing records under the `audit`
/// target so deployments can route them to a dedicated appender.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_event(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            event_type = %event.event_type,
            actor = %event.actor,
            action = %event.action,
            details = %event.details,
            project_id = event.project_id.as_deref().unwrap_or("-"),
            "audit event"
        );
    }
}

/// Collecting sink for tests and for the in-process diagnostics view.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_event(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
