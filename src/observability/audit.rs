/// Structured session events for the collector and the client
///
/// Every event carries a session correlation id (uuid v4) so that the
/// daemon-side and client-side views of one session can be joined. Events are
/// emitted as single JSON lines through the `log` facade under the
/// `kquery::audit` target.
use crate::config::types::CycleReport;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "kquery::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    SessionOpened,
    SessionClosed,
    RequestRejected,
    UnrecognizedCommand,
    CycleCompleted,
    CycleAborted,
}

impl AuditEventType {
    fn is_warning(self) -> bool {
        matches!(
            self,
            AuditEventType::RequestRejected
                | AuditEventType::UnrecognizedCommand
                | AuditEventType::CycleAborted
        )
    }
}

/// Correlation id shared by every event of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub session: SessionId,
    pub timestamp: SystemTime,
    pub details: String,
    pub report: Option<CycleReport>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, session: &SessionId, details: impl Into<String>) -> Self {
        Self {
            event_type,
            session: session.clone(),
            timestamp: SystemTime::now(),
            details: details.into(),
            report: None,
        }
    }

    pub fn with_report(mut self, report: CycleReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "event_type": self.event_type,
            "session": self.session.0,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(report) = &self.report {
            entry["report"] = serde_json::to_value(report).unwrap_or(serde_json::Value::Null);
        }
        entry
    }
}

pub fn log_audit_event(event: AuditEvent) {
    let line = event.to_json();
    if event.event_type.is_warning() {
        warn!(target: AUDIT_TARGET, "{}", line);
    } else {
        info!(target: AUDIT_TARGET, "{}", line);
    }
}

/// Convenience constructors for common events
pub mod events {
    use super::*;

    pub fn session_opened(session: &SessionId, peer: &str) {
        log_audit_event(AuditEvent::new(
            AuditEventType::SessionOpened,
            session,
            format!("channel session opened by {}", peer),
        ));
    }

    pub fn session_closed(session: &SessionId, requests: u64) {
        log_audit_event(AuditEvent::new(
            AuditEventType::SessionClosed,
            session,
            format!("channel session closed after {} requests", requests),
        ));
    }

    pub fn request_rejected(session: &SessionId, reason: String) {
        log_audit_event(AuditEvent::new(AuditEventType::RequestRejected, session, reason));
    }

    pub fn unrecognized_command(session: &SessionId, command: &str) {
        log_audit_event(AuditEvent::new(
            AuditEventType::UnrecognizedCommand,
            session,
            format!("unrecognized command {:?} answered with empty response", command),
        ));
    }

    pub fn cycle_completed(session: &SessionId, report: CycleReport) {
        log_audit_event(
            AuditEvent::new(AuditEventType::CycleCompleted, session, "query cycle completed")
                .with_report(report),
        );
    }

    pub fn cycle_aborted(session: &SessionId, reason: String) {
        log_audit_event(AuditEvent::new(AuditEventType::CycleAborted, session, reason));
    }
}
