//! Message envelopes exchanged between agents.
//!
//! An [`Envelope`] is the atomic unit of communication. Its payload is a closed
//! set of variants, one per [`MessageKind`], so routing and workflow logic can
//! match exhaustively instead of poking at untyped JSON.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::identity::{new_entity_id, AgentId, ContextId, DurationMs, EnvelopeId, SessionId, Timestamp};
use crate::usage::TokenUsage;

// ============================================================================
// KIND AND PRIORITY
// ============================================================================

/// Kind of an envelope. Always derived from the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Task,
    Result,
    Request,
    Update,
    Alert,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Task,
        MessageKind::Result,
        MessageKind::Request,
        MessageKind::Update,
        MessageKind::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Task => "task",
            MessageKind::Result => "result",
            MessageKind::Request => "request",
            MessageKind::Update => "update",
            MessageKind::Alert => "alert",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of an envelope.
///
/// Priority does not reorder queues. It only scales how aggressively a
/// rejected envelope is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Multiplier applied to the retry backoff for this priority.
    pub fn backoff_factor(&self) -> f64 {
        match self {
            Priority::Low => 2.0,
            Priority::Medium => 1.0,
            Priority::High => 0.5,
            Priority::Critical => 0.25,
        }
    }
}

// ============================================================================
// PAYLOAD VARIANTS
// ============================================================================

/// Marks an envelope as belonging to one stage of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct StageMarker {
    pub workflow: String,
    pub stage: String,
}

impl StageMarker {
    pub fn new(workflow: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            stage: stage.into(),
        }
    }
}

/// Work for an agent to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// What the agent is asked to do (e.g. "discover", "analyze")
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageMarker>,
    #[serde(default)]
    pub input: JsonValue,
}

/// Outcome carried by a result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Success {
        output: JsonValue,
    },
    Failure {
        error: ErrorKind,
        message: String,
        /// The envelope that failed, attached for diagnostics
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original: Option<Box<Envelope>>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Reply to a previously processed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub in_reply_to: EnvelopeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageMarker>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Information request to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub query: String,
    #[serde(default)]
    pub params: JsonValue,
}

/// Status notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Something an operator or another agent should look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub severity: AlertSeverity,
    pub message: String,
}

/// Closed set of envelope payloads, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Task(TaskPayload),
    Result(ResultPayload),
    Request(RequestPayload),
    Update(UpdatePayload),
    Alert(AlertPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Task(_) => MessageKind::Task,
            Payload::Result(_) => MessageKind::Result,
            Payload::Request(_) => MessageKind::Request,
            Payload::Update(_) => MessageKind::Update,
            Payload::Alert(_) => MessageKind::Alert,
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// The typed unit of communication between agents.
///
/// Envelopes are built once through the consuming `with_*` methods and never
/// mutated afterwards; replies are new envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: EnvelopeId,
    pub from: AgentId,
    pub to: AgentId,
    pub priority: Priority,
    pub payload: Payload,
    pub context_id: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub created_at: Timestamp,
    pub requires_response: bool,
    /// Milliseconds after `created_at` when the envelope goes stale
    #[serde(default, rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<DurationMs>,
}

impl Envelope {
    /// Create an envelope in a fresh context.
    pub fn new(from: impl Into<AgentId>, to: impl Into<AgentId>, payload: Payload) -> Self {
        Self {
            id: new_entity_id(),
            from: from.into(),
            to: to.into(),
            priority: Priority::default(),
            payload,
            context_id: new_entity_id(),
            session_id: None,
            created_at: Utc::now(),
            requires_response: true,
            ttl_ms: None,
        }
    }

    /// Create a task envelope.
    pub fn task(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        action: impl Into<String>,
        input: JsonValue,
    ) -> Self {
        Self::new(
            from,
            to,
            Payload::Task(TaskPayload {
                action: action.into(),
                stage: None,
                input,
            }),
        )
    }

    /// Create a task envelope belonging to a workflow stage.
    pub fn staged_task(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        action: impl Into<String>,
        input: JsonValue,
        stage: StageMarker,
    ) -> Self {
        Self::new(
            from,
            to,
            Payload::Task(TaskPayload {
                action: action.into(),
                stage: Some(stage),
                input,
            }),
        )
    }

    /// Create an alert envelope. Alerts never expect a reply.
    pub fn alert(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            from,
            to,
            Payload::Alert(AlertPayload {
                severity,
                message: message.into(),
            }),
        )
        .without_response()
    }

    /// Set the correlation context.
    pub fn with_context(mut self, context_id: ContextId) -> Self {
        self.context_id = context_id;
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attribute the envelope to an accountable session.
    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as DurationMs);
        self
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark the envelope as fire-and-forget.
    pub fn without_response(mut self) -> Self {
        self.requires_response = false;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Stage marker of a task or result envelope, if any.
    pub fn stage(&self) -> Option<&StageMarker> {
        match &self.payload {
            Payload::Task(task) => task.stage.as_ref(),
            Payload::Result(result) => result.stage.as_ref(),
            _ => None,
        }
    }

    /// Check whether the TTL has elapsed at `now`.
    pub fn is_stale_at(&self, now: Timestamp) -> bool {
        match self.ttl_ms {
            Some(ttl) => {
                let elapsed = (now - self.created_at).num_milliseconds();
                elapsed > ttl as i64
            }
            None => false,
        }
    }

    /// Check whether the TTL has elapsed.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    /// Build the result envelope answering this one.
    ///
    /// The reply goes back to the sender in the same context and session and
    /// never expects a response itself.
    pub fn reply(&self, outcome: Outcome, usage: Option<TokenUsage>) -> Envelope {
        Envelope {
            id: new_entity_id(),
            from: self.to.clone(),
            to: self.from.clone(),
            priority: self.priority,
            payload: Payload::Result(ResultPayload {
                in_reply_to: self.id,
                stage: self.stage().cloned(),
                outcome,
                usage,
            }),
            context_id: self.context_id,
            session_id: self.session_id.clone(),
            created_at: Utc::now(),
            requires_response: false,
            ttl_ms: None,
        }
    }

    /// Successful reply carrying `output`.
    pub fn success_reply(&self, output: JsonValue, usage: Option<TokenUsage>) -> Envelope {
        self.reply(Outcome::Success { output }, usage)
    }

    /// Error-bearing reply. The original envelope is attached for diagnostics.
    pub fn failure_reply(&self, error: ErrorKind, message: impl Into<String>) -> Envelope {
        self.reply(
            Outcome::Failure {
                error,
                message: message.into(),
                original: Some(Box::new(self.clone())),
            },
            None,
        )
    }
}

// ============================================================================
// OBSERVATION
// ============================================================================

/// Passive observer of routed envelope traffic.
///
/// Observers are called synchronously on the routing path and must not block.
pub trait EnvelopeObserver: Send + Sync {
    fn observe(&self, envelope: &Envelope);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_defaults() {
        let env = Envelope::task("orchestrator", "discovery", "discover", json!({"q": 1}));
        assert_eq!(env.kind(), MessageKind::Task);
        assert_eq!(env.priority, Priority::Medium);
        assert!(env.requires_response);
        assert!(env.ttl_ms.is_none());
        assert!(env.session_id.is_none());
    }

    #[test]
    fn test_alert_never_requires_response() {
        let env = Envelope::alert("scanner", "ops", AlertSeverity::Warning, "slow batch");
        assert_eq!(env.kind(), MessageKind::Alert);
        assert!(!env.requires_response);
    }

    #[test]
    fn test_staleness() {
        let created = Utc::now() - chrono::Duration::seconds(10);
        let env = Envelope::task("a", "b", "x", JsonValue::Null)
            .with_created_at(created)
            .with_ttl(Duration::from_secs(5));
        assert!(env.is_stale());

        let fresh = Envelope::task("a", "b", "x", JsonValue::Null).with_ttl(Duration::from_secs(60));
        assert!(!fresh.is_stale());

        let no_ttl = Envelope::task("a", "b", "x", JsonValue::Null).with_created_at(created);
        assert!(!no_ttl.is_stale());
    }

    #[test]
    fn test_reply_preserves_correlation() {
        let context = new_entity_id();
        let env = Envelope::task("orchestrator", "analysis", "analyze", JsonValue::Null)
            .with_context(context)
            .with_session("s-1")
            .with_priority(Priority::High);

        let reply = env.success_reply(json!({"ok": true}), Some(TokenUsage::new(1, 2)));
        assert_eq!(reply.kind(), MessageKind::Result);
        assert_eq!(reply.from, "analysis");
        assert_eq!(reply.to, "orchestrator");
        assert_eq!(reply.context_id, context);
        assert_eq!(reply.session_id.as_deref(), Some("s-1"));
        assert_eq!(reply.priority, Priority::High);
        assert!(!reply.requires_response);
        assert_ne!(reply.id, env.id);

        match reply.payload {
            Payload::Result(result) => {
                assert_eq!(result.in_reply_to, env.id);
                assert!(result.outcome.is_success());
                assert_eq!(result.usage, Some(TokenUsage::new(1, 2)));
            }
            other => panic!("expected result payload, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_reply_attaches_original() {
        let env = Envelope::task("orchestrator", "analysis", "analyze", JsonValue::Null);
        let reply = env.failure_reply(ErrorKind::ProcessingFailure, "boom");
        match reply.payload {
            Payload::Result(ResultPayload {
                outcome: Outcome::Failure { error, message, original },
                ..
            }) => {
                assert_eq!(error, ErrorKind::ProcessingFailure);
                assert_eq!(message, "boom");
                assert_eq!(original.map(|o| o.id), Some(env.id));
            }
            other => panic!("expected failure result, got {:?}", other),
        }
    }

    #[test]
    fn test_stage_marker_carried_into_reply() {
        let env = Envelope::staged_task(
            "orchestrator",
            "discovery",
            "discover",
            JsonValue::Null,
            StageMarker::new("pipeline", "discovery"),
        );
        let reply = env.success_reply(JsonValue::Null, None);
        assert_eq!(reply.stage(), Some(&StageMarker::new("pipeline", "discovery")));
    }

    #[test]
    fn test_envelope_wire_format() -> Result<(), serde_json::Error> {
        let env = Envelope::task("a", "b", "discover", json!({"n": 3}))
            .with_ttl(Duration::from_millis(1500));
        let value = serde_json::to_value(&env)?;
        assert_eq!(value["payload"]["kind"], "task");
        assert_eq!(value["payload"]["action"], "discover");
        assert_eq!(value["ttl"], 1500);
        assert_eq!(value["requiresResponse"], true);

        let back: Envelope = serde_json::from_value(value)?;
        assert_eq!(back, env);
        Ok(())
    }

    #[test]
    fn test_priority_backoff_ordering() {
        assert!(Priority::Critical.backoff_factor() < Priority::High.backoff_factor());
        assert!(Priority::High.backoff_factor() < Priority::Medium.backoff_factor());
        assert!(Priority::Medium.backoff_factor() < Priority::Low.backoff_factor());
    }
}
