//! Error types for conductor operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{AgentId, ContextId, EnvelopeId, SessionId};

/// Error taxonomy carried inside failure results on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ErrorKind {
    /// Destination agent is not registered.
    UnknownDestination,
    /// Admission rejected until retries were exhausted.
    CapacityExceeded,
    /// The agent's processing raised an error.
    ProcessingFailure,
    /// A session or progress record does not exist.
    NotFound,
    /// TTL elapsed before processing started.
    StaleEnvelope,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownDestination => "UnknownDestination",
            ErrorKind::CapacityExceeded => "CapacityExceeded",
            ErrorKind::ProcessingFailure => "ProcessingFailure",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::StaleEnvelope => "StaleEnvelope",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker agent registration and lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent not registered: {agent_id}")]
    NotRegistered { agent_id: AgentId },

    #[error("Agent already registered: {agent_id}")]
    AlreadyRegistered { agent_id: AgentId },

    #[error("Agent {agent_id} is not accepting envelopes")]
    Unavailable { agent_id: AgentId },

    #[error("Agent {agent_id} failed to initialize: {reason}")]
    InitializationFailed { agent_id: AgentId, reason: String },
}

/// Envelope routing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Unknown destination {to} for envelope {envelope_id}")]
    UnknownDestination { envelope_id: EnvelopeId, to: AgentId },

    #[error("Agent {agent_id} rejected envelope {envelope_id} after {attempts} attempts")]
    CapacityExhausted {
        envelope_id: EnvelopeId,
        agent_id: AgentId,
        attempts: u32,
    },

    #[error("Envelope {envelope_id} expired after {age_ms}ms (ttl {ttl_ms}ms)")]
    StaleEnvelope {
        envelope_id: EnvelopeId,
        age_ms: u64,
        ttl_ms: u64,
    },
}

/// Session lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {session_id}")]
    NotFound { session_id: SessionId },

    #[error("Invalid session transition for {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: SessionId,
        from: String,
        to: String,
    },
}

/// Progress record errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("Invalid progress transition for {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: SessionId,
        from: String,
        to: String,
    },
}

/// Workflow definition and execution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Unknown workflow: {name}")]
    UnknownWorkflow { name: String },

    #[error("Invalid workflow definition {name}: {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Workflow already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Context not found: {context_id}")]
    ContextNotFound { context_id: ContextId },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// In-memory store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Lock poisoned on {store} store")]
    LockPoisoned { store: &'static str },
}

/// Master error type for all conductor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConductorError {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ConductorError {
    /// Wire-level kind for errors that have one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ConductorError::Agent(AgentError::NotRegistered { .. }) => {
                Some(ErrorKind::UnknownDestination)
            }
            ConductorError::Routing(RoutingError::UnknownDestination { .. }) => {
                Some(ErrorKind::UnknownDestination)
            }
            ConductorError::Routing(RoutingError::CapacityExhausted { .. }) => {
                Some(ErrorKind::CapacityExceeded)
            }
            ConductorError::Routing(RoutingError::StaleEnvelope { .. }) => {
                Some(ErrorKind::StaleEnvelope)
            }
            ConductorError::Session(SessionError::NotFound { .. }) => Some(ErrorKind::NotFound),
            ConductorError::Workflow(WorkflowError::ContextNotFound { .. }) => {
                Some(ErrorKind::NotFound)
            }
            _ => None,
        }
    }
}

/// Result type alias for conductor operations.
pub type ConductorResult<T> = Result<T, ConductorError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_kind_wire_format() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&ErrorKind::CapacityExceeded)?;
        assert_eq!(json, "\"CapacityExceeded\"");
        let back: ErrorKind = serde_json::from_str("\"StaleEnvelope\"")?;
        assert_eq!(back, ErrorKind::StaleEnvelope);
        Ok(())
    }

    #[test]
    fn test_session_error_display_not_found() {
        let err = SessionError::NotFound {
            session_id: "nope".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Session not found"));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn test_routing_error_display_capacity() {
        let err = RoutingError::CapacityExhausted {
            envelope_id: Uuid::nil(),
            agent_id: "discovery".to_string(),
            attempts: 10,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("discovery"));
        assert!(msg.contains("10 attempts"));
    }

    #[test]
    fn test_progress_error_display_transition() {
        let err = ProgressError::InvalidTransition {
            session_id: "scanA".to_string(),
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("completed -> running"));
    }

    #[test]
    fn test_store_error_display_lock_poisoned() {
        let err = StoreError::LockPoisoned { store: "session" };
        assert_eq!(format!("{}", err), "Lock poisoned on session store");
    }

    #[test]
    fn test_conductor_error_from_variants() {
        let agent = ConductorError::from(AgentError::Unavailable {
            agent_id: "a".to_string(),
        });
        assert!(matches!(agent, ConductorError::Agent(_)));

        let session = ConductorError::from(SessionError::NotFound {
            session_id: "s".to_string(),
        });
        assert!(matches!(session, ConductorError::Session(_)));

        let workflow = ConductorError::from(WorkflowError::UnknownWorkflow {
            name: "w".to_string(),
        });
        assert!(matches!(workflow, ConductorError::Workflow(_)));

        let store = ConductorError::from(StoreError::LockPoisoned { store: "progress" });
        assert!(matches!(store, ConductorError::Store(_)));
    }

    #[test]
    fn test_conductor_error_kind() {
        let not_found = ConductorError::from(SessionError::NotFound {
            session_id: "s".to_string(),
        });
        assert_eq!(not_found.kind(), Some(ErrorKind::NotFound));

        let unknown = ConductorError::from(RoutingError::UnknownDestination {
            envelope_id: Uuid::nil(),
            to: "ghost".to_string(),
        });
        assert_eq!(unknown.kind(), Some(ErrorKind::UnknownDestination));

        let validation = ConductorError::from(ValidationError::RequiredFieldMissing {
            field: "workflow".to_string(),
        });
        assert_eq!(validation.kind(), None);
    }
}
