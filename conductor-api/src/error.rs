//! Error Types for the Conductor API
//!
//! This module defines error handling for the API layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//! - Conversion from the core `ConductorError` taxonomy
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conductor_core::{
    AgentError, ConductorError, ConfigError, ProgressError, RoutingError, SessionError,
    StoreError, ValidationError, WorkflowError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code and represents
/// a category of error that can occur during API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request validation failed
    ValidationFailed,

    /// Invalid input data
    InvalidInput,

    /// Required field is missing
    MissingField,

    /// Invalid format (e.g., malformed UUID or session action)
    InvalidFormat,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Generic entity not found
    EntityNotFound,

    /// Session not found
    SessionNotFound,

    /// Context not found
    ContextNotFound,

    /// Workflow not registered
    WorkflowNotFound,

    /// Agent not registered
    AgentNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Entity already exists
    EntityAlreadyExists,

    /// Lifecycle transition not allowed from the current state
    InvalidTransition,

    /// Operation conflicts with current state
    StateConflict,

    // ========================================================================
    // Server Errors (5xx)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Service temporarily unavailable
    ServiceUnavailable,

    /// Operation timed out
    Timeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidFormat => StatusCode::BAD_REQUEST,

            ErrorCode::EntityNotFound
            | ErrorCode::SessionNotFound
            | ErrorCode::ContextNotFound
            | ErrorCode::WorkflowNotFound
            | ErrorCode::AgentNotFound => StatusCode::NOT_FOUND,

            ErrorCode::EntityAlreadyExists
            | ErrorCode::InvalidTransition
            | ErrorCode::StateConflict => StatusCode::CONFLICT,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidFormat => "Invalid format",

            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::SessionNotFound => "Session not found",
            ErrorCode::ContextNotFound => "Context not found",
            ErrorCode::WorkflowNotFound => "Workflow not found",
            ErrorCode::AgentNotFound => "Agent not found",

            ErrorCode::EntityAlreadyExists => "Entity already exists",
            ErrorCode::InvalidTransition => "Transition not allowed from the current state",
            ErrorCode::StateConflict => "Operation conflicts with current state",

            ErrorCode::InternalError => "Internal server error",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::Timeout => "Operation timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
///
/// This type is returned by all API endpoints when an error occurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            details: None,
        }
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected: {}", field, expected),
        )
    }

    pub fn entity_not_found(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} with id {} not found", entity_type, id),
        )
    }

    pub fn session_not_found(session_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("Session {} not found", session_id),
        )
    }

    pub fn context_not_found(context_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ContextNotFound,
            format!("Context {} not found", context_id),
        )
    }

    pub fn workflow_not_found(name: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::WorkflowNotFound,
            format!("Workflow {} not found", name),
        )
    }

    pub fn agent_not_found(agent_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::AgentNotFound,
            format!("Agent {} not found", agent_id),
        )
    }

    pub fn entity_already_exists(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityAlreadyExists,
            format!("{} with id {} already exists", entity_type, id),
        )
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidTransition, message)
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Operation '{}' timed out", operation),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

/// Implement IntoResponse for ApiError to enable automatic error handling in Axum.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self);
        (status, body).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM DOMAIN ERRORS
// ============================================================================

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        let message = err.to_string();
        match err {
            ConductorError::Session(SessionError::NotFound { session_id }) => {
                ApiError::session_not_found(session_id)
            }
            ConductorError::Session(SessionError::InvalidTransition { .. })
            | ConductorError::Progress(ProgressError::InvalidTransition { .. }) => {
                ApiError::invalid_transition(message)
            }
            ConductorError::Workflow(WorkflowError::UnknownWorkflow { name }) => {
                ApiError::workflow_not_found(name)
            }
            ConductorError::Workflow(WorkflowError::ContextNotFound { context_id }) => {
                ApiError::context_not_found(context_id)
            }
            ConductorError::Workflow(WorkflowError::AlreadyRegistered { name }) => {
                ApiError::entity_already_exists("Workflow", name)
            }
            ConductorError::Workflow(WorkflowError::InvalidDefinition { .. }) => {
                ApiError::validation_failed(message)
            }
            ConductorError::Agent(AgentError::NotRegistered { agent_id }) => {
                ApiError::agent_not_found(agent_id)
            }
            ConductorError::Agent(AgentError::AlreadyRegistered { agent_id }) => {
                ApiError::entity_already_exists("Agent", agent_id)
            }
            ConductorError::Agent(AgentError::Unavailable { .. }) => {
                ApiError::service_unavailable(message)
            }
            ConductorError::Agent(AgentError::InitializationFailed { .. }) => {
                tracing::error!(error = %message, "Agent initialization failed");
                ApiError::internal_error(message)
            }
            ConductorError::Routing(RoutingError::UnknownDestination { to, .. }) => {
                ApiError::agent_not_found(to)
            }
            ConductorError::Routing(RoutingError::CapacityExhausted { .. }) => {
                ApiError::service_unavailable(message)
            }
            ConductorError::Routing(RoutingError::StaleEnvelope { .. }) => {
                ApiError::validation_failed(message)
            }
            ConductorError::Validation(ValidationError::RequiredFieldMissing { field }) => {
                ApiError::missing_field(&field)
            }
            ConductorError::Validation(ValidationError::InvalidValue { .. })
            | ConductorError::Config(ConfigError::InvalidValue { .. }) => {
                ApiError::validation_failed(message)
            }
            ConductorError::Store(StoreError::LockPoisoned { store }) => {
                tracing::error!(store = store, "Store lock poisoned");
                ApiError::internal_error("Internal state is unavailable")
            }
        }
    }
}

/// Convert from serde_json::Error to ApiError.
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON serialization error: {:?}", err);
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

/// Convert from uuid::Error to ApiError.
impl From<uuid::Error> for ApiError {
    fn from(err: uuid::Error) -> Self {
        ApiError::invalid_format("id", &format!("valid UUID: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
