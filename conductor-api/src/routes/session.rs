//! Session REST API Routes
//!
//! Lifecycle and cost accounting for sessions. Lifecycle actions use the
//! `POST /sessions/{id}:action` form, so a single handler serves
//! pause, resume, complete and fail.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use conductor_core::{CostSummary, Session, SessionId};
use conductor_sessions::SessionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ForkSessionResponse {
    pub child_session_id: SessionId,
}

/// Optional body of `POST /sessions/{id}:fail`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct FailSessionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResponse {
    pub sessions: Vec<Session>,
    pub total: usize,
}

/// Lifecycle action addressed as `{id}:{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Pause,
    Resume,
    Complete,
    Fail,
}

impl SessionAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "pause" => Some(SessionAction::Pause),
            "resume" => Some(SessionAction::Resume),
            "complete" => Some(SessionAction::Complete),
            "fail" => Some(SessionAction::Fail),
            _ => None,
        }
    }
}

/// Split `target` on its last `:` into an id and an action.
pub fn split_action(target: &str) -> Option<(&str, &str)> {
    let (id, action) = target.rsplit_once(':')?;
    if id.is_empty() || action.is_empty() {
        return None;
    }
    Some((id, action))
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /sessions - Create a session, or resume an active one
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "Sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = CreateSessionResponse),
        (status = 200, description = "Existing active session resumed", body = CreateSessionResponse),
    ),
)]
pub async fn create_session(
    State(sessions): State<Arc<SessionManager>>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let requested = req.resume_session_id.as_deref();
    let session_id = sessions.create_or_resume(requested)?;

    let status = if requested == Some(session_id.as_str()) {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(CreateSessionResponse { session_id })))
}

/// GET /sessions - List sessions
#[utoipa::path(
    get,
    path = "/sessions",
    tag = "Sessions",
    responses(
        (status = 200, description = "All live sessions", body = ListSessionsResponse),
    ),
)]
pub async fn list_sessions(
    State(sessions): State<Arc<SessionManager>>,
) -> ApiResult<Json<ListSessionsResponse>> {
    let sessions = sessions.list()?;
    let total = sessions.len();
    Ok(Json(ListSessionsResponse { sessions, total }))
}

/// GET /sessions/{id} - Session snapshot
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "Sessions",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session snapshot", body = Session),
        (status = 404, description = "Session not found", body = ApiError),
    ),
)]
pub async fn get_session(
    State(sessions): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(sessions.get(&id)?))
}

/// POST /sessions/{id}:{action} - Pause, resume, complete or fail a session
#[utoipa::path(
    post,
    path = "/sessions/{target}",
    tag = "Sessions",
    params(("target" = String, Path, description = "Session ID and action, e.g. `abc:pause`")),
    request_body(content = FailSessionRequest, description = "Optional failure reason for `:fail`"),
    responses(
        (status = 204, description = "Transition applied"),
        (status = 400, description = "Unknown action", body = ApiError),
        (status = 404, description = "Session not found", body = ApiError),
        (status = 409, description = "Transition not allowed", body = ApiError),
    ),
)]
pub async fn session_action(
    State(sessions): State<Arc<SessionManager>>,
    Path(target): Path<String>,
    body: Option<Json<FailSessionRequest>>,
) -> ApiResult<StatusCode> {
    let (id, action) = split_action(&target)
        .ok_or_else(|| ApiError::invalid_format("target", "{sessionId}:{action}"))?;
    let action = SessionAction::parse(action).ok_or_else(|| {
        ApiError::invalid_input(format!(
            "Unknown session action '{}', expected pause, resume, complete or fail",
            action
        ))
    })?;

    match action {
        SessionAction::Pause => sessions.pause(id)?,
        SessionAction::Resume => sessions.resume(id)?,
        SessionAction::Complete => {
            sessions.complete(id)?;
        }
        SessionAction::Fail => {
            let reason = body
                .and_then(|Json(req)| req.reason)
                .unwrap_or_else(|| "failed by request".to_string());
            sessions.fail(id, reason)?;
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/{id}/fork - Create a child session
#[utoipa::path(
    post,
    path = "/sessions/{id}/fork",
    tag = "Sessions",
    params(("id" = String, Path, description = "Parent session ID")),
    responses(
        (status = 201, description = "Child session created", body = ForkSessionResponse),
        (status = 404, description = "Parent session not found", body = ApiError),
    ),
)]
pub async fn fork_session(
    State(sessions): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let child_session_id = sessions.fork(&id)?;
    Ok((
        StatusCode::CREATED,
        Json(ForkSessionResponse { child_session_id }),
    ))
}

/// GET /sessions/{id}/usage - Cost summary
#[utoipa::path(
    get,
    path = "/sessions/{id}/usage",
    tag = "Sessions",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Cost summary", body = CostSummary),
        (status = 404, description = "Session not found", body = ApiError),
    ),
)]
pub async fn session_usage(
    State(sessions): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CostSummary>> {
    Ok(Json(sessions.cost_summary(&id)?))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_session).get(list_sessions))
        .route("/:id", get(get_session).post(session_action))
        .route("/:id/fork", post(fork_session))
        .route("/:id/usage", get(session_usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_action_uses_last_colon() {
        assert_eq!(split_action("abc:pause"), Some(("abc", "pause")));
        assert_eq!(split_action("scan:2024:complete"), Some(("scan:2024", "complete")));
        assert_eq!(split_action("abc"), None);
        assert_eq!(split_action(":pause"), None);
        assert_eq!(split_action("abc:"), None);
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(SessionAction::parse("pause"), Some(SessionAction::Pause));
        assert_eq!(SessionAction::parse("fail"), Some(SessionAction::Fail));
        assert_eq!(SessionAction::parse("PAUSE"), None);
        assert_eq!(SessionAction::parse("delete"), None);
    }

    #[test]
    fn test_create_request_accepts_empty_body() -> Result<(), serde_json::Error> {
        let req: CreateSessionRequest = serde_json::from_str("{}")?;
        assert!(req.resume_session_id.is_none());

        let req: CreateSessionRequest = serde_json::from_str(r#"{"resumeSessionId":"s1"}"#)?;
        assert_eq!(req.resume_session_id.as_deref(), Some("s1"));
        Ok(())
    }
}
