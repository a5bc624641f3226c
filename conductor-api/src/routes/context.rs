//! Context REST API Routes
//!
//! A context is the ordered envelope history of one causally related
//! exchange. Pausing parks new envelopes; resuming re-routes them in order.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use conductor_agents::{Context, ContextStatus, Orchestrator, WorkflowState};
use conductor_core::{ContextId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    routes::session::split_action,
    state::AppState,
};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub context_id: ContextId,
    pub status: ContextStatus,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub start_time: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub last_update: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Routed envelopes in arrival order.
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<Object>))]
    pub envelopes: Vec<JsonValue>,
    pub parked_count: usize,
    /// State of the workflow run driving this context, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<WorkflowState>,
}

impl ContextResponse {
    fn build(context: Context, run: Option<WorkflowState>) -> ApiResult<Self> {
        let envelopes = context
            .envelopes
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            context_id: context.context_id,
            status: context.status,
            start_time: context.start_time,
            last_update: context.last_update,
            workflow: context.workflow,
            envelopes,
            parked_count: context.parked.len(),
            run,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextAction {
    Pause,
    Resume,
}

fn parse_target(target: &str) -> ApiResult<(ContextId, ContextAction)> {
    let (id, action) = split_action(target)
        .ok_or_else(|| ApiError::invalid_format("target", "{contextId}:{action}"))?;
    let context_id = Uuid::parse_str(id)?;
    let action = match action {
        "pause" => ContextAction::Pause,
        "resume" => ContextAction::Resume,
        other => {
            return Err(ApiError::invalid_input(format!(
                "Unknown context action '{}', expected pause or resume",
                other
            )))
        }
    };
    Ok((context_id, action))
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// GET /contexts/{id} - Context history and run state
#[utoipa::path(
    get,
    path = "/contexts/{id}",
    tag = "Contexts",
    params(("id" = String, Path, description = "Context ID")),
    responses(
        (status = 200, description = "Context snapshot", body = ContextResponse),
        (status = 400, description = "Malformed context id", body = ApiError),
        (status = 404, description = "Context not found", body = ApiError),
    ),
)]
pub async fn get_context(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContextResponse>> {
    let context_id = Uuid::parse_str(&id)?;
    let context = orchestrator.context(context_id)?;
    let run = orchestrator.workflow_state(context_id);
    Ok(Json(ContextResponse::build(context, run)?))
}

/// POST /contexts/{id}:{action} - Pause or resume a context
#[utoipa::path(
    post,
    path = "/contexts/{target}",
    tag = "Contexts",
    params(("target" = String, Path, description = "Context ID and action, e.g. `{id}:pause`")),
    responses(
        (status = 204, description = "Action applied"),
        (status = 400, description = "Malformed target", body = ApiError),
        (status = 404, description = "Context not found", body = ApiError),
    ),
)]
pub async fn context_action(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(target): Path<String>,
) -> ApiResult<StatusCode> {
    let (context_id, action) = parse_target(&target)?;
    match action {
        ContextAction::Pause => {
            orchestrator.pause_context(context_id)?;
        }
        ContextAction::Resume => {
            orchestrator.resume_context(context_id).await?;
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new().route("/:id", get(get_context).post(context_action))
}
