//! Workflow REST API Routes

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use conductor_agents::Orchestrator;
use conductor_core::{ContextId, Priority, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    #[serde(default)]
    pub workflow: String,
    /// Initial input handed to the first stage.
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub input: JsonValue,
    /// Session the run's traffic is accounted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Priority of every task in the run. Scales retry backoff only.
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub context_id: ContextId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<String>,
}

/// POST /workflows - Start a workflow run in a new context
#[utoipa::path(
    post,
    path = "/workflows",
    tag = "Workflows",
    request_body = StartWorkflowRequest,
    responses(
        (status = 201, description = "Run started", body = StartWorkflowResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Workflow not registered", body = ApiError),
    ),
)]
pub async fn start_workflow(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<StartWorkflowRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.workflow.trim().is_empty() {
        return Err(ApiError::missing_field("workflow"));
    }

    let context_id = orchestrator
        .launch_workflow_with_priority(&req.workflow, req.input, req.session_id, req.priority)
        .await?
        .context_id;

    Ok((
        StatusCode::CREATED,
        Json(StartWorkflowResponse { context_id }),
    ))
}

/// GET /workflows - Registered workflow names
#[utoipa::path(
    get,
    path = "/workflows",
    tag = "Workflows",
    responses(
        (status = 200, description = "Registered workflows", body = ListWorkflowsResponse),
    ),
)]
pub async fn list_workflows(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Json<ListWorkflowsResponse> {
    Json(ListWorkflowsResponse {
        workflows: orchestrator.workflows(),
    })
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", post(start_workflow).get(list_workflows))
}
