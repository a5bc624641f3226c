//! Agent REST API Routes
//!
//! Read-only view of the registered worker agents. Agents are registered in
//! process through [`AppState::register_agent`](crate::state::AppState::register_agent).

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use conductor_agents::{AgentSummary, Orchestrator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ListAgentsResponse {
    pub agents: Vec<AgentSummary>,
    pub total: usize,
}

/// GET /agents - Registered agents with their counters
#[utoipa::path(
    get,
    path = "/agents",
    tag = "Agents",
    responses(
        (status = 200, description = "Registered agents", body = ListAgentsResponse),
    ),
)]
pub async fn list_agents(State(orchestrator): State<Arc<Orchestrator>>) -> Json<ListAgentsResponse> {
    let agents = orchestrator.agents();
    let total = agents.len();
    Json(ListAgentsResponse { agents, total })
}

/// GET /agents/{id} - One agent with its counters
#[utoipa::path(
    get,
    path = "/agents/{id}",
    tag = "Agents",
    params(("id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Agent summary", body = AgentSummary),
        (status = 404, description = "Agent not registered", body = ApiError),
    ),
)]
pub async fn get_agent(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentSummary>> {
    orchestrator
        .agents()
        .into_iter()
        .find(|a| a.descriptor.agent_id == id)
        .map(Json)
        .ok_or_else(|| ApiError::agent_not_found(&id))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents))
        .route("/:id", get(get_agent))
}
