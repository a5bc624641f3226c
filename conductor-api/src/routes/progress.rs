//! Progress REST API Routes
//!
//! Dashboards poll `GET /progress`; the scan loop (or any external
//! collaborator) posts partial records to `POST /progress`.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use conductor_core::{ProgressRecord, ProgressUpdate, SessionId};
use conductor_sessions::{ProgressAggregator, DEFAULT_PROGRESS_SESSION};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
#[cfg_attr(feature = "openapi", into_params(parameter_in = Query))]
#[serde(rename_all = "camelCase")]
pub struct ProgressQuery {
    /// Record to read. Omit for the most recent running scan.
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ProgressAction {
    Reset,
}

/// Body of `POST /progress`: either `{action: "reset"}` or a partial record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProgressPostRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ProgressAction>,
    /// Defaults to `"default"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub update: ProgressUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProgressResetResponse {
    pub cleared: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ListProgressResponse {
    pub records: Vec<ProgressRecord>,
    pub total: usize,
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// GET /progress - Current progress record
///
/// Always answers with a well-formed record, zeroed when nothing is tracked.
#[utoipa::path(
    get,
    path = "/progress",
    tag = "Progress",
    params(ProgressQuery),
    responses(
        (status = 200, description = "Progress record", body = ProgressRecord),
    ),
)]
pub async fn get_progress(
    State(progress): State<Arc<ProgressAggregator>>,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Json<ProgressRecord>> {
    let session_id = query.session_id.as_deref().filter(|id| !id.is_empty());
    Ok(Json(progress.get(session_id)?))
}

/// POST /progress - Upsert a partial record, or reset all records
#[utoipa::path(
    post,
    path = "/progress",
    tag = "Progress",
    request_body = ProgressPostRequest,
    responses(
        (status = 200, description = "Merged record, or `{cleared}` after a reset", body = ProgressRecord),
        (status = 409, description = "Status transition not allowed", body = ApiError),
    ),
)]
pub async fn post_progress(
    State(progress): State<Arc<ProgressAggregator>>,
    Json(req): Json<ProgressPostRequest>,
) -> ApiResult<Response> {
    if req.action == Some(ProgressAction::Reset) {
        let cleared = progress.reset()?;
        tracing::info!(cleared, "Progress reset by request");
        return Ok(Json(ProgressResetResponse { cleared }).into_response());
    }

    let session_id = req
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PROGRESS_SESSION.to_string());
    let record = progress.upsert(&session_id, req.update)?;
    Ok(Json(record).into_response())
}

/// GET /progress/all - Every tracked record
#[utoipa::path(
    get,
    path = "/progress/all",
    tag = "Progress",
    responses(
        (status = 200, description = "All tracked records, newest first", body = ListProgressResponse),
    ),
)]
pub async fn list_progress(
    State(progress): State<Arc<ProgressAggregator>>,
) -> ApiResult<Json<ListProgressResponse>> {
    let records = progress.list()?;
    let total = records.len();
    Ok(Json(ListProgressResponse { records, total }))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_progress).post(post_progress))
        .route("/all", get(list_progress))
}
