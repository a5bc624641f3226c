//! Scan REST API Routes
//!
//! One scan runs at a time. Starting a scan clears the progress store and
//! hands the entity list to a background [`ScanRunner`]; stopping is
//! cooperative and takes effect before the next entity launches.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use conductor_agents::{ScanJob, ScanRequest, ScanRunner, DEFAULT_BATCH_SIZE};
use conductor_core::{ConductorResult, SessionId};
use conductor_sessions::ProgressAggregator;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{
    constants::MAX_SCAN_BATCH_SIZE,
    error::{ApiError, ApiResult},
    state::AppState,
};

// ============================================================================
// SCAN STATE
// ============================================================================

/// Holds the single background scan.
pub struct ScanState {
    runner: ScanRunner,
    progress: Arc<ProgressAggregator>,
    current: Mutex<Option<ScanJob>>,
}

impl ScanState {
    pub fn new(runner: ScanRunner, progress: Arc<ProgressAggregator>) -> Self {
        Self {
            runner,
            progress,
            current: Mutex::new(None),
        }
    }

    /// Start a scan unless one is still running.
    pub async fn start(&self, request: ScanRequest) -> ApiResult<SessionId> {
        request.validate()?;

        let mut current = self.current.lock().await;
        if let Some(job) = current.as_ref() {
            if !job.is_finished() {
                return Err(ApiError::state_conflict(format!(
                    "Scan {} is still running",
                    job.session_id
                )));
            }
        }

        let cleared = self.progress.reset()?;
        tracing::debug!(cleared, "Progress cleared before scan start");

        let session_id = request.session_id.clone();
        tracing::info!(
            session_id = %session_id,
            workflow = %request.workflow,
            entities = request.entities.len(),
            batch_size = request.batch_size,
            "Starting scan"
        );
        *current = Some(self.runner.spawn(request));
        Ok(session_id)
    }

    /// Signal the running scan, if any, and wait for it to wind down.
    pub async fn stop(&self) {
        let job = self.current.lock().await.take();
        let Some(job) = job else {
            return;
        };
        let session_id = job.session_id.clone();
        job.stop();
        match job.join().await {
            Ok(summary) => tracing::info!(
                session_id = %session_id,
                processed = summary.processed,
                failed = summary.failed,
                status = ?summary.status,
                "Scan stopped"
            ),
            Err(err) => tracing::warn!(session_id = %session_id, error = %err, "Scan ended with error"),
        }
    }

    /// Whether a scan is currently running.
    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|job| !job.is_finished())
    }
}

impl std::fmt::Debug for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanState").finish_non_exhaustive()
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StartScanRequest {
    /// Session the scan's traffic is accounted to. A new session when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub workflow: String,
    /// Entities to analyze, one workflow run each.
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<Object>))]
    pub entities: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl StartScanRequest {
    fn batch_size(&self) -> ApiResult<usize> {
        match self.batch_size {
            None => Ok(DEFAULT_BATCH_SIZE),
            Some(0) => Err(ApiError::invalid_input("batchSize must be positive")),
            Some(size) if size > MAX_SCAN_BATCH_SIZE => Err(ApiError::invalid_input(format!(
                "batchSize must be at most {}",
                MAX_SCAN_BATCH_SIZE
            ))),
            Some(size) => Ok(size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StartScanResponse {
    pub session_id: SessionId,
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /scan/start - Start a background scan
#[utoipa::path(
    post,
    path = "/scan/start",
    tag = "Scan",
    request_body = StartScanRequest,
    responses(
        (status = 202, description = "Scan accepted", body = StartScanResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 409, description = "A scan is already running", body = ApiError),
    ),
)]
pub async fn start_scan(
    State(state): State<AppState>,
    Json(req): Json<StartScanRequest>,
) -> ApiResult<(StatusCode, Json<StartScanResponse>)> {
    if req.workflow.trim().is_empty() {
        return Err(ApiError::missing_field("workflow"));
    }
    let batch_size = req.batch_size()?;

    let session_id = match req.session_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => new_scan_session(&state)?,
    };

    let request = ScanRequest::new(session_id, req.workflow, req.entities).with_batch_size(batch_size);
    let session_id = state.scans.start(request).await?;
    Ok((StatusCode::ACCEPTED, Json(StartScanResponse { session_id })))
}

fn new_scan_session(state: &AppState) -> ConductorResult<SessionId> {
    state.sessions.create_or_resume(None)
}

/// POST /scan/stop - Stop the running scan
#[utoipa::path(
    post,
    path = "/scan/stop",
    tag = "Scan",
    responses(
        (status = 204, description = "Scan stopped, or none was running"),
    ),
)]
pub async fn stop_scan(State(scans): State<Arc<ScanState>>) -> StatusCode {
    scans.stop().await;
    StatusCode::NO_CONTENT
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_scan))
        .route("/stop", post(stop_scan))
}
