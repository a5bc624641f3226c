//! Health Check Endpoints
//!
//! Provides Kubernetes-compatible health check endpoints:
//! - /health/ping - Simple liveness check
//! - /health/ready - Store and agent readiness check
//! - /health/live - Process alive check

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthDetails {
    pub stores: ComponentHealth,
    pub version: String,
    pub uptime_seconds: u64,
    pub agents: usize,
    pub workflows: usize,
    pub sessions: usize,
    pub contexts: usize,
    pub scan_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/ping - Simple pong response
#[utoipa::path(
    get,
    path = "/health/ping",
    tag = "Health",
    responses(
        (status = 200, description = "Service is responding", body = String),
    ),
)]
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health/live - Process liveness check
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses(
        (status = 200, description = "Process is alive", body = HealthResponse),
    ),
)]
pub async fn liveness() -> impl IntoResponse {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("Process is alive".to_string()),
        details: None,
    };
    (StatusCode::OK, Json(response))
}

/// GET /health/ready - Readiness check
///
/// Degraded while no worker agents are registered; unhealthy when a store
/// cannot be read.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Service is ready or degraded", body = HealthResponse),
        (status = 503, description = "Service is not ready", body = HealthResponse),
    ),
)]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state
        .sessions
        .len()
        .and_then(|sessions| Ok((sessions, state.orchestrator.context_count()?)));

    let (stores, sessions, contexts) = match counts {
        Ok((sessions, contexts)) => (
            ComponentHealth {
                status: HealthStatus::Healthy,
                error: None,
            },
            sessions,
            contexts,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Readiness check failed");
            (
                ComponentHealth {
                    status: HealthStatus::Unhealthy,
                    error: Some("Store unavailable".to_string()),
                },
                0,
                0,
            )
        }
    };

    let agents = state.orchestrator.agents().len();
    let overall_status = overall_status(stores.status, agents);
    let message = (overall_status == HealthStatus::Degraded)
        .then(|| "No worker agents registered".to_string());

    let response = HealthResponse {
        status: overall_status,
        message,
        details: Some(HealthDetails {
            stores,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            agents,
            workflows: state.orchestrator.workflows().len(),
            sessions,
            contexts,
            scan_running: state.scans.is_running().await,
        }),
    };

    let status_code = if overall_status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(response))
}

fn overall_status(stores: HealthStatus, agents: usize) -> HealthStatus {
    match (stores, agents) {
        (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
        (_, 0) => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create health check router
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() -> Result<(), serde_json::Error> {
        let response = HealthResponse {
            status: HealthStatus::Healthy,
            message: Some("All systems operational".to_string()),
            details: None,
        };

        let json = serde_json::to_string(&response)?;
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(!json.contains("details"));
        Ok(())
    }

    #[test]
    fn test_overall_status() {
        assert_eq!(overall_status(HealthStatus::Healthy, 3), HealthStatus::Healthy);
        assert_eq!(overall_status(HealthStatus::Healthy, 0), HealthStatus::Degraded);
        assert_eq!(overall_status(HealthStatus::Unhealthy, 3), HealthStatus::Unhealthy);
        assert_eq!(overall_status(HealthStatus::Unhealthy, 0), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_component_health_with_error() -> Result<(), serde_json::Error> {
        let component = ComponentHealth {
            status: HealthStatus::Unhealthy,
            error: Some("Store unavailable".to_string()),
        };

        let json = serde_json::to_string(&component)?;
        assert!(json.contains("\"status\":\"unhealthy\""));
        assert!(json.contains("Store unavailable"));
        Ok(())
    }
}
