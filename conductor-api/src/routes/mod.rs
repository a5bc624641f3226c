//! REST API Routes Module
//!
//! Route handlers organized by resource. Every router shares one
//! [`AppState`]; handlers pull the store they need through `FromRef`.
//!
//! Includes:
//! - Session lifecycle and usage accounting
//! - Progress polling and upserts
//! - Workflow runs, contexts and agents
//! - Scan start/stop
//! - Health check endpoints (Kubernetes-compatible)
//! - CORS support for browser dashboards

pub mod agent;
pub mod context;
pub mod envelope;
pub mod health;
pub mod progress;
pub mod scan;
pub mod session;
pub mod workflow;

use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    http::{header, HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    BoxError, Json, Router,
};
use tower::{timeout::error::Elapsed, ServiceBuilder};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

// Re-export route creation functions for convenience
pub use agent::create_router as agent_router;
pub use context::create_router as context_router;
pub use envelope::create_router as envelope_router;
pub use health::create_router as health_router;
pub use progress::create_router as progress_router;
pub use scan::create_router as scan_router;
pub use session::create_router as session_router;
pub use workflow::create_router as workflow_router;

// ============================================================================
// OPENAPI ENDPOINT
// ============================================================================

/// Handler for /openapi.json endpoint.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// ============================================================================
// TIMEOUT HANDLING
// ============================================================================

async fn handle_timeout_error(err: BoxError) -> ApiError {
    if err.is::<Elapsed>() {
        ApiError::timeout("request")
    } else {
        tracing::error!(error = %err, "Unhandled middleware error");
        ApiError::internal_error("Unhandled middleware error")
    }
}

// ============================================================================
// CORS LAYER
// ============================================================================

/// Build the CORS layer from ApiConfig.
///
/// In development mode (empty origins), allows all origins.
/// Origins of the form `https://*.example.com` match any subdomain.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: Development mode - allowing all origins");
        return cors.allow_origin(Any).allow_headers(Any);
    }

    tracing::info!(origins = ?config.cors_origins, "CORS: Restricting origins");
    let has_wildcard = config.cors_origins.iter().any(|o| o.contains('*'));
    let cors = if has_wildcard {
        let config = config.clone();
        cors.allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| config.is_origin_allowed(o))
                .unwrap_or(false)
        }))
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    };

    if config.cors_allow_credentials {
        cors.allow_credentials(true)
    } else {
        cors
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create the complete API router.
///
/// - Sessions at /sessions/*
/// - Progress at /progress/*
/// - Workflows, contexts, agents and envelopes under their own prefixes
/// - Scan control at /scan/*
/// - Health checks at /health/*
/// - OpenAPI spec at /openapi.json
///
/// Layers, outer to inner: CORS, HTTP tracing, request timeout.
pub fn create_api_router(state: AppState, config: &ApiConfig) -> Router {
    let timeout = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_timeout_error))
        .timeout(config.request_timeout);

    Router::new()
        .nest("/sessions", session::create_router())
        .nest("/progress", progress::create_router())
        .nest("/workflows", workflow::create_router())
        .nest("/contexts", context::create_router())
        .nest("/agents", agent::create_router())
        .nest("/envelopes", envelope::create_router())
        .nest("/scan", scan::create_router())
        .nest("/health", health::create_router())
        .route("/openapi.json", get(openapi_json))
        .layer(timeout)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(config))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_error_maps_to_gateway_timeout() {
        let err: BoxError = Box::new(Elapsed::new());
        let api_err = handle_timeout_error(err).await;
        assert_eq!(api_err.status_code(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_other_middleware_error_is_internal() {
        let err: BoxError = "boom".into();
        let api_err = handle_timeout_error(err).await;
        assert_eq!(
            api_err.status_code(),
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
