//! Conductor API - REST Layer
//!
//! Exposes the orchestration core over HTTP with Axum: session lifecycle and
//! usage accounting, scan progress, workflow runs, contexts and agents.
//!
//! All state lives in memory inside [`AppState`]; the stores are built once
//! at startup and shared by every router.

#[macro_use]
pub mod macros;

pub mod config;
pub mod constants;
pub mod error;
pub mod jobs;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use config::{ApiConfig, LogFormat};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use jobs::{maintenance_task, MaintenanceConfig, MaintenanceTargets};
pub use openapi::ApiDoc;
pub use routes::create_api_router;
pub use state::AppState;
pub use telemetry::{init_tracer, TelemetryConfig};
