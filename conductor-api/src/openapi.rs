//! OpenAPI Specification for the Conductor API
//!
//! Generated with utoipa from the Rust types and route annotations.

use utoipa::OpenApi;

use crate::error::{ApiError, ErrorCode};
use crate::routes::{
    agent, context, envelope, health, progress, scan, session, workflow,
};

use conductor_agents::{
    AgentDescriptor, AgentStatsSnapshot, AgentSummary, Capability, ContextStatus, DropReason,
    StageState, StageStatus, WorkflowState, WorkflowStatus,
};
use conductor_core::{
    AgentUsage, CostSummary, Priority, ProgressRecord, ProgressStatus, ProgressUpdate, Session,
    SessionStatus, TokenUsage, UsageRecord,
};

/// OpenAPI document for the Conductor API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Conductor API",
        description = "Agent orchestration with session accounting and scan progress",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local Development")
    ),
    tags(
        (name = "Sessions", description = "Session lifecycle and token usage accounting"),
        (name = "Progress", description = "Scan progress records for dashboards"),
        (name = "Workflows", description = "Multi-stage workflow runs"),
        (name = "Contexts", description = "Envelope histories and pause/resume"),
        (name = "Agents", description = "Registered worker agents"),
        (name = "Envelopes", description = "Direct envelope routing"),
        (name = "Scan", description = "Background batch scans"),
        (name = "Health", description = "Liveness and readiness checks")
    ),
    paths(
        // === Session Routes ===
        session::create_session,
        session::list_sessions,
        session::get_session,
        session::session_action,
        session::fork_session,
        session::session_usage,

        // === Progress Routes ===
        progress::get_progress,
        progress::post_progress,
        progress::list_progress,

        // === Workflow Routes ===
        workflow::start_workflow,
        workflow::list_workflows,

        // === Context Routes ===
        context::get_context,
        context::context_action,

        // === Agent Routes ===
        agent::list_agents,
        agent::get_agent,

        // === Envelope Routes ===
        envelope::route_envelope,

        // === Scan Routes ===
        scan::start_scan,
        scan::stop_scan,

        // === Health Routes ===
        health::ping,
        health::liveness,
        health::readiness,
    ),
    components(
        schemas(
            // === Error Types ===
            ApiError, ErrorCode,

            // === Session Types ===
            session::CreateSessionRequest, session::CreateSessionResponse,
            session::ForkSessionResponse, session::FailSessionRequest,
            session::ListSessionsResponse,
            Session, SessionStatus, CostSummary, AgentUsage, UsageRecord, TokenUsage,

            // === Progress Types ===
            progress::ProgressPostRequest, progress::ProgressAction,
            progress::ProgressResetResponse, progress::ListProgressResponse,
            ProgressRecord, ProgressUpdate, ProgressStatus,

            // === Workflow and Context Types ===
            workflow::StartWorkflowRequest, workflow::StartWorkflowResponse,
            workflow::ListWorkflowsResponse, Priority,
            context::ContextResponse, ContextStatus,
            WorkflowState, WorkflowStatus, StageState, StageStatus,

            // === Agent Types ===
            agent::ListAgentsResponse,
            AgentSummary, AgentDescriptor, AgentStatsSnapshot, Capability,

            // === Envelope Types ===
            envelope::RouteEnvelopeResponse, envelope::RouteStatus, DropReason,

            // === Scan Types ===
            scan::StartScanRequest, scan::StartScanResponse,

            // === Health Types ===
            health::HealthResponse, health::HealthStatus, health::HealthDetails,
            health::ComponentHealth,
        )
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate OpenAPI spec as JSON string.
    pub fn to_json() -> Result<String, serde_json::Error> {
        let openapi = Self::openapi();
        serde_json::to_string_pretty(&openapi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEV_SERVER_URL;

    #[test]
    fn test_openapi_generation() {
        let openapi = ApiDoc::openapi();
        assert_eq!(openapi.info.title, "Conductor API");

        let paths = &openapi.paths.paths;
        for path in [
            "/sessions",
            "/sessions/{id}",
            "/sessions/{target}",
            "/sessions/{id}/fork",
            "/sessions/{id}/usage",
            "/progress",
            "/progress/all",
            "/workflows",
            "/contexts/{id}",
            "/agents",
            "/envelopes",
            "/scan/start",
            "/scan/stop",
            "/health/ready",
        ] {
            assert!(paths.contains_key(path), "missing path {}", path);
        }
    }

    #[test]
    fn test_openapi_servers() -> Result<(), String> {
        let openapi = ApiDoc::openapi();
        let servers = openapi
            .servers
            .as_ref()
            .ok_or_else(|| "OpenAPI servers missing".to_string())?;
        assert!(servers.iter().any(|s| s.url == DEV_SERVER_URL));
        Ok(())
    }

    #[test]
    fn test_openapi_has_schemas() {
        let openapi = ApiDoc::openapi();
        let schemas = &openapi
            .components
            .as_ref()
            .expect("components present")
            .schemas;
        for name in ["ApiError", "ProgressRecord", "CostSummary", "Session"] {
            assert!(schemas.contains_key(name), "missing schema {}", name);
        }
    }

    #[test]
    fn test_to_json() -> Result<(), serde_json::Error> {
        let json = ApiDoc::to_json()?;
        assert!(json.contains("\"openapi\""));
        assert!(json.contains("/scan/start"));
        Ok(())
    }
}
