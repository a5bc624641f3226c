//! Conductor API Server Entry Point
//!
//! Bootstraps configuration and tracing, builds the in-memory stores,
//! spawns store maintenance and serves the Axum router until Ctrl-C.

use std::time::Duration;

use axum::Router;
use conductor_api::{
    create_api_router, init_tracer, maintenance_task, ApiConfig, ApiError, ApiResult, AppState,
    MaintenanceConfig, MaintenanceTargets, TelemetryConfig,
};
use conductor_core::ConductorConfig;
use tokio::sync::watch;

/// How long shutdown waits for the maintenance task to report.
const MAINTENANCE_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ApiResult<()> {
    let api_config = ApiConfig::from_env();
    init_tracer(&TelemetryConfig::from_env(api_config.log_format))?;

    let conductor_config = ConductorConfig::from_env();
    let maintenance_config =
        MaintenanceConfig::new(&conductor_config.session, api_config.eviction_interval);
    let state = AppState::new(conductor_config)?;

    if state.orchestrator.agents().is_empty() {
        tracing::warn!("No worker agents registered; envelopes will be dropped until agents are added");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = tokio::spawn(maintenance_task(
        MaintenanceTargets::from(&state),
        maintenance_config,
        shutdown_rx,
    ));

    let app: Router = create_api_router(state.clone(), &api_config);

    let addr = api_config.bind_addr()?;
    tracing::info!(%addr, "Starting Conductor API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    shutdown_tx.send_replace(true);
    match tokio::time::timeout(MAINTENANCE_SHUTDOWN_GRACE, maintenance).await {
        Ok(Ok(metrics)) => {
            let snapshot = metrics.snapshot();
            tracing::info!(
                sessions_expired = snapshot.sessions_expired,
                contexts_evicted = snapshot.contexts_evicted,
                "Maintenance stopped"
            );
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "Maintenance task aborted"),
        Err(_) => tracing::warn!("Maintenance task did not stop in time"),
    }

    state.shutdown().await;
    tracing::info!("Conductor API stopped");
    Ok(())
}
