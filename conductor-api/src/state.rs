//! Shared application state for Axum routers.

use std::sync::Arc;

use conductor_agents::{Orchestrator, ScanRunner, WorkerAgent};
use conductor_core::{ConductorConfig, ConductorResult, ProgressSink};
use conductor_sessions::{ProgressAggregator, SessionManager};

use crate::impl_from_ref;
use crate::routes::scan::ScanState;

/// Application-wide state shared across all routes.
///
/// Every store is constructed once here and injected into the handlers, so
/// two states never share records.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConductorConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub sessions: Arc<SessionManager>,
    pub progress: Arc<ProgressAggregator>,
    pub scans: Arc<ScanState>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the stores and wire the Session Manager in as an envelope observer.
    pub fn new(config: ConductorConfig) -> ConductorResult<Self> {
        config.validate()?;

        let orchestrator = Orchestrator::from_config(&config);
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        let progress = Arc::new(ProgressAggregator::new(config.progress.clone()));
        orchestrator.add_observer(sessions.clone())?;

        let sink: Arc<dyn ProgressSink> = progress.clone();
        let runner = ScanRunner::new(orchestrator.clone(), sink);
        let scans = Arc::new(ScanState::new(runner, progress.clone()));

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            sessions,
            progress,
            scans,
            start_time: std::time::Instant::now(),
        })
    }

    /// Register a worker agent with the orchestrator.
    pub async fn register_agent(&self, agent: Arc<dyn WorkerAgent>) -> ConductorResult<()> {
        self.orchestrator.register(agent).await
    }

    /// Stop any running scan and shut the agents down.
    pub async fn shutdown(&self) {
        self.scans.stop().await;
        self.orchestrator.shutdown().await;
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("orchestrator", &self.orchestrator)
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish_non_exhaustive()
    }
}

impl_from_ref!(Arc<Orchestrator>, orchestrator);
impl_from_ref!(Arc<SessionManager>, sessions);
impl_from_ref!(Arc<ProgressAggregator>, progress);
impl_from_ref!(Arc<ScanState>, scans);
