//! Store Maintenance Background Task
//!
//! Periodically sweeps the in-memory stores so they stay bounded:
//!
//! - Sessions idle longer than the configured timeout are removed
//! - Progress records past their retention are evicted
//! - Closed contexts past their retention are evicted
//!
//! Sessions are swept on their own interval; progress and contexts share the
//! eviction interval. A failing sweep is logged and counted, never fatal.

use conductor_agents::Orchestrator;
use conductor_core::{SessionConfig, Timestamp};
use conductor_sessions::{ProgressAggregator, SessionManager};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::constants::DEFAULT_EVICTION_INTERVAL_SECS;
use crate::state::AppState;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the maintenance background task.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often idle sessions are removed
    pub session_interval: Duration,

    /// How often progress records and closed contexts are evicted
    pub eviction_interval: Duration,

    /// Whether to log each expired session (default: true)
    pub log_evictions: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self::new(&SessionConfig::default(), Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS))
    }
}

impl MaintenanceConfig {
    pub fn new(sessions: &SessionConfig, eviction_interval: Duration) -> Self {
        Self {
            session_interval: sessions.cleanup_interval,
            eviction_interval,
            log_evictions: true,
        }
    }

    /// Short intervals for development and tests.
    pub fn development() -> Self {
        Self {
            session_interval: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(5),
            log_evictions: true,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for maintenance activity since startup.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub sessions_expired: AtomicU64,
    pub progress_evicted: AtomicU64,
    pub contexts_evicted: AtomicU64,
    pub cycles: AtomicU64,
    pub errors: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            progress_evicted: self.progress_evicted.load(Ordering::Relaxed),
            contexts_evicted: self.contexts_evicted.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of maintenance metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub sessions_expired: u64,
    pub progress_evicted: u64,
    pub contexts_evicted: u64,
    pub cycles: u64,
    pub errors: u64,
}

// ============================================================================
// STORES
// ============================================================================

/// The stores swept by the maintenance task.
#[derive(Clone)]
pub struct MaintenanceTargets {
    pub orchestrator: Arc<Orchestrator>,
    pub sessions: Arc<SessionManager>,
    pub progress: Arc<ProgressAggregator>,
}

impl From<&AppState> for MaintenanceTargets {
    fn from(state: &AppState) -> Self {
        Self {
            orchestrator: state.orchestrator.clone(),
            sessions: state.sessions.clone(),
            progress: state.progress.clone(),
        }
    }
}

impl MaintenanceTargets {
    /// Remove idle sessions as of `now`.
    pub fn sweep_sessions_at(
        &self,
        now: Timestamp,
        config: &MaintenanceConfig,
        metrics: &MaintenanceMetrics,
    ) -> u64 {
        match self.sessions.cleanup_expired_at(now) {
            Ok(expired) => {
                if config.log_evictions {
                    for session_id in &expired {
                        tracing::info!(session_id = %session_id, "Idle session expired");
                    }
                }
                let count = expired.len() as u64;
                metrics.sessions_expired.fetch_add(count, Ordering::Relaxed);
                count
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to clean up idle sessions");
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Evict expired progress records and closed contexts as of `now`.
    pub fn evict_at(&self, now: Timestamp, metrics: &MaintenanceMetrics) -> (u64, u64) {
        let progress = match self.progress.evict_expired_at(now) {
            Ok(count) => count as u64,
            Err(e) => {
                tracing::error!(error = %e, "Failed to evict progress records");
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        };
        let contexts = match self.orchestrator.evict_expired_at(now) {
            Ok(count) => count as u64,
            Err(e) => {
                tracing::error!(error = %e, "Failed to evict closed contexts");
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        };

        metrics.progress_evicted.fetch_add(progress, Ordering::Relaxed);
        metrics.contexts_evicted.fetch_add(contexts, Ordering::Relaxed);
        if progress > 0 || contexts > 0 {
            tracing::debug!(progress, contexts, "Eviction cycle completed");
        } else {
            tracing::trace!("Eviction cycle completed with nothing to evict");
        }
        (progress, contexts)
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that sweeps the stores until the shutdown signal fires.
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn maintenance_task(
    targets: MaintenanceTargets,
    config: MaintenanceConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<MaintenanceMetrics> {
    let metrics = Arc::new(MaintenanceMetrics::new());

    let mut session_interval = interval(config.session_interval);
    session_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut eviction_interval = interval(config.eviction_interval);
    eviction_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        session_interval_secs = config.session_interval.as_secs(),
        eviction_interval_secs = config.eviction_interval.as_secs(),
        "Maintenance task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Maintenance task shutting down");
                    break;
                }
            }

            _ = session_interval.tick() => {
                metrics.cycles.fetch_add(1, Ordering::Relaxed);
                targets.sweep_sessions_at(chrono::Utc::now(), &config, &metrics);
            }

            _ = eviction_interval.tick() => {
                metrics.cycles.fetch_add(1, Ordering::Relaxed);
                targets.evict_at(chrono::Utc::now(), &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sessions_expired = snapshot.sessions_expired,
        progress_evicted = snapshot.progress_evicted,
        contexts_evicted = snapshot.contexts_evicted,
        cycles = snapshot.cycles,
        errors = snapshot.errors,
        "Maintenance task completed"
    );

    metrics
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ConductorConfig, ConductorResult, ProgressStatus, ProgressUpdate};

    fn targets() -> ConductorResult<(AppState, MaintenanceTargets)> {
        let state = AppState::new(ConductorConfig::development())?;
        let targets = MaintenanceTargets::from(&state);
        Ok((state, targets))
    }

    #[test]
    fn test_config_default_follows_session_config() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.session_interval, SessionConfig::default().cleanup_interval);
        assert_eq!(
            config.eviction_interval,
            Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS)
        );
        assert!(config.log_evictions);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = MaintenanceMetrics::new();
        metrics.sessions_expired.store(2, Ordering::Relaxed);
        metrics.contexts_evicted.store(4, Ordering::Relaxed);
        metrics.cycles.store(7, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_expired, 2);
        assert_eq!(snapshot.progress_evicted, 0);
        assert_eq!(snapshot.contexts_evicted, 4);
        assert_eq!(snapshot.cycles, 7);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_sessions() -> ConductorResult<()> {
        let (state, targets) = targets()?;
        let session_id = state.sessions.create_or_resume(None)?;
        let metrics = MaintenanceMetrics::new();
        let config = MaintenanceConfig::development();

        let now = chrono::Utc::now();
        assert_eq!(targets.sweep_sessions_at(now, &config, &metrics), 0);

        let later = now + chrono::Duration::days(2);
        assert_eq!(targets.sweep_sessions_at(later, &config, &metrics), 1);
        assert!(state.sessions.get(&session_id).is_err());
        assert_eq!(metrics.snapshot().sessions_expired, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_evict_removes_finished_progress_only() -> ConductorResult<()> {
        let (state, targets) = targets()?;
        state
            .progress
            .upsert("scanA", ProgressUpdate::status(ProgressStatus::Completed))?;
        state
            .progress
            .upsert("scanB", ProgressUpdate::status(ProgressStatus::Running))?;
        let metrics = MaintenanceMetrics::new();

        let later = chrono::Utc::now() + chrono::Duration::days(2);
        let (progress, contexts) = targets.evict_at(later, &metrics);
        assert_eq!(progress, 1);
        assert_eq!(contexts, 0);
        assert_eq!(state.progress.len()?, 1);
        assert_eq!(metrics.snapshot().progress_evicted, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() -> ConductorResult<()> {
        let (_state, targets) = targets()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(maintenance_task(
            targets,
            MaintenanceConfig::development(),
            shutdown_rx,
        ));

        tokio::task::yield_now().await;
        shutdown_tx.send_replace(true);
        let metrics = handle.await.expect("maintenance task panicked");
        assert_eq!(metrics.snapshot().errors, 0);
        Ok(())
    }
}
