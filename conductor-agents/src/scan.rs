//! Batch scan runner.
//!
//! Drives a list of entities through a workflow, one batch at a time, and
//! reports progress through a [`ProgressSink`]. Stopping is cooperative: the
//! stop signal is checked before each entity is launched, and runs already in
//! flight are allowed to finish.

use crate::orchestrator::{Orchestrator, WorkflowHandle};
use crate::workflow::WorkflowStatus;
use conductor_core::{
    ConductorResult, ProgressSink, ProgressStatus, ProgressUpdate, SessionId, ValidationError,
    WorkflowError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Field of a completed run's output holding discovered opportunities.
pub const OPPORTUNITIES_KEY: &str = "opportunities";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub session_id: SessionId,
    pub workflow: String,
    pub entities: Vec<JsonValue>,
    pub batch_size: usize,
}

impl ScanRequest {
    pub fn new(
        session_id: impl Into<SessionId>,
        workflow: impl Into<String>,
        entities: Vec<JsonValue>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workflow: workflow.into(),
            entities,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn total_batches(&self) -> u64 {
        if self.batch_size == 0 {
            return 0;
        }
        self.entities.len().div_ceil(self.batch_size) as u64
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.session_id.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "sessionId".to_string(),
            }
            .into());
        }
        if self.workflow.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "workflow".to_string(),
            }
            .into());
        }
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidValue {
                field: "batchSize".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Totals of a finished scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub processed: u64,
    pub failed: u64,
    pub opportunities: u64,
    pub status: ProgressStatus,
}

/// A scan running in the background.
#[derive(Debug)]
pub struct ScanJob {
    pub session_id: SessionId,
    stop: watch::Sender<bool>,
    join: JoinHandle<ConductorResult<ScanSummary>>,
}

impl ScanJob {
    /// Ask the scan to stop after the runs in flight.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the scan to end. A panicked runner reports as stopped.
    pub async fn join(self) -> ConductorResult<ScanSummary> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(session_id = %self.session_id, error = %err, "Scan task aborted");
                Ok(ScanSummary {
                    processed: 0,
                    failed: 0,
                    opportunities: 0,
                    status: ProgressStatus::Stopped,
                })
            }
        }
    }
}

#[derive(Clone)]
pub struct ScanRunner {
    orchestrator: Arc<Orchestrator>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ScanRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRunner").finish_non_exhaustive()
    }
}

impl ScanRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, sink: Arc<dyn ProgressSink>) -> Self {
        Self { orchestrator, sink }
    }

    /// Run the scan on a background task.
    pub fn spawn(&self, request: ScanRequest) -> ScanJob {
        let (stop, stop_rx) = watch::channel(false);
        let session_id = request.session_id.clone();
        let runner = self.clone();
        let join = tokio::spawn(async move { runner.run(request, stop_rx).await });
        ScanJob {
            session_id,
            stop,
            join,
        }
    }

    pub async fn run(
        &self,
        request: ScanRequest,
        stop: watch::Receiver<bool>,
    ) -> ConductorResult<ScanSummary> {
        request.validate()?;
        let session_id = request.session_id.as_str();
        let total = request.entities.len() as u64;

        self.sink.report(
            session_id,
            ProgressUpdate::status(ProgressStatus::Starting).with_totals(total, request.total_batches()),
        )?;

        if !self.orchestrator.workflows().contains(&request.workflow) {
            let err = WorkflowError::UnknownWorkflow {
                name: request.workflow.clone(),
            };
            self.sink.report_error(session_id, err.to_string())?;
            self.sink
                .report(session_id, ProgressUpdate::status(ProgressStatus::Error))?;
            return Err(err.into());
        }

        self.sink
            .report(session_id, ProgressUpdate::status(ProgressStatus::Running))?;
        tracing::info!(
            session_id = %session_id,
            workflow = %request.workflow,
            entities = total,
            batches = request.total_batches(),
            "Scan started"
        );

        let mut summary = ScanSummary {
            processed: 0,
            failed: 0,
            opportunities: 0,
            status: ProgressStatus::Running,
        };

        'batches: for (index, batch) in request.entities.chunks(request.batch_size).enumerate() {
            self.sink.report(
                session_id,
                ProgressUpdate::default().with_batch(index as u64 + 1),
            )?;

            let mut in_flight: Vec<(String, WorkflowHandle)> = Vec::with_capacity(batch.len());
            for entity in batch {
                let stopping = *stop.borrow();
                if stopping {
                    self.await_batch(session_id, in_flight, &mut summary).await?;
                    summary.status = ProgressStatus::Stopped;
                    break 'batches;
                }
                let label = entity_label(entity);
                match self
                    .orchestrator
                    .launch_workflow(&request.workflow, entity.clone(), Some(request.session_id.clone()))
                    .await
                {
                    Ok(handle) => in_flight.push((label, handle)),
                    Err(err) => {
                        summary.processed += 1;
                        summary.failed += 1;
                        self.sink
                            .report_error(session_id, format!("{}: {}", label, err))?;
                    }
                }
            }
            self.await_batch(session_id, in_flight, &mut summary).await?;
        }

        if summary.status == ProgressStatus::Running {
            summary.status = ProgressStatus::Completed;
        }
        self.sink.report(
            session_id,
            ProgressUpdate::status(summary.status)
                .with_processed(summary.processed)
                .with_opportunities(summary.opportunities),
        )?;
        tracing::info!(
            session_id = %session_id,
            status = %summary.status,
            processed = summary.processed,
            failed = summary.failed,
            opportunities = summary.opportunities,
            "Scan finished"
        );
        Ok(summary)
    }

    async fn await_batch(
        &self,
        session_id: &str,
        in_flight: Vec<(String, WorkflowHandle)>,
        summary: &mut ScanSummary,
    ) -> ConductorResult<()> {
        for (label, handle) in in_flight {
            let state = handle.finished().await;
            summary.processed += 1;
            match state.status {
                WorkflowStatus::Completed => {
                    summary.opportunities += state
                        .final_output
                        .as_ref()
                        .map(count_opportunities)
                        .unwrap_or(0);
                }
                WorkflowStatus::Failed | WorkflowStatus::Running => {
                    summary.failed += 1;
                    let reason = state.error.unwrap_or_else(|| "run did not finish".to_string());
                    self.sink
                        .report_error(session_id, format!("{}: {}", label, reason))?;
                }
            }
            self.sink.report(
                session_id,
                ProgressUpdate::default()
                    .with_processed(summary.processed)
                    .with_opportunities(summary.opportunities)
                    .with_current_entity(label),
            )?;
        }
        Ok(())
    }
}

/// Opportunities in a run's final output.
///
/// Either the output itself carries an `opportunities` array, or it is keyed
/// by terminal stage and each stage output does.
pub fn count_opportunities(output: &JsonValue) -> u64 {
    if let Some(found) = output.get(OPPORTUNITIES_KEY).and_then(JsonValue::as_array) {
        return found.len() as u64;
    }
    match output {
        JsonValue::Object(stages) => stages
            .values()
            .filter_map(|v| v.get(OPPORTUNITIES_KEY).and_then(JsonValue::as_array))
            .map(|found| found.len() as u64)
            .sum(),
        _ => 0,
    }
}

/// Human-readable name of an entity descriptor.
pub fn entity_label(entity: &JsonValue) -> String {
    if let Some(s) = entity.as_str() {
        return s.to_string();
    }
    ["name", "id", "url"]
        .iter()
        .find_map(|key| entity.get(*key))
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
        .unwrap_or_else(|| entity.to_string())
}
