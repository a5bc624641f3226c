//! Progress model for long-running scan operations.

use serde::{Deserialize, Serialize};

use crate::error::ConductorResult;
use crate::identity::{SessionId, Timestamp};

/// Status of a scan operation.
///
/// Transitions are monotonic by [`ProgressStatus::rank`], except that
/// `Running` and `Paused` may alternate. Terminal states are final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Stopped | ProgressStatus::Completed | ProgressStatus::Error
        )
    }

    /// Position in the lifecycle. Running and paused share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            ProgressStatus::Idle => 0,
            ProgressStatus::Starting => 1,
            ProgressStatus::Running | ProgressStatus::Paused => 2,
            ProgressStatus::Stopped | ProgressStatus::Completed | ProgressStatus::Error => 3,
        }
    }

    /// Whether a record in this status may move to `next`.
    pub fn can_transition_to(&self, next: ProgressStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Idle => "idle",
            ProgressStatus::Starting => "starting",
            ProgressStatus::Running => "running",
            ProgressStatus::Paused => "paused",
            ProgressStatus::Stopped => "stopped",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live status snapshot of one long-running batch scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub session_id: SessionId,
    pub total_entities: u64,
    pub processed_entities: u64,
    pub current_batch: u64,
    pub total_batches: u64,
    pub opportunities_found: u64,
    pub status: ProgressStatus,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub start_time: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub end_time: Option<Timestamp>,
    pub current_entity: Option<String>,
    pub errors: Vec<String>,
}

impl ProgressRecord {
    /// Zeroed idle record.
    pub fn idle(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            total_entities: 0,
            processed_entities: 0,
            current_batch: 0,
            total_batches: 0,
            opportunities_found: 0,
            status: ProgressStatus::Idle,
            start_time: None,
            end_time: None,
            current_entity: None,
            errors: Vec::new(),
        }
    }

    /// Completion percentage in `[0, 100]`, 0 when the total is unknown.
    pub fn percent_complete(&self) -> f64 {
        if self.total_entities == 0 {
            return 0.0;
        }
        (self.processed_entities as f64 / self.total_entities as f64) * 100.0
    }
}

/// Partial update to a progress record. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_entities: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_entities: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_batch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_batches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunities_found: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProgressStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub start_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub end_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl ProgressUpdate {
    pub fn status(status: ProgressStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_totals(mut self, total_entities: u64, total_batches: u64) -> Self {
        self.total_entities = Some(total_entities);
        self.total_batches = Some(total_batches);
        self
    }

    pub fn with_processed(mut self, processed_entities: u64) -> Self {
        self.processed_entities = Some(processed_entities);
        self
    }

    pub fn with_batch(mut self, current_batch: u64) -> Self {
        self.current_batch = Some(current_batch);
        self
    }

    pub fn with_opportunities(mut self, opportunities_found: u64) -> Self {
        self.opportunities_found = Some(opportunities_found);
        self
    }

    pub fn with_current_entity(mut self, current_entity: impl Into<String>) -> Self {
        self.current_entity = Some(current_entity.into());
        self
    }
}

/// Destination for progress reports from a scan loop.
pub trait ProgressSink: Send + Sync {
    /// Merge `update` into the record for `session_id`.
    fn report(&self, session_id: &str, update: ProgressUpdate) -> ConductorResult<ProgressRecord>;

    /// Append one error message to the record for `session_id`.
    fn report_error(&self, session_id: &str, message: String) -> ConductorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ProgressStatus::Stopped.is_terminal());
        assert!(ProgressStatus::Completed.is_terminal());
        assert!(ProgressStatus::Error.is_terminal());
        assert!(!ProgressStatus::Running.is_terminal());
        assert!(!ProgressStatus::Idle.is_terminal());
    }

    #[test]
    fn test_running_paused_alternate() {
        assert!(ProgressStatus::Running.can_transition_to(ProgressStatus::Paused));
        assert!(ProgressStatus::Paused.can_transition_to(ProgressStatus::Running));
    }

    #[test]
    fn test_no_backward_transitions() {
        assert!(!ProgressStatus::Running.can_transition_to(ProgressStatus::Starting));
        assert!(!ProgressStatus::Starting.can_transition_to(ProgressStatus::Idle));
        assert!(!ProgressStatus::Completed.can_transition_to(ProgressStatus::Running));
        assert!(!ProgressStatus::Completed.can_transition_to(ProgressStatus::Error));
        assert!(ProgressStatus::Completed.can_transition_to(ProgressStatus::Completed));
        assert!(ProgressStatus::Idle.can_transition_to(ProgressStatus::Completed));
    }

    #[test]
    fn test_percent_complete() {
        let mut record = ProgressRecord::idle("scan");
        assert_eq!(record.percent_complete(), 0.0);
        record.total_entities = 200;
        record.processed_entities = 50;
        assert!((record.percent_complete() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_wire_format() -> Result<(), serde_json::Error> {
        let update: ProgressUpdate =
            serde_json::from_str(r#"{"totalEntities": 100, "status": "starting"}"#)?;
        assert_eq!(update.total_entities, Some(100));
        assert_eq!(update.status, Some(ProgressStatus::Starting));
        assert!(update.processed_entities.is_none());
        Ok(())
    }
}
