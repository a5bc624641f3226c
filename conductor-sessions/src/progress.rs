//! Progress aggregation for concurrently running scans.
//!
//! Records are keyed by caller-chosen session ids. Terminal records are kept
//! for a retention window and evicted lazily on the next `upsert` or `get`.

use chrono::Utc;
use conductor_core::{
    ConductorResult, ProgressConfig, ProgressError, ProgressRecord, ProgressSink, ProgressStatus,
    ProgressUpdate, SessionId, StoreError, Timestamp,
};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Session id of the zeroed record returned when nothing is tracked.
pub const DEFAULT_PROGRESS_SESSION: &str = "default";

#[derive(Debug, Clone)]
struct Tracked {
    record: ProgressRecord,
    /// When the record entered a terminal status.
    terminal_since: Option<Timestamp>,
    updated_at: Timestamp,
}

#[derive(Debug)]
pub struct ProgressAggregator {
    retention: Duration,
    records: RwLock<HashMap<SessionId, Tracked>>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(ProgressConfig::default())
    }
}

impl ProgressAggregator {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            retention: config.retention,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> ConductorResult<RwLockReadGuard<'_, HashMap<SessionId, Tracked>>> {
        self.records
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "progress" }.into())
    }

    fn write(&self) -> ConductorResult<RwLockWriteGuard<'_, HashMap<SessionId, Tracked>>> {
        self.records
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "progress" }.into())
    }

    /// Create or shallow-merge the record for `session_id`.
    pub fn upsert(&self, session_id: &str, update: ProgressUpdate) -> ConductorResult<ProgressRecord> {
        self.upsert_at(session_id, update, Utc::now())
    }

    pub fn upsert_at(
        &self,
        session_id: &str,
        update: ProgressUpdate,
        now: Timestamp,
    ) -> ConductorResult<ProgressRecord> {
        let mut records = self.write()?;
        evict(&mut records, self.retention, now);

        let current_status = records
            .get(session_id)
            .map(|t| t.record.status)
            .unwrap_or_default();
        if let Some(next) = update.status {
            if !current_status.can_transition_to(next) {
                return Err(ProgressError::InvalidTransition {
                    session_id: session_id.to_string(),
                    from: current_status.to_string(),
                    to: next.to_string(),
                }
                .into());
            }
        }

        let tracked = records.entry(session_id.to_string()).or_insert_with(|| {
            let mut record = ProgressRecord::idle(session_id);
            record.start_time = Some(now);
            Tracked {
                record,
                terminal_since: None,
                updated_at: now,
            }
        });
        merge(tracked, update, now);
        Ok(tracked.record.clone())
    }

    /// Append one error message, creating the record if needed.
    pub fn record_error(&self, session_id: &str, message: impl Into<String>) -> ConductorResult<()> {
        let now = Utc::now();
        let mut records = self.write()?;
        let tracked = records.entry(session_id.to_string()).or_insert_with(|| {
            let mut record = ProgressRecord::idle(session_id);
            record.start_time = Some(now);
            Tracked {
                record,
                terminal_since: None,
                updated_at: now,
            }
        });
        tracked.record.errors.push(message.into());
        tracked.updated_at = now;
        Ok(())
    }

    /// Explicit record, or the default record when `session_id` is `None`.
    ///
    /// Never fails for unknown ids: a zeroed idle record is returned instead.
    pub fn get(&self, session_id: Option<&str>) -> ConductorResult<ProgressRecord> {
        self.get_at(session_id, Utc::now())
    }

    pub fn get_at(&self, session_id: Option<&str>, now: Timestamp) -> ConductorResult<ProgressRecord> {
        let mut records = self.write()?;
        evict(&mut records, self.retention, now);

        if let Some(id) = session_id {
            return Ok(records
                .get(id)
                .map(|t| t.record.clone())
                .unwrap_or_else(|| ProgressRecord::idle(id)));
        }
        Ok(select_default(&records)
            .map(|t| t.record.clone())
            .unwrap_or_else(|| ProgressRecord::idle(DEFAULT_PROGRESS_SESSION)))
    }

    /// Every tracked record, most recently started first.
    pub fn list(&self) -> ConductorResult<Vec<ProgressRecord>> {
        let mut all: Vec<ProgressRecord> = self.read()?.values().map(|t| t.record.clone()).collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(all)
    }

    /// Drop every record. Returns how many were cleared.
    pub fn reset(&self) -> ConductorResult<usize> {
        let mut records = self.write()?;
        let cleared = records.len();
        records.clear();
        tracing::debug!(cleared, "Progress records reset");
        Ok(cleared)
    }

    /// Evict terminal records past the retention window.
    pub fn evict_expired(&self) -> ConductorResult<usize> {
        self.evict_expired_at(Utc::now())
    }

    pub fn evict_expired_at(&self, now: Timestamp) -> ConductorResult<usize> {
        let mut records = self.write()?;
        Ok(evict(&mut records, self.retention, now))
    }

    pub fn len(&self) -> ConductorResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> ConductorResult<bool> {
        Ok(self.read()?.is_empty())
    }
}

impl ProgressSink for ProgressAggregator {
    fn report(&self, session_id: &str, update: ProgressUpdate) -> ConductorResult<ProgressRecord> {
        self.upsert(session_id, update)
    }

    fn report_error(&self, session_id: &str, message: String) -> ConductorResult<()> {
        self.record_error(session_id, message)
    }
}

fn merge(tracked: &mut Tracked, update: ProgressUpdate, now: Timestamp) {
    let record = &mut tracked.record;
    let was_terminal = record.status.is_terminal();

    if let Some(v) = update.total_entities {
        record.total_entities = v;
    }
    if let Some(v) = update.processed_entities {
        record.processed_entities = v;
    }
    if let Some(v) = update.total_batches {
        record.total_batches = v;
    }
    if let Some(v) = update.current_batch {
        record.current_batch = v;
    }
    if let Some(v) = update.opportunities_found {
        record.opportunities_found = v;
    }
    if let Some(v) = update.status {
        record.status = v;
    }
    if let Some(v) = update.start_time {
        record.start_time = Some(v);
    }
    if let Some(v) = update.end_time {
        record.end_time = Some(v);
    }
    if let Some(v) = update.current_entity {
        record.current_entity = Some(v);
    }
    if let Some(v) = update.errors {
        record.errors = v;
    }

    if record.total_entities > 0 {
        record.processed_entities = record.processed_entities.min(record.total_entities);
    }
    if record.total_batches > 0 {
        record.current_batch = record.current_batch.min(record.total_batches);
    }

    if record.status.is_terminal() && !was_terminal {
        tracked.terminal_since = Some(now);
        if record.end_time.is_none() {
            record.end_time = Some(now);
        }
        tracing::debug!(
            session_id = %record.session_id,
            status = %record.status,
            processed = record.processed_entities,
            "Progress record finished"
        );
    }
    tracked.updated_at = now;
}

/// Newest non-terminal record by start time, else the most recently
/// finished one.
fn select_default(records: &HashMap<SessionId, Tracked>) -> Option<&Tracked> {
    let live = records
        .values()
        .filter(|t| !t.record.status.is_terminal())
        .max_by(|a, b| {
            a.record
                .start_time
                .cmp(&b.record.start_time)
                .then(a.updated_at.cmp(&b.updated_at))
        });
    if live.is_some() {
        return live;
    }
    records
        .values()
        .max_by(|a, b| a.terminal_since.cmp(&b.terminal_since))
}

fn evict(records: &mut HashMap<SessionId, Tracked>, retention: Duration, now: Timestamp) -> usize {
    let before = records.len();
    records.retain(|_, t| match t.terminal_since {
        Some(since) => (now - since)
            .to_std()
            .map(|age| age <= retention)
            .unwrap_or(true),
        None => true,
    });
    let evicted = before - records.len();
    if evicted > 0 {
        tracing::debug!(evicted, "Evicted finished progress records");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_test_utils::assertions;

    fn starting(total: u64) -> ProgressUpdate {
        ProgressUpdate::status(ProgressStatus::Starting).with_totals(total, 0)
    }

    #[test]
    fn test_upsert_merges_shallowly() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        progress.upsert(
            "scanA",
            ProgressUpdate::status(ProgressStatus::Starting)
                .with_totals(100, 0)
                .with_processed(0),
        )?;
        progress.upsert("scanA", ProgressUpdate::default().with_processed(25))?;

        let record = progress.get(Some("scanA"))?;
        assert_eq!(record.total_entities, 100);
        assert_eq!(record.processed_entities, 25);
        assert_eq!(record.status, ProgressStatus::Starting);
        assert!(record.start_time.is_some());
        Ok(())
    }

    #[test]
    fn test_new_record_defaults() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        let record = progress.upsert("scan", ProgressUpdate::default().with_opportunities(3))?;
        assert_eq!(record.status, ProgressStatus::Idle);
        assert_eq!(record.total_entities, 0);
        assert_eq!(record.opportunities_found, 3);
        Ok(())
    }

    #[test]
    fn test_default_prefers_latest_live_start() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(5);
        progress.upsert_at("older", ProgressUpdate::status(ProgressStatus::Running), t1)?;
        progress.upsert_at("newer", ProgressUpdate::status(ProgressStatus::Running), t2)?;
        // Later activity on the older scan does not change the pick.
        progress.upsert_at("older", ProgressUpdate::default().with_processed(9), t2)?;

        assert_eq!(progress.get_at(None, t2)?.session_id, "newer");
        Ok(())
    }

    #[test]
    fn test_default_falls_back_to_latest_finished() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        let t0 = Utc::now();
        progress.upsert_at("a", ProgressUpdate::status(ProgressStatus::Running), t0)?;
        progress.upsert_at("b", ProgressUpdate::status(ProgressStatus::Running), t0)?;
        progress.upsert_at("b", ProgressUpdate::status(ProgressStatus::Completed), t0 + chrono::Duration::seconds(1))?;
        progress.upsert_at("a", ProgressUpdate::status(ProgressStatus::Stopped), t0 + chrono::Duration::seconds(2))?;

        assert_eq!(progress.get_at(None, t0 + chrono::Duration::seconds(3))?.session_id, "a");
        Ok(())
    }

    #[test]
    fn test_empty_and_unknown_return_idle() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        let record = progress.get(None)?;
        assert_eq!(record.session_id, DEFAULT_PROGRESS_SESSION);
        assert_eq!(record.status, ProgressStatus::Idle);

        let unknown = progress.get(Some("nope"))?;
        assert_eq!(unknown.session_id, "nope");
        assert_eq!(unknown.processed_entities, 0);
        assert!(progress.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_status_must_move_forward() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        progress.upsert("scan", ProgressUpdate::status(ProgressStatus::Running))?;
        progress.upsert("scan", ProgressUpdate::status(ProgressStatus::Paused))?;
        progress.upsert("scan", ProgressUpdate::status(ProgressStatus::Running))?;
        assertions::assert_invalid_transition(
            &progress.upsert("scan", ProgressUpdate::status(ProgressStatus::Starting)),
        );
        progress.upsert("scan", ProgressUpdate::status(ProgressStatus::Completed))?;
        assertions::assert_invalid_transition(
            &progress.upsert("scan", ProgressUpdate::status(ProgressStatus::Running)),
        );
        // A rejected update leaves the record untouched.
        assert_eq!(progress.get(Some("scan"))?.status, ProgressStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_counters_clamped_to_totals() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        progress.upsert("scan", ProgressUpdate::default().with_totals(10, 2))?;
        let record = progress.upsert(
            "scan",
            ProgressUpdate::default().with_processed(15).with_batch(4),
        )?;
        assert_eq!(record.processed_entities, 10);
        assert_eq!(record.current_batch, 2);
        Ok(())
    }

    #[test]
    fn test_terminal_status_stamps_end_time() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        progress.upsert("scan", starting(4))?;
        let record = progress.upsert("scan", ProgressUpdate::status(ProgressStatus::Error))?;
        assert!(record.end_time.is_some());
        assert!(record.end_time >= record.start_time);
        Ok(())
    }

    #[test]
    fn test_finished_records_evicted_lazily() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        let t0 = Utc::now();
        progress.upsert_at("done", ProgressUpdate::status(ProgressStatus::Completed), t0)?;
        progress.upsert_at("live", ProgressUpdate::status(ProgressStatus::Running), t0)?;

        let within = t0 + chrono::Duration::minutes(4);
        assert_eq!(progress.get_at(Some("done"), within)?.status, ProgressStatus::Completed);

        let after = t0 + chrono::Duration::minutes(6);
        assert_eq!(progress.get_at(Some("done"), after)?.status, ProgressStatus::Idle);
        assert_eq!(progress.len()?, 1);
        assert_eq!(progress.get_at(None, after)?.session_id, "live");
        Ok(())
    }

    #[test]
    fn test_reset_and_errors() -> ConductorResult<()> {
        let progress = ProgressAggregator::default();
        progress.upsert("a", starting(1))?;
        progress.record_error("a", "timeout on acme.io")?;
        assert_eq!(progress.get(Some("a"))?.errors, vec!["timeout on acme.io".to_string()]);

        assert_eq!(progress.reset()?, 1);
        assert!(progress.is_empty()?);
        Ok(())
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use conductor_test_utils::generators::{arb_counter_update, arb_progress_status};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_counters_never_exceed_known_totals(
            updates in proptest::collection::vec(arb_counter_update(), 1..20),
        ) {
            let progress = ProgressAggregator::default();
            for update in updates {
                let record = progress.upsert("scan", update).map_err(|e| TestCaseError::fail(e.to_string()))?;
                if record.total_entities > 0 {
                    prop_assert!(record.processed_entities <= record.total_entities);
                }
                if record.total_batches > 0 {
                    prop_assert!(record.current_batch <= record.total_batches);
                }
            }
        }

        #[test]
        fn prop_accepted_statuses_are_monotonic(
            statuses in proptest::collection::vec(arb_progress_status(), 1..12),
        ) {
            let progress = ProgressAggregator::default();
            let mut last = ProgressStatus::Idle;
            for status in statuses {
                match progress.upsert("scan", ProgressUpdate::status(status)) {
                    Ok(record) => {
                        prop_assert!(last.can_transition_to(record.status));
                        last = record.status;
                    }
                    Err(_) => prop_assert!(!last.can_transition_to(status)),
                }
            }
        }
    }
}
