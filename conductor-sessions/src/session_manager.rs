//! Session lifecycle and idempotent usage accounting.

use chrono::Utc;
use conductor_core::{
    new_session_id, ActivityMessage, AgentId, ConductorResult, CostSummary, Envelope,
    EnvelopeObserver, Payload, Session, SessionConfig, SessionError, SessionId, SessionStatus,
    StoreError, Timestamp, UsageRecord, PARENT_SESSION_KEY,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metadata key holding the reason a session failed.
pub const FAILURE_REASON_KEY: &str = "failureReason";

/// Result of a `record_activity` call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum ActivityOutcome {
    /// First sighting of the message id. `cost_usd` is 0 without usage.
    Recorded { cost_usd: f64 },
    /// The message id was already accounted; nothing changed.
    Duplicate,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    records: Vec<UsageRecord>,
    seen: HashSet<String>,
}

impl SessionEntry {
    fn new(session_id: SessionId, now: Timestamp) -> Self {
        Self {
            session: Session::new(session_id, now),
            records: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

/// Lock-guarded session table with per-session usage trackers.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn read(&self) -> ConductorResult<RwLockReadGuard<'_, HashMap<SessionId, SessionEntry>>> {
        self.sessions
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "session" }.into())
    }

    fn write(&self) -> ConductorResult<RwLockWriteGuard<'_, HashMap<SessionId, SessionEntry>>> {
        self.sessions
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "session" }.into())
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Resume `resume` if it names an active session, otherwise start a new one.
    pub fn create_or_resume(&self, resume: Option<&str>) -> ConductorResult<SessionId> {
        self.create_or_resume_at(resume, Utc::now())
    }

    pub fn create_or_resume_at(
        &self,
        resume: Option<&str>,
        now: Timestamp,
    ) -> ConductorResult<SessionId> {
        let mut sessions = self.write()?;

        if let Some(id) = resume {
            if let Some(entry) = sessions.get_mut(id) {
                if entry.session.status == SessionStatus::Active {
                    entry.session.last_activity = now;
                    tracing::debug!(session_id = %id, "Session resumed");
                    return Ok(entry.session.session_id.clone());
                }
                tracing::debug!(
                    session_id = %id,
                    status = %entry.session.status,
                    "Session not active, starting a new one"
                );
            }
        }

        let session_id = new_session_id();
        sessions.insert(session_id.clone(), SessionEntry::new(session_id.clone(), now));
        tracing::info!(session_id = %session_id, "Session created");
        Ok(session_id)
    }

    /// Start a child session that records its parent and has no usage.
    pub fn fork(&self, parent_session_id: &str) -> ConductorResult<SessionId> {
        let now = Utc::now();
        let mut sessions = self.write()?;
        if !sessions.contains_key(parent_session_id) {
            return Err(not_found(parent_session_id));
        }

        let child_id = new_session_id();
        let mut child = SessionEntry::new(child_id.clone(), now);
        child.session.metadata.insert(
            PARENT_SESSION_KEY.to_string(),
            JsonValue::String(parent_session_id.to_string()),
        );
        sessions.insert(child_id.clone(), child);
        tracing::info!(
            session_id = %child_id,
            parent_session_id = %parent_session_id,
            "Session forked"
        );
        Ok(child_id)
    }

    /// Active → paused.
    pub fn pause(&self, session_id: &str) -> ConductorResult<()> {
        self.transition(session_id, SessionStatus::Paused, |from| {
            from == SessionStatus::Active
        })
        .map(|_| ())
    }

    /// Paused → active. Resuming an active session only bumps its activity.
    pub fn resume(&self, session_id: &str) -> ConductorResult<()> {
        self.transition(session_id, SessionStatus::Active, |from| {
            matches!(from, SessionStatus::Paused | SessionStatus::Active)
        })
        .map(|_| ())
    }

    /// Active or paused → completed. Logs a usage summary.
    pub fn complete(&self, session_id: &str) -> ConductorResult<CostSummary> {
        let session = self.transition(session_id, SessionStatus::Completed, |from| {
            matches!(from, SessionStatus::Active | SessionStatus::Paused)
        })?;
        let summary = self.cost_summary(session_id)?;

        let duration_ms = (session.last_activity - session.created_at)
            .num_milliseconds()
            .max(0);
        tracing::info!(
            session_id = %session_id,
            message_count = summary.message_count,
            total_cost = summary.total_cost,
            duration_ms,
            per_agent_cost = ?summary.per_agent_cost,
            "Session completed"
        );
        Ok(summary)
    }

    /// Any state except completed → error.
    pub fn fail(&self, session_id: &str, reason: impl Into<String>) -> ConductorResult<()> {
        let reason = reason.into();
        let mut sessions = self.write()?;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        if entry.session.status == SessionStatus::Completed {
            return Err(invalid_transition(
                session_id,
                entry.session.status,
                SessionStatus::Error,
            ));
        }
        entry.session.status = SessionStatus::Error;
        entry.session.last_activity = Utc::now();
        entry
            .session
            .metadata
            .insert(FAILURE_REASON_KEY.to_string(), JsonValue::String(reason.clone()));
        tracing::warn!(session_id = %session_id, reason = %reason, "Session failed");
        Ok(())
    }

    fn transition(
        &self,
        session_id: &str,
        to: SessionStatus,
        allowed: impl Fn(SessionStatus) -> bool,
    ) -> ConductorResult<Session> {
        let mut sessions = self.write()?;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        let from = entry.session.status;
        if !allowed(from) {
            return Err(invalid_transition(session_id, from, to));
        }
        entry.session.status = to;
        entry.session.last_activity = Utc::now();
        tracing::debug!(session_id = %session_id, from = %from, to = %to, "Session transition");
        Ok(entry.session.clone())
    }

    // ========================================================================
    // ACCOUNTING
    // ========================================================================

    /// Account one message. Repeating a message id changes nothing.
    pub fn record_activity(
        &self,
        session_id: &str,
        message: &ActivityMessage,
    ) -> ConductorResult<ActivityOutcome> {
        self.record_activity_at(session_id, message, Utc::now())
    }

    pub fn record_activity_at(
        &self,
        session_id: &str,
        message: &ActivityMessage,
        now: Timestamp,
    ) -> ConductorResult<ActivityOutcome> {
        let mut sessions = self.write()?;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;

        if !entry.seen.insert(message.message_id.clone()) {
            tracing::debug!(
                session_id = %session_id,
                message_id = %message.message_id,
                "Duplicate message ignored"
            );
            return Ok(ActivityOutcome::Duplicate);
        }

        let session = &mut entry.session;
        session.message_count += 1;
        session.last_activity = now;

        let cost_usd = match message.usage {
            Some(usage) => {
                let cost = self.config.pricing.cost(&usage);
                entry.records.push(UsageRecord {
                    message_id: message.message_id.clone(),
                    timestamp: now,
                    usage,
                    cost_usd: cost,
                    agent: message.agent.clone(),
                    tool: message.tool.clone(),
                });
                session.total_cost += cost;
                cost
            }
            None => 0.0,
        };

        if let Some(agent) = &message.agent {
            let agent_usage = session.agent_usage.entry(agent.clone()).or_default();
            agent_usage.calls += 1;
            agent_usage.duration_ms += message.duration_ms.unwrap_or(0);
            agent_usage.cost += cost_usd;
        }

        Ok(ActivityOutcome::Recorded { cost_usd })
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get(&self, session_id: &str) -> ConductorResult<Session> {
        self.read()?
            .get(session_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| not_found(session_id))
    }

    pub fn status(&self, session_id: &str) -> ConductorResult<SessionStatus> {
        self.read()?
            .get(session_id)
            .map(|e| e.session.status)
            .ok_or_else(|| not_found(session_id))
    }

    pub fn exists(&self, session_id: &str) -> ConductorResult<bool> {
        Ok(self.read()?.contains_key(session_id))
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> ConductorResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self.read()?.values().map(|e| e.session.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    pub fn usage_records(&self, session_id: &str) -> ConductorResult<Vec<UsageRecord>> {
        self.read()?
            .get(session_id)
            .map(|e| e.records.clone())
            .ok_or_else(|| not_found(session_id))
    }

    pub fn cost_summary(&self, session_id: &str) -> ConductorResult<CostSummary> {
        let sessions = self.read()?;
        let entry = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;

        let mut per_agent_cost: HashMap<AgentId, f64> = HashMap::new();
        for record in &entry.records {
            if let Some(agent) = &record.agent {
                *per_agent_cost.entry(agent.clone()).or_insert(0.0) += record.cost_usd;
            }
        }
        let total_cost: f64 = entry.records.iter().map(|r| r.cost_usd).sum();
        let step_count = entry.records.len() as u64;
        let avg_cost_per_step = if step_count == 0 {
            0.0
        } else {
            total_cost / step_count as f64
        };

        Ok(CostSummary {
            session_id: entry.session.session_id.clone(),
            total_cost,
            message_count: entry.session.message_count,
            per_agent_cost,
            step_count,
            avg_cost_per_step,
        })
    }

    pub fn len(&self) -> ConductorResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> ConductorResult<bool> {
        Ok(self.read()?.is_empty())
    }

    // ========================================================================
    // EXPIRY
    // ========================================================================

    /// Delete every session idle for longer than the configured timeout.
    pub fn cleanup_expired(&self) -> ConductorResult<Vec<SessionId>> {
        self.cleanup_expired_at(Utc::now())
    }

    /// Deletion is unconditional: the status of an idle session is ignored.
    pub fn cleanup_expired_at(&self, now: Timestamp) -> ConductorResult<Vec<SessionId>> {
        let idle_timeout = self.config.idle_timeout;
        let mut sessions = self.write()?;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|e| {
                (now - e.session.last_activity)
                    .to_std()
                    .map(|idle| idle > idle_timeout)
                    .unwrap_or(false)
            })
            .map(|e| e.session.session_id.clone())
            .collect();

        for session_id in &expired {
            if let Some(entry) = sessions.remove(session_id) {
                tracing::info!(
                    session_id = %session_id,
                    status = %entry.session.status,
                    total_cost = entry.session.total_cost,
                    "Session expired"
                );
            }
        }
        Ok(expired)
    }
}

impl EnvelopeObserver for SessionManager {
    fn observe(&self, envelope: &Envelope) {
        let Some(session_id) = envelope.session_id.as_deref() else {
            return;
        };
        match self.exists(session_id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(session_id = %session_id, "Envelope for unknown session not accounted");
                return;
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Session lookup failed");
                return;
            }
        }

        let mut message = ActivityMessage::new(envelope.id.to_string());
        if let Payload::Result(result) = &envelope.payload {
            message = message.with_agent(envelope.from.clone());
            if let Some(usage) = result.usage {
                message = message.with_usage(usage);
            }
        }

        if let Err(err) = self.record_activity(session_id, &message) {
            // Reaped between the lookup and the write.
            tracing::debug!(session_id = %session_id, error = %err, "Envelope not accounted");
        }
    }
}

fn not_found(session_id: &str) -> conductor_core::ConductorError {
    SessionError::NotFound {
        session_id: session_id.to_string(),
    }
    .into()
}

fn invalid_transition(
    session_id: &str,
    from: SessionStatus,
    to: SessionStatus,
) -> conductor_core::ConductorError {
    SessionError::InvalidTransition {
        session_id: session_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ConductorError, TokenUsage};
    use conductor_test_utils::{assertions, fixtures};
    use serde_json::json;

    fn usage_message(id: &str) -> ActivityMessage {
        ActivityMessage::new(id).with_usage(fixtures::sample_usage())
    }

    #[test]
    fn test_pricing_scenario_is_idempotent() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let s1 = manager.create_or_resume(None)?;

        let first = manager.record_activity(&s1, &usage_message("m1"))?;
        assert!(matches!(first, ActivityOutcome::Recorded { cost_usd } if (cost_usd - 0.105).abs() < 1e-9));
        assertions::assert_approx(manager.get(&s1)?.total_cost, 0.105);

        assert_eq!(
            manager.record_activity(&s1, &usage_message("m1"))?,
            ActivityOutcome::Duplicate
        );
        let session = manager.get(&s1)?;
        assertions::assert_approx(session.total_cost, 0.105);
        assert_eq!(session.message_count, 1);
        Ok(())
    }

    #[test]
    fn test_agent_breakdown() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let id = manager.create_or_resume(None)?;
        manager.record_activity(&id, &usage_message("m1").with_agent("discovery").with_duration_ms(40))?;
        manager.record_activity(&id, &usage_message("m2").with_agent("discovery").with_duration_ms(60))?;
        manager.record_activity(&id, &ActivityMessage::new("m3").with_agent("intelligence"))?;

        let session = manager.get(&id)?;
        assert_eq!(session.message_count, 3);
        let discovery = session.agent_usage["discovery"];
        assert_eq!(discovery.calls, 2);
        assert_eq!(discovery.duration_ms, 100);
        assertions::assert_approx(discovery.cost, 0.21);
        assert_eq!(session.agent_usage["intelligence"].calls, 1);
        assertions::assert_approx(session.agent_usage["intelligence"].cost, 0.0);
        Ok(())
    }

    #[test]
    fn test_cost_summary() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let id = manager.create_or_resume(None)?;

        let empty = manager.cost_summary(&id)?;
        assert_eq!(empty.step_count, 0);
        assert_eq!(empty.avg_cost_per_step, 0.0);

        manager.record_activity(&id, &usage_message("m1").with_agent("a"))?;
        manager.record_activity(
            &id,
            &ActivityMessage::new("m2")
                .with_agent("b")
                .with_usage(TokenUsage::new(0, 0).with_cache(1000, 0)),
        )?;
        manager.record_activity(&id, &ActivityMessage::new("m3"))?;

        let summary = manager.cost_summary(&id)?;
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.step_count, 2);
        assertions::assert_approx(summary.total_cost, 0.108);
        assertions::assert_approx(summary.avg_cost_per_step, 0.054);
        assertions::assert_approx(summary.per_agent_cost["b"], 0.003);
        Ok(())
    }

    #[test]
    fn test_create_or_resume() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let id = manager.create_or_resume(None)?;
        assert_eq!(manager.create_or_resume(Some(&id))?, id);

        manager.pause(&id)?;
        let fresh = manager.create_or_resume(Some(&id))?;
        assert_ne!(fresh, id);
        assert_eq!(manager.get(&fresh)?.message_count, 0);

        let unknown = manager.create_or_resume(Some("nope"))?;
        assert_ne!(unknown, "nope");
        assert_eq!(manager.len()?, 3);
        Ok(())
    }

    #[test]
    fn test_fork() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let parent = manager.create_or_resume(None)?;
        manager.record_activity(&parent, &usage_message("m1"))?;

        let child = manager.fork(&parent)?;
        let session = manager.get(&child)?;
        assert_eq!(session.parent_session_id(), Some(parent.as_str()));
        assert_eq!(session.total_cost, 0.0);
        assert_eq!(session.message_count, 0);
        Ok(())
    }

    #[test]
    fn test_fork_missing_parent_creates_nothing() -> ConductorResult<()> {
        let manager = SessionManager::default();
        assertions::assert_session_not_found(&manager.fork("ghost"));
        assert!(manager.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_idle_session_expires_after_timeout() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let t0 = Utc::now();
        let id = manager.create_or_resume_at(None, t0)?;

        assert!(manager
            .cleanup_expired_at(t0 + chrono::Duration::minutes(29))?
            .is_empty());
        let reaped = manager.cleanup_expired_at(t0 + chrono::Duration::minutes(31))?;
        assert_eq!(reaped, vec![id.clone()]);
        assertions::assert_session_not_found(&manager.get(&id));
        assertions::assert_session_not_found(&manager.cost_summary(&id));
        Ok(())
    }

    #[test]
    fn test_expiry_ignores_status() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let t0 = Utc::now() - chrono::Duration::hours(2);
        let id = manager.create_or_resume_at(None, t0)?;
        manager.complete(&id)?;
        // complete stamps the real clock; reap relative to it.
        let reaped = manager.cleanup_expired_at(Utc::now() + chrono::Duration::minutes(31))?;
        assert_eq!(reaped, vec![id]);
        Ok(())
    }

    #[test]
    fn test_transitions() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let id = manager.create_or_resume(None)?;

        manager.resume(&id)?;
        manager.pause(&id)?;
        assertions::assert_invalid_transition(&manager.pause(&id));
        manager.resume(&id)?;
        manager.pause(&id)?;
        manager.complete(&id)?;
        assert_eq!(manager.status(&id)?, SessionStatus::Completed);
        assertions::assert_invalid_transition(&manager.resume(&id));
        assertions::assert_invalid_transition(&manager.fail(&id, "late"));

        let other = manager.create_or_resume(None)?;
        manager.fail(&other, "provider outage")?;
        let session = manager.get(&other)?;
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.metadata[FAILURE_REASON_KEY], json!("provider outage"));
        Ok(())
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let manager = SessionManager::default();
        assert!(matches!(
            manager.pause("ghost"),
            Err(ConductorError::Session(SessionError::NotFound { .. }))
        ));
        assertions::assert_session_not_found(&manager.record_activity("ghost", &usage_message("m1")));
    }

    #[test]
    fn test_observer_accounts_result_envelopes_once() -> ConductorResult<()> {
        let manager = SessionManager::default();
        let id = manager.create_or_resume(None)?;

        let task = Envelope::task("orchestrator", "discovery", "discover", json!({})).with_session(id.clone());
        let result = task.success_reply(json!({}), Some(fixtures::sample_usage()));
        manager.observe(&task);
        manager.observe(&result);
        manager.observe(&result);

        let session = manager.get(&id)?;
        assert_eq!(session.message_count, 2);
        assertions::assert_approx(session.total_cost, 0.105);
        assert_eq!(session.agent_usage["discovery"].calls, 1);

        let untracked = Envelope::task("a", "b", "x", json!({})).with_session("unknown");
        manager.observe(&untracked);
        assert_eq!(manager.len()?, 1);
        Ok(())
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use conductor_test_utils::generators::arb_token_usage;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_replay_never_changes_cost(
            usages in proptest::collection::vec(arb_token_usage(), 1..10),
            replays in 1usize..5,
        ) {
            let manager = SessionManager::default();
            let id = manager.create_or_resume(None).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let messages: Vec<ActivityMessage> = usages
                .iter()
                .enumerate()
                .map(|(i, u)| ActivityMessage::new(format!("m{}", i)).with_agent("a").with_usage(*u))
                .collect();

            for message in &messages {
                manager.record_activity(&id, message).map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let before = manager.get(&id).map_err(|e| TestCaseError::fail(e.to_string()))?;

            for _ in 0..replays {
                for message in &messages {
                    let outcome = manager.record_activity(&id, message).map_err(|e| TestCaseError::fail(e.to_string()))?;
                    prop_assert_eq!(outcome, ActivityOutcome::Duplicate);
                }
            }
            let after = manager.get(&id).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(before.total_cost, after.total_cost);
            prop_assert_eq!(before.message_count, after.message_count);
            prop_assert_eq!(before.agent_usage, after.agent_usage);
        }

        #[test]
        fn prop_total_cost_is_sum_of_records(usages in proptest::collection::vec(arb_token_usage(), 0..10)) {
            let manager = SessionManager::default();
            let id = manager.create_or_resume(None).map_err(|e| TestCaseError::fail(e.to_string()))?;
            for (i, usage) in usages.iter().enumerate() {
                manager
                    .record_activity(&id, &ActivityMessage::new(format!("m{}", i)).with_usage(*usage))
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let session = manager.get(&id).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let records = manager.usage_records(&id).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let sum: f64 = records.iter().map(|r| r.cost_usd).sum();
            prop_assert!((session.total_cost - sum).abs() < 1e-6);
        }
    }
}
