//! Context store: the envelope history of each causally related exchange.

use chrono::Utc;
use conductor_core::{
    ConductorResult, ContextId, Envelope, StoreError, Timestamp, WorkflowError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Active,
    /// New envelopes are parked until the context is resumed.
    Paused,
    Closed,
}

/// Ordered envelope history of one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub context_id: ContextId,
    pub envelopes: Vec<Envelope>,
    pub start_time: Timestamp,
    pub last_update: Timestamp,
    pub status: ContextStatus,
    /// Envelopes routed while paused, in arrival order.
    pub parked: Vec<Envelope>,
    /// Workflow driving this context, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

impl Context {
    fn new(context_id: ContextId, now: Timestamp) -> Self {
        Self {
            context_id,
            envelopes: Vec::new(),
            start_time: now,
            last_update: now,
            status: ContextStatus::Active,
            parked: Vec::new(),
            workflow: None,
        }
    }
}

/// Result of offering an envelope to its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Appended to the history; deliver it.
    Open,
    /// Context is paused; the envelope was parked.
    Parked,
}

/// Lock-guarded table of contexts.
#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: RwLock<HashMap<ContextId, Context>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ConductorResult<RwLockReadGuard<'_, HashMap<ContextId, Context>>> {
        self.contexts
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "context" }.into())
    }

    fn write(&self) -> ConductorResult<RwLockWriteGuard<'_, HashMap<ContextId, Context>>> {
        self.contexts
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "context" }.into())
    }

    /// Create a context for a workflow run.
    pub fn open(&self, context_id: ContextId, workflow: Option<String>) -> ConductorResult<()> {
        let mut contexts = self.write()?;
        let context = contexts
            .entry(context_id)
            .or_insert_with(|| Context::new(context_id, Utc::now()));
        context.workflow = workflow;
        Ok(())
    }

    /// Record a routed envelope, creating the context on first reference.
    pub fn admit(&self, envelope: &Envelope) -> ConductorResult<Admission> {
        let now = Utc::now();
        let mut contexts = self.write()?;
        let context = contexts
            .entry(envelope.context_id)
            .or_insert_with(|| Context::new(envelope.context_id, now));
        context.last_update = now;
        if context.status == ContextStatus::Paused {
            context.parked.push(envelope.clone());
            return Ok(Admission::Parked);
        }
        context.envelopes.push(envelope.clone());
        Ok(Admission::Open)
    }

    /// Pause an active context. Pausing a closed context has no effect.
    pub fn pause(&self, context_id: ContextId) -> ConductorResult<ContextStatus> {
        let mut contexts = self.write()?;
        let context = contexts
            .get_mut(&context_id)
            .ok_or(WorkflowError::ContextNotFound { context_id })?;
        if context.status == ContextStatus::Active {
            context.status = ContextStatus::Paused;
            context.last_update = Utc::now();
        }
        Ok(context.status)
    }

    /// Resume a paused context and hand back its parked envelopes in order.
    pub fn resume(&self, context_id: ContextId) -> ConductorResult<Vec<Envelope>> {
        let mut contexts = self.write()?;
        let context = contexts
            .get_mut(&context_id)
            .ok_or(WorkflowError::ContextNotFound { context_id })?;
        if context.status != ContextStatus::Paused {
            return Ok(Vec::new());
        }
        context.status = ContextStatus::Active;
        context.last_update = Utc::now();
        Ok(std::mem::take(&mut context.parked))
    }

    /// Close a context. Parked envelopes are discarded and returned.
    pub fn close(&self, context_id: ContextId) -> ConductorResult<Vec<Envelope>> {
        let mut contexts = self.write()?;
        let context = contexts
            .get_mut(&context_id)
            .ok_or(WorkflowError::ContextNotFound { context_id })?;
        context.status = ContextStatus::Closed;
        context.last_update = Utc::now();
        Ok(std::mem::take(&mut context.parked))
    }

    pub fn get(&self, context_id: ContextId) -> ConductorResult<Option<Context>> {
        Ok(self.read()?.get(&context_id).cloned())
    }

    pub fn status(&self, context_id: ContextId) -> ConductorResult<Option<ContextStatus>> {
        Ok(self.read()?.get(&context_id).map(|c| c.status))
    }

    pub fn len(&self) -> ConductorResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> ConductorResult<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Remove closed contexts whose last update is older than `retention`.
    ///
    /// Returns the evicted ids. Active and paused contexts are never evicted.
    pub fn evict_closed_at(
        &self,
        now: Timestamp,
        retention: Duration,
    ) -> ConductorResult<Vec<ContextId>> {
        let mut contexts = self.write()?;
        let expired: Vec<ContextId> = contexts
            .values()
            .filter(|c| c.status == ContextStatus::Closed && older_than(now, c.last_update, retention))
            .map(|c| c.context_id)
            .collect();
        for id in &expired {
            contexts.remove(id);
        }
        Ok(expired)
    }
}

fn older_than(now: Timestamp, then: Timestamp, age: Duration) -> bool {
    (now - then).to_std().map(|elapsed| elapsed > age).unwrap_or(false)
}
