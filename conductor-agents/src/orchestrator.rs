//! Orchestrator: agent registry, routing, contexts and workflow sequencing.
//!
//! The orchestrator never touches agent internals. It owns outbound routing
//! only: envelopes go into agent mailboxes, replies come back on a single
//! reply channel and are routed like any other envelope. Results addressed to
//! [`ORCHESTRATOR_ID`] feed the workflow state table, which emits the next
//! stage's tasks.

use crate::agent::{AgentDescriptor, WorkerAgent};
use crate::context::{Admission, Context, ContextStatus, ContextStore};
use crate::runtime::{AgentHandle, AgentStatsSnapshot, ReplySender};
use crate::workflow::{WorkflowDefinition, WorkflowRun, WorkflowState, WorkflowStatus};
use conductor_core::{
    new_entity_id, AgentError, AgentId, AgentRuntimeConfig, AlertSeverity, ConductorConfig,
    ConductorResult, ContextConfig, ContextId, Envelope, EnvelopeId, EnvelopeObserver, ErrorKind,
    MessageKind, Payload, Priority, SessionId, StoreError, Timestamp, WorkflowError,
    ORCHESTRATOR_ID,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{broadcast, mpsc, watch};

/// Capacity of the orchestrator event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// OUTCOMES AND EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    UnknownDestination,
    AgentUnavailable,
}

/// What happened to a routed envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Handed to the destination's mailbox (or consumed by the orchestrator).
    Delivered,
    /// Parked in a paused context.
    Parked,
    Dropped(DropReason),
    /// Unknown destination and the sender wanted a reply: the error result.
    Bounced(Box<Envelope>),
}

/// Notifications about routing and workflow progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    EnvelopeRouted {
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        envelope_id: EnvelopeId,
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        context_id: ContextId,
        to: AgentId,
        kind: MessageKind,
    },
    EnvelopeParked {
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        envelope_id: EnvelopeId,
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        context_id: ContextId,
    },
    EnvelopeDropped {
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        envelope_id: EnvelopeId,
        to: AgentId,
        reason: DropReason,
    },
    StageCompleted {
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        context_id: ContextId,
        workflow: String,
        stage: String,
    },
    WorkflowCompleted {
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        context_id: ContextId,
        workflow: String,
    },
    WorkflowFailed {
        #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
        context_id: ContextId,
        workflow: String,
        error: String,
    },
}

/// Registered agent with its live counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub descriptor: AgentDescriptor,
    pub stats: AgentStatsSnapshot,
}

/// A started workflow run.
#[derive(Debug)]
pub struct WorkflowHandle {
    pub context_id: ContextId,
    pub state: watch::Receiver<WorkflowState>,
}

impl WorkflowHandle {
    /// Wait until the run completes or fails and return its final state.
    pub async fn finished(mut self) -> WorkflowState {
        loop {
            let current = self.state.borrow_and_update().clone();
            if current.status.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                // Run evicted: the last value is all there is.
                return self.state.borrow().clone();
            }
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator {
    agent_config: AgentRuntimeConfig,
    context_config: ContextConfig,
    agents: DashMap<AgentId, Arc<AgentHandle>>,
    contexts: ContextStore,
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    runs: DashMap<ContextId, WorkflowRun>,
    observers: RwLock<Vec<Arc<dyn EnvelopeObserver>>>,
    events: broadcast::Sender<OrchestratorEvent>,
    replies: ReplySender,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.agents.len())
            .field("workflows", &self.definitions.len())
            .field("runs", &self.runs.len())
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator with the built-in workflows registered.
    ///
    /// Spawns the reply pump, so it must be called inside a tokio runtime.
    pub fn new(agent_config: AgentRuntimeConfig, context_config: ContextConfig) -> Arc<Self> {
        let (replies, reply_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pipeline = WorkflowDefinition::opportunity_pipeline();

        let orchestrator = Arc::new(Self {
            agent_config,
            context_config,
            agents: DashMap::new(),
            contexts: ContextStore::new(),
            definitions: DashMap::new(),
            runs: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            events,
            replies,
        });
        orchestrator
            .definitions
            .insert(pipeline.name.clone(), Arc::new(pipeline));

        tokio::spawn(pump_replies(Arc::downgrade(&orchestrator), reply_rx));
        orchestrator
    }

    pub fn from_config(config: &ConductorConfig) -> Arc<Self> {
        Self::new(config.agent.clone(), config.context.clone())
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Initialize `agent` and start its mailbox.
    pub async fn register(&self, agent: Arc<dyn WorkerAgent>) -> ConductorResult<()> {
        let agent_id = agent.descriptor().agent_id.clone();
        if agent_id == ORCHESTRATOR_ID || self.agents.contains_key(&agent_id) {
            return Err(AgentError::AlreadyRegistered { agent_id }.into());
        }

        agent
            .initialize(&self.agent_config)
            .await
            .map_err(|failure| AgentError::InitializationFailed {
                agent_id: agent_id.clone(),
                reason: failure.message,
            })?;

        match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(_) => Err(AgentError::AlreadyRegistered { agent_id }.into()),
            Entry::Vacant(slot) => {
                let handle = AgentHandle::spawn(agent, &self.agent_config, self.replies.clone());
                tracing::info!(
                    agent_id = %agent_id,
                    agent_type = %handle.descriptor().agent_type,
                    max_concurrent = handle.descriptor().max_concurrent_tasks(),
                    "Agent registered"
                );
                slot.insert(Arc::new(handle));
                Ok(())
            }
        }
    }

    pub fn register_workflow(&self, definition: WorkflowDefinition) -> ConductorResult<()> {
        definition.validate()?;
        match self.definitions.entry(definition.name.clone()) {
            Entry::Occupied(_) => Err(WorkflowError::AlreadyRegistered {
                name: definition.name,
            }
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(definition));
                Ok(())
            }
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn EnvelopeObserver>) -> ConductorResult<()> {
        self.observers
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "observer" })?
            .push(observer);
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .agents
            .iter()
            .map(|entry| AgentSummary {
                descriptor: entry.value().descriptor().clone(),
                stats: entry.value().stats(),
            })
            .collect();
        agents.sort_by(|a, b| a.descriptor.agent_id.cmp(&b.descriptor.agent_id));
        agents
    }

    pub fn agent_stats(&self, agent_id: &str) -> Option<AgentStatsSnapshot> {
        self.agents.get(agent_id).map(|h| h.value().stats())
    }

    pub fn workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Route an envelope to its destination.
    ///
    /// Follow-up envelopes produced on the way (next-stage tasks, bounces
    /// back to the orchestrator) are routed before this returns.
    pub async fn route(&self, envelope: Envelope) -> ConductorResult<RouteOutcome> {
        let mut follow_ups = VecDeque::new();
        let outcome = self.route_one(envelope, &mut follow_ups).await?;
        while let Some(next) = follow_ups.pop_front() {
            let envelope_id = next.id;
            if let Err(err) = self.route_one(next, &mut follow_ups).await {
                tracing::error!(envelope_id = %envelope_id, error = %err, "Failed to route follow-up envelope");
            }
        }
        Ok(outcome)
    }

    async fn route_one(
        &self,
        envelope: Envelope,
        follow_ups: &mut VecDeque<Envelope>,
    ) -> ConductorResult<RouteOutcome> {
        if self.contexts.admit(&envelope)? == Admission::Parked {
            tracing::debug!(
                envelope_id = %envelope.id,
                context_id = %envelope.context_id,
                "Context paused, envelope parked"
            );
            self.emit(OrchestratorEvent::EnvelopeParked {
                envelope_id: envelope.id,
                context_id: envelope.context_id,
            });
            return Ok(RouteOutcome::Parked);
        }

        self.notify_observers(&envelope)?;

        if envelope.to == ORCHESTRATOR_ID {
            self.handle_own(&envelope, follow_ups)?;
            return Ok(RouteOutcome::Delivered);
        }

        let handle = self.agents.get(&envelope.to).map(|h| Arc::clone(h.value()));
        let Some(handle) = handle else {
            return Ok(self.unknown_destination(envelope, follow_ups));
        };

        let (envelope_id, context_id, to, kind) =
            (envelope.id, envelope.context_id, envelope.to.clone(), envelope.kind());
        let unanswered = envelope.requires_response.then(|| envelope.clone());
        match handle.submit(envelope).await {
            Ok(()) => {
                tracing::trace!(envelope_id = %envelope_id, to = %to, "Envelope delivered");
                self.emit(OrchestratorEvent::EnvelopeRouted {
                    envelope_id,
                    context_id,
                    to,
                    kind,
                });
                Ok(RouteOutcome::Delivered)
            }
            Err(err) => {
                tracing::warn!(envelope_id = %envelope_id, error = %err, "Agent unavailable, dropping envelope");
                self.emit(OrchestratorEvent::EnvelopeDropped {
                    envelope_id,
                    to,
                    reason: DropReason::AgentUnavailable,
                });
                // The sender still gets its one reply, so a workflow stage
                // waiting on this agent fails instead of hanging.
                if let Some(envelope) = unanswered {
                    let reply = envelope.failure_reply(ErrorKind::ProcessingFailure, err.to_string());
                    if reply.to == ORCHESTRATOR_ID || self.agents.contains_key(&reply.to) {
                        follow_ups.push_back(reply);
                    }
                }
                Ok(RouteOutcome::Dropped(DropReason::AgentUnavailable))
            }
        }
    }

    fn unknown_destination(
        &self,
        envelope: Envelope,
        follow_ups: &mut VecDeque<Envelope>,
    ) -> RouteOutcome {
        tracing::warn!(
            envelope_id = %envelope.id,
            from = %envelope.from,
            to = %envelope.to,
            "Unknown destination, dropping envelope"
        );
        self.emit(OrchestratorEvent::EnvelopeDropped {
            envelope_id: envelope.id,
            to: envelope.to.clone(),
            reason: DropReason::UnknownDestination,
        });

        if !envelope.requires_response {
            return RouteOutcome::Dropped(DropReason::UnknownDestination);
        }

        let bounce = envelope.failure_reply(
            ErrorKind::UnknownDestination,
            format!("no agent registered as {}", envelope.to),
        );
        if bounce.to == ORCHESTRATOR_ID || self.agents.contains_key(&bounce.to) {
            follow_ups.push_back(bounce.clone());
        }
        RouteOutcome::Bounced(Box::new(bounce))
    }

    fn notify_observers(&self, envelope: &Envelope) -> ConductorResult<()> {
        let observers = self
            .observers
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "observer" })?;
        for observer in observers.iter() {
            observer.observe(envelope);
        }
        Ok(())
    }

    /// Envelopes addressed to the orchestrator itself.
    fn handle_own(
        &self,
        envelope: &Envelope,
        follow_ups: &mut VecDeque<Envelope>,
    ) -> ConductorResult<()> {
        match &envelope.payload {
            Payload::Result(_) => {
                let progressed = self.runs.get_mut(&envelope.context_id).map(|mut run| {
                    let step = run.on_result(envelope);
                    (step, run.state().clone())
                });
                let Some((step, state)) = progressed else {
                    tracing::debug!(
                        context_id = %envelope.context_id,
                        envelope_id = %envelope.id,
                        "Result without workflow run"
                    );
                    return Ok(());
                };

                for stage in step.completed_stages {
                    tracing::debug!(context_id = %state.context_id, stage = %stage, "Stage completed");
                    self.emit(OrchestratorEvent::StageCompleted {
                        context_id: state.context_id,
                        workflow: state.workflow.clone(),
                        stage,
                    });
                }
                follow_ups.extend(step.emit);
                if let Some(status) = step.finished {
                    self.finish_run(&state, status)?;
                }
            }
            Payload::Alert(alert) => match alert.severity {
                AlertSeverity::Critical => tracing::error!(from = %envelope.from, message = %alert.message, "Agent alert"),
                AlertSeverity::Warning => tracing::warn!(from = %envelope.from, message = %alert.message, "Agent alert"),
                AlertSeverity::Info => tracing::info!(from = %envelope.from, message = %alert.message, "Agent alert"),
            },
            Payload::Update(update) => {
                tracing::debug!(from = %envelope.from, status = %update.status, "Agent update");
            }
            Payload::Task(_) | Payload::Request(_) => {
                tracing::debug!(
                    envelope_id = %envelope.id,
                    kind = %envelope.kind(),
                    "Orchestrator does not process this kind, ignoring"
                );
            }
        }
        Ok(())
    }

    fn finish_run(&self, state: &WorkflowState, status: WorkflowStatus) -> ConductorResult<()> {
        let discarded = self.contexts.close(state.context_id)?;
        if !discarded.is_empty() {
            tracing::debug!(
                context_id = %state.context_id,
                discarded = discarded.len(),
                "Discarded parked envelopes of finished workflow"
            );
        }

        match status {
            WorkflowStatus::Completed => {
                tracing::info!(
                    context_id = %state.context_id,
                    workflow = %state.workflow,
                    "Workflow completed"
                );
                self.emit(OrchestratorEvent::WorkflowCompleted {
                    context_id: state.context_id,
                    workflow: state.workflow.clone(),
                });
            }
            WorkflowStatus::Failed | WorkflowStatus::Running => {
                let error = state.error.clone().unwrap_or_default();
                tracing::warn!(
                    context_id = %state.context_id,
                    workflow = %state.workflow,
                    error = %error,
                    "Workflow failed"
                );
                self.emit(OrchestratorEvent::WorkflowFailed {
                    context_id: state.context_id,
                    workflow: state.workflow.clone(),
                    error,
                });
            }
        }
        Ok(())
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------------

    /// Start a workflow and return its context id.
    pub async fn start_workflow(
        &self,
        workflow: &str,
        initial: JsonValue,
        session_id: Option<SessionId>,
    ) -> ConductorResult<ContextId> {
        Ok(self.launch_workflow(workflow, initial, session_id).await?.context_id)
    }

    /// Start a workflow and return a handle to watch it.
    pub async fn launch_workflow(
        &self,
        workflow: &str,
        initial: JsonValue,
        session_id: Option<SessionId>,
    ) -> ConductorResult<WorkflowHandle> {
        self.launch_workflow_with_priority(workflow, initial, session_id, Priority::default())
            .await
    }

    /// Start a workflow whose tasks all carry `priority`.
    pub async fn launch_workflow_with_priority(
        &self,
        workflow: &str,
        initial: JsonValue,
        session_id: Option<SessionId>,
        priority: Priority,
    ) -> ConductorResult<WorkflowHandle> {
        let definition = self
            .definitions
            .get(workflow)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| WorkflowError::UnknownWorkflow {
                name: workflow.to_string(),
            })?;

        let context_id = new_entity_id();
        self.contexts.open(context_id, Some(definition.name.clone()))?;

        let mut run =
            WorkflowRun::new(definition, context_id, initial, session_id).with_priority(priority);
        let state = run.subscribe();
        let tasks = run.start();
        self.runs.insert(context_id, run);

        tracing::info!(
            context_id = %context_id,
            workflow = %workflow,
            priority = ?priority,
            tasks = tasks.len(),
            "Workflow started"
        );

        for task in tasks {
            self.route(task).await?;
        }
        Ok(WorkflowHandle { context_id, state })
    }

    pub fn workflow_state(&self, context_id: ContextId) -> Option<WorkflowState> {
        self.runs.get(&context_id).map(|r| r.state().clone())
    }

    pub fn subscribe_workflow(&self, context_id: ContextId) -> Option<watch::Receiver<WorkflowState>> {
        self.runs.get(&context_id).map(|r| r.subscribe())
    }

    // ------------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------------

    pub fn context(&self, context_id: ContextId) -> ConductorResult<Context> {
        self.contexts
            .get(context_id)?
            .ok_or_else(|| WorkflowError::ContextNotFound { context_id }.into())
    }

    /// Stop routing new envelopes into a context. In-flight work continues.
    pub fn pause_context(&self, context_id: ContextId) -> ConductorResult<ContextStatus> {
        let status = self.contexts.pause(context_id)?;
        tracing::info!(context_id = %context_id, status = ?status, "Context paused");
        Ok(status)
    }

    /// Resume a paused context and re-route its parked envelopes in order.
    pub async fn resume_context(&self, context_id: ContextId) -> ConductorResult<usize> {
        let parked = self.contexts.resume(context_id)?;
        let count = parked.len();
        tracing::info!(context_id = %context_id, parked = count, "Context resumed");
        for envelope in parked {
            self.route(envelope).await?;
        }
        Ok(count)
    }

    /// Evict closed contexts (and their runs) older than the retention window.
    pub fn evict_expired_at(&self, now: Timestamp) -> ConductorResult<usize> {
        let evicted = self
            .contexts
            .evict_closed_at(now, self.context_config.retention)?;
        for context_id in &evicted {
            self.runs.remove(context_id);
        }
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "Evicted closed contexts");
        }
        Ok(evicted.len())
    }

    pub fn context_count(&self) -> ConductorResult<usize> {
        self.contexts.len()
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Shut every agent down, waiting for in-flight work.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<AgentHandle>> =
            self.agents.iter().map(|e| Arc::clone(e.value())).collect();
        for handle in handles {
            handle.shutdown().await;
        }
        tracing::info!("Orchestrator shut down");
    }
}

/// Route agent replies until the orchestrator is dropped.
async fn pump_replies(orchestrator: Weak<Orchestrator>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        let envelope_id = envelope.id;
        if let Err(err) = orchestrator.route(envelope).await {
            tracing::error!(envelope_id = %envelope_id, error = %err, "Failed to route reply");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentFailure, AgentOutput, Capability};
    use async_trait::async_trait;
    use conductor_core::{ConductorError, Outcome};
    use serde_json::json;
    use std::time::Duration;

    struct Echo {
        descriptor: AgentDescriptor,
    }

    impl Echo {
        fn named(id: &str) -> Arc<dyn WorkerAgent> {
            Arc::new(Self {
                descriptor: AgentDescriptor::new(id, "echo").with_capability(Capability::new(
                    "echo",
                    "echoes input",
                    vec![MessageKind::Task],
                    4,
                )),
            })
        }
    }

    #[async_trait]
    impl WorkerAgent for Echo {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn process(&self, envelope: &Envelope) -> Result<AgentOutput, AgentFailure> {
            match &envelope.payload {
                Payload::Task(task) => Ok(AgentOutput::new(json!({
                    "agent": self.descriptor.agent_id,
                    "opportunities": [task.action],
                }))),
                _ => Err(AgentFailure::new("not a task")),
            }
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        Orchestrator::new(AgentRuntimeConfig::default(), ContextConfig::default())
    }

    async fn register_pipeline(orchestrator: &Orchestrator) -> ConductorResult<()> {
        for id in ["discovery", "intelligence", "market-research", "action-generation"] {
            orchestrator.register(Echo::named(id)).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() -> ConductorResult<()> {
        let orchestrator = orchestrator();
        orchestrator.register(Echo::named("discovery")).await?;
        let err = orchestrator.register(Echo::named("discovery")).await;
        assert!(matches!(
            err,
            Err(ConductorError::Agent(AgentError::AlreadyRegistered { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_destination_bounces_when_reply_required() -> ConductorResult<()> {
        let orchestrator = orchestrator();
        let env = Envelope::task("dashboard", "ghost", "x", json!({}));
        match orchestrator.route(env.clone()).await? {
            RouteOutcome::Bounced(reply) => match &reply.payload {
                Payload::Result(result) => {
                    assert_eq!(result.in_reply_to, env.id);
                    assert!(matches!(
                        result.outcome,
                        Outcome::Failure { error: ErrorKind::UnknownDestination, .. }
                    ));
                }
                other => panic!("unexpected payload {:?}", other),
            },
            other => panic!("unexpected outcome {:?}", other),
        }

        let silent = Envelope::task("dashboard", "ghost", "x", json!({})).without_response();
        assert_eq!(
            orchestrator.route(silent).await?,
            RouteOutcome::Dropped(DropReason::UnknownDestination)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_every_routed_envelope_recorded_in_context() -> ConductorResult<()> {
        let orchestrator = orchestrator();
        let env = Envelope::task("dashboard", "ghost", "x", json!({})).without_response();
        orchestrator.route(env.clone()).await?;
        let context = orchestrator.context(env.context_id)?;
        assert_eq!(context.envelopes.len(), 1);
        assert_eq!(context.envelopes[0].id, env.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_pipeline_runs_to_completion() -> ConductorResult<()> {
        let orchestrator = orchestrator();
        register_pipeline(&orchestrator).await?;

        let handle = orchestrator
            .launch_workflow("opportunity_pipeline", json!({ "entity": "acme" }), None)
            .await?;
        let context_id = handle.context_id;
        let state = tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .map_err(|_| WorkflowError::ContextNotFound { context_id })?;

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(
            state.final_output,
            Some(json!({ "agent": "action-generation", "opportunities": ["generate_actions"] }))
        );
        let context = orchestrator.context(context_id)?;
        assert_eq!(context.status, ContextStatus::Closed);
        // 4 tasks plus 4 results.
        assert_eq!(context.envelopes.len(), 8);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_stage_agent_fails_run() -> ConductorResult<()> {
        let orchestrator = orchestrator();
        orchestrator.register(Echo::named("discovery")).await?;

        let handle = orchestrator
            .launch_workflow("opportunity_pipeline", json!({}), None)
            .await?;
        let context_id = handle.context_id;
        let state = tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .map_err(|_| WorkflowError::ContextNotFound { context_id })?;
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.error.is_some_and(|e| e.contains("UnknownDestination")));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let orchestrator = orchestrator();
        let err = orchestrator.start_workflow("nope", json!({}), None).await;
        assert!(matches!(
            err,
            Err(ConductorError::Workflow(WorkflowError::UnknownWorkflow { .. }))
        ));
    }
}
