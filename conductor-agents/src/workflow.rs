//! Workflow definitions and the per-run stage state machine.
//!
//! A workflow is data: a set of named stages, each fanning out to one or more
//! agents and declaring which stages must complete first. Runs never hard-code
//! agent identities; the definition does.

use chrono::Utc;
use conductor_core::{
    AgentId, ConductorResult, ContextId, Envelope, Outcome, Payload, Priority,
    SessionId, StageMarker, Timestamp, WorkflowError, ORCHESTRATOR_ID,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

/// Name of the built-in discovery → analysis → action pipeline.
pub const OPPORTUNITY_PIPELINE: &str = "opportunity_pipeline";

/// Key under which the run's initial payload is passed to every stage.
pub const INITIAL_INPUT_KEY: &str = "initial";

// ============================================================================
// DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub name: String,
    /// Agents that run this stage in parallel.
    pub agents: Vec<AgentId>,
    /// Action placed in each task payload.
    pub action: String,
    /// Stages that must complete before this one starts.
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            action: action.into(),
            prerequisites: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<AgentId>) -> Self {
        self.agents.push(agent.into());
        self
    }

    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.prerequisites.push(stage.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// discovery → {intelligence, market-research} → action-generation.
    pub fn opportunity_pipeline() -> Self {
        Self::new(OPPORTUNITY_PIPELINE)
            .with_stage(StageDefinition::new("discovery", "discover").with_agent("discovery"))
            .with_stage(
                StageDefinition::new("intelligence", "analyze")
                    .with_agent("intelligence")
                    .after("discovery"),
            )
            .with_stage(
                StageDefinition::new("market-research", "research")
                    .with_agent("market-research")
                    .after("discovery"),
            )
            .with_stage(
                StageDefinition::new("action-generation", "generate_actions")
                    .with_agent("action-generation")
                    .after("intelligence")
                    .after("market-research"),
            )
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stages no other stage depends on. Their outputs form the final output.
    pub fn terminal_stages(&self) -> Vec<&StageDefinition> {
        let depended: HashSet<&str> = self
            .stages
            .iter()
            .flat_map(|s| s.prerequisites.iter().map(String::as_str))
            .collect();
        self.stages
            .iter()
            .filter(|s| !depended.contains(s.name.as_str()))
            .collect()
    }

    /// Check names, agents, prerequisites and acyclicity.
    pub fn validate(&self) -> ConductorResult<()> {
        let invalid = |reason: String| WorkflowError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("workflow name is empty".to_string()).into());
        }
        if self.stages.is_empty() {
            return Err(invalid("workflow has no stages".to_string()).into());
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage {}", stage.name)).into());
            }
            if stage.agents.is_empty() {
                return Err(invalid(format!("stage {} has no agents", stage.name)).into());
            }
            let mut agents = HashSet::new();
            if let Some(agent) = stage.agents.iter().find(|a| !agents.insert(a.as_str())) {
                return Err(invalid(format!(
                    "stage {} lists agent {} more than once",
                    stage.name, agent
                ))
                .into());
            }
            if stage.agents.iter().any(|a| a == ORCHESTRATOR_ID) {
                return Err(invalid(format!(
                    "stage {} targets the orchestrator itself",
                    stage.name
                ))
                .into());
            }
        }

        for stage in &self.stages {
            for prerequisite in &stage.prerequisites {
                if prerequisite == &stage.name {
                    return Err(invalid(format!("stage {} depends on itself", stage.name)).into());
                }
                if !names.contains(prerequisite.as_str()) {
                    return Err(invalid(format!(
                        "stage {} depends on unknown stage {}",
                        stage.name, prerequisite
                    ))
                    .into());
                }
            }
        }

        // Kahn's algorithm: every stage must be reachable from the roots.
        let mut indegree: HashMap<&str, usize> = self
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.prerequisites.len()))
            .collect();
        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(name) = ready.pop_front() {
            visited += 1;
            for stage in &self.stages {
                let hits = stage.prerequisites.iter().filter(|p| *p == name).count();
                if hits == 0 {
                    continue;
                }
                if let Some(d) = indegree.get_mut(stage.name.as_str()) {
                    *d = d.saturating_sub(hits);
                    if *d == 0 {
                        ready.push_back(stage.name.as_str());
                    }
                }
            }
        }
        if visited != self.stages.len() {
            return Err(invalid("stage prerequisites form a cycle".to_string()).into());
        }

        Ok(())
    }
}

// ============================================================================
// RUN STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StageState {
    pub status: StageStatus,
    /// Agents that have not replied yet.
    pub pending_agents: Vec<AgentId>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub outputs: BTreeMap<AgentId, JsonValue>,
}

/// Observable state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub context_id: ContextId,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub stages: BTreeMap<String, StageState>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub final_output: Option<JsonValue>,
    pub error: Option<String>,
    pub session_id: Option<SessionId>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub started_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub finished_at: Option<Timestamp>,
}

/// What applying a result to a run produced.
#[derive(Debug, Default)]
pub struct RunStep {
    /// Follow-up task envelopes to route.
    pub emit: Vec<Envelope>,
    /// Stages that completed with this result.
    pub completed_stages: Vec<String>,
    /// Set when the run just reached a terminal status.
    pub finished: Option<WorkflowStatus>,
}

/// Mutable run of one workflow definition inside one context.
#[derive(Debug)]
pub struct WorkflowRun {
    definition: Arc<WorkflowDefinition>,
    initial: JsonValue,
    priority: Priority,
    state: WorkflowState,
    tx: watch::Sender<WorkflowState>,
}

impl WorkflowRun {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        context_id: ContextId,
        initial: JsonValue,
        session_id: Option<SessionId>,
    ) -> Self {
        let stages = definition
            .stages
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    StageState {
                        status: StageStatus::Pending,
                        pending_agents: Vec::new(),
                        outputs: BTreeMap::new(),
                    },
                )
            })
            .collect();
        let state = WorkflowState {
            context_id,
            workflow: definition.name.clone(),
            status: WorkflowStatus::Running,
            stages,
            final_output: None,
            error: None,
            session_id,
            started_at: Utc::now(),
            finished_at: None,
        };
        let (tx, _rx) = watch::channel(state.clone());
        Self {
            definition,
            initial,
            priority: Priority::Medium,
            state,
            tx,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.tx.subscribe()
    }

    /// Emit the tasks of every stage without prerequisites.
    pub fn start(&mut self) -> Vec<Envelope> {
        let emit = self.start_ready_stages();
        self.publish();
        emit
    }

    /// Fail the run from outside (e.g. a task could not be routed).
    pub fn fail(&mut self, message: impl Into<String>) -> RunStep {
        if self.state.status.is_terminal() {
            return RunStep::default();
        }
        self.finish(WorkflowStatus::Failed, Some(message.into()));
        RunStep {
            finished: Some(WorkflowStatus::Failed),
            ..RunStep::default()
        }
    }

    /// Apply a result envelope addressed to the orchestrator.
    pub fn on_result(&mut self, envelope: &Envelope) -> RunStep {
        let mut step = RunStep::default();
        if self.state.status.is_terminal() {
            tracing::debug!(
                context_id = %self.state.context_id,
                envelope_id = %envelope.id,
                "Ignoring result for finished workflow"
            );
            return step;
        }

        let (stage_name, outcome) = match (&envelope.payload, envelope.stage()) {
            (Payload::Result(result), Some(marker)) if marker.workflow == self.definition.name => {
                (marker.stage.clone(), &result.outcome)
            }
            _ => {
                tracing::debug!(
                    context_id = %self.state.context_id,
                    envelope_id = %envelope.id,
                    kind = %envelope.kind(),
                    "Envelope carries no stage marker for this workflow"
                );
                return step;
            }
        };

        let agent = envelope.from.clone();
        let Some(stage) = self.state.stages.get_mut(&stage_name) else {
            tracing::warn!(stage = %stage_name, "Result for unknown stage");
            return step;
        };
        if stage.status != StageStatus::Running || !stage.pending_agents.contains(&agent) {
            tracing::debug!(
                stage = %stage_name,
                agent_id = %agent,
                "Duplicate or unexpected stage result ignored"
            );
            return step;
        }
        stage.pending_agents.retain(|a| a != &agent);

        match outcome {
            Outcome::Failure { error, message, .. } => {
                stage.status = StageStatus::Failed;
                let reason = format!("stage {} failed at {}: {} ({})", stage_name, agent, message, error);
                self.finish(WorkflowStatus::Failed, Some(reason));
                step.finished = Some(WorkflowStatus::Failed);
                return step;
            }
            Outcome::Success { output } => {
                stage.outputs.insert(agent, output.clone());
                if stage.pending_agents.is_empty() {
                    stage.status = StageStatus::Completed;
                    step.completed_stages.push(stage_name);
                }
            }
        }

        if self
            .state
            .stages
            .values()
            .all(|s| s.status == StageStatus::Completed)
        {
            let final_output = self.final_output();
            self.state.final_output = Some(final_output);
            self.finish(WorkflowStatus::Completed, None);
            step.finished = Some(WorkflowStatus::Completed);
            return step;
        }

        if !step.completed_stages.is_empty() {
            step.emit = self.start_ready_stages();
        }
        self.publish();
        step
    }

    /// Start every pending stage whose prerequisites have all completed.
    fn start_ready_stages(&mut self) -> Vec<Envelope> {
        let ready: Vec<StageDefinition> = self
            .definition
            .stages
            .iter()
            .filter(|s| {
                self.state
                    .stages
                    .get(&s.name)
                    .is_some_and(|st| st.status == StageStatus::Pending)
                    && s.prerequisites.iter().all(|p| {
                        self.state
                            .stages
                            .get(p)
                            .is_some_and(|st| st.status == StageStatus::Completed)
                    })
            })
            .cloned()
            .collect();

        let input = self.stage_input();
        let mut emit = Vec::new();
        for stage in ready {
            if let Some(state) = self.state.stages.get_mut(&stage.name) {
                state.status = StageStatus::Running;
                state.pending_agents = stage.agents.clone();
            }
            for agent in &stage.agents {
                let mut task = Envelope::staged_task(
                    ORCHESTRATOR_ID,
                    agent.clone(),
                    stage.action.clone(),
                    input.clone(),
                    StageMarker::new(self.definition.name.clone(), stage.name.clone()),
                )
                .with_context(self.state.context_id)
                .with_priority(self.priority);
                if let Some(session) = &self.state.session_id {
                    task = task.with_session(session.clone());
                }
                emit.push(task);
            }
        }
        emit
    }

    /// Initial payload plus every completed stage's output, keyed by stage.
    fn stage_input(&self) -> JsonValue {
        let mut input = Map::new();
        input.insert(INITIAL_INPUT_KEY.to_string(), self.initial.clone());
        for (name, stage) in &self.state.stages {
            if stage.status == StageStatus::Completed {
                input.insert(name.clone(), stage_output(stage));
            }
        }
        JsonValue::Object(input)
    }

    fn final_output(&self) -> JsonValue {
        let terminal = self.definition.terminal_stages();
        let outputs: Vec<(String, JsonValue)> = terminal
            .iter()
            .filter_map(|s| {
                self.state
                    .stages
                    .get(&s.name)
                    .map(|st| (s.name.clone(), stage_output(st)))
            })
            .collect();
        match outputs.len() {
            1 => outputs.into_iter().map(|(_, v)| v).next().unwrap_or(JsonValue::Null),
            _ => JsonValue::Object(outputs.into_iter().collect()),
        }
    }

    fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.state.status = status;
        self.state.error = error;
        self.state.finished_at = Some(Utc::now());
        self.publish();
    }

    fn publish(&self) {
        // send_replace never fails, even without subscribers.
        self.tx.send_replace(self.state.clone());
    }
}

/// A single agent's output as is, several agents' outputs keyed by agent.
fn stage_output(stage: &StageState) -> JsonValue {
    if stage.outputs.len() == 1 {
        stage.outputs.values().next().cloned().unwrap_or(JsonValue::Null)
    } else {
        JsonValue::Object(
            stage
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ConductorError, ErrorKind};
    use serde_json::json;

    fn task_for<'a>(emitted: &'a [Envelope], agent: &str) -> &'a Envelope {
        match emitted.iter().find(|e| e.to == agent) {
            Some(env) => env,
            None => panic!("no task for {}", agent),
        }
    }

    fn new_run() -> WorkflowRun {
        WorkflowRun::new(
            Arc::new(WorkflowDefinition::opportunity_pipeline()),
            conductor_core::new_entity_id(),
            json!({ "entity": "acme" }),
            Some("s1".to_string()),
        )
    }

    #[test]
    fn test_builtin_pipeline_is_valid() -> ConductorResult<()> {
        WorkflowDefinition::opportunity_pipeline().validate()?;
        let pipeline = WorkflowDefinition::opportunity_pipeline();
        let terminal: Vec<&str> = pipeline
            .terminal_stages()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(terminal, vec!["action-generation"]);
        Ok(())
    }

    #[test]
    fn test_cycle_rejected() {
        let def = WorkflowDefinition::new("loop")
            .with_stage(StageDefinition::new("a", "x").with_agent("w").after("b"))
            .with_stage(StageDefinition::new("b", "x").with_agent("w").after("a"));
        assert!(matches!(
            def.validate(),
            Err(ConductorError::Workflow(WorkflowError::InvalidDefinition { .. }))
        ));
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let def = WorkflowDefinition::new("broken")
            .with_stage(StageDefinition::new("a", "x").with_agent("w").after("ghost"));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_stage_without_agents_rejected() {
        let def = WorkflowDefinition::new("empty").with_stage(StageDefinition::new("a", "x"));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_duplicate_agent_in_stage_rejected() {
        let def = WorkflowDefinition::new("twice").with_stage(
            StageDefinition::new("a", "x")
                .with_agent("worker")
                .with_agent("worker"),
        );
        let err = def.validate();
        assert!(
            matches!(
                &err,
                Err(ConductorError::Workflow(WorkflowError::InvalidDefinition { reason, .. }))
                    if reason.contains("more than once")
            ),
            "{:?}",
            err
        );

        let def = WorkflowDefinition::new("distinct").with_stage(
            StageDefinition::new("a", "x")
                .with_agent("worker")
                .with_agent("other"),
        );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_fan_out_waits_for_all_prerequisites() {
        let mut run = new_run();
        let first = run.start();
        assert_eq!(first.len(), 1);
        let discovery = task_for(&first, "discovery");
        assert_eq!(discovery.session_id.as_deref(), Some("s1"));

        let step = run.on_result(&discovery.success_reply(json!({ "leads": 3 }), None));
        assert_eq!(step.completed_stages, vec!["discovery".to_string()]);
        assert_eq!(step.emit.len(), 2);
        let intel = task_for(&step.emit, "intelligence").clone();
        let market = task_for(&step.emit, "market-research").clone();

        match &intel.payload {
            Payload::Task(task) => {
                assert_eq!(task.input["initial"], json!({ "entity": "acme" }));
                assert_eq!(task.input["discovery"], json!({ "leads": 3 }));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        // One of two prerequisites done: nothing new yet.
        let step = run.on_result(&intel.success_reply(json!({ "score": 0.9 }), None));
        assert!(step.emit.is_empty());

        let step = run.on_result(&market.success_reply(json!({ "size": "large" }), None));
        assert_eq!(step.emit.len(), 1);
        let action = task_for(&step.emit, "action-generation").clone();

        let step = run.on_result(
            &action.success_reply(json!({ "opportunities": [{ "id": 1 }, { "id": 2 }] }), None),
        );
        assert_eq!(step.finished, Some(WorkflowStatus::Completed));
        assert_eq!(run.state().status, WorkflowStatus::Completed);
        assert_eq!(
            run.state().final_output,
            Some(json!({ "opportunities": [{ "id": 1 }, { "id": 2 }] }))
        );
    }

    #[test]
    fn test_failure_fails_run() {
        let mut run = new_run();
        let first = run.start();
        let discovery = task_for(&first, "discovery");
        let step = run.on_result(&discovery.failure_reply(ErrorKind::ProcessingFailure, "boom"));
        assert_eq!(step.finished, Some(WorkflowStatus::Failed));
        assert!(step.emit.is_empty());
        assert!(run.state().error.as_deref().is_some_and(|e| e.contains("boom")));

        // Later results are ignored.
        let late = run.on_result(&discovery.success_reply(json!({}), None));
        assert!(late.finished.is_none());
    }

    #[test]
    fn test_duplicate_result_ignored() {
        let mut run = new_run();
        let first = run.start();
        let discovery = task_for(&first, "discovery");
        let reply = discovery.success_reply(json!({}), None);
        assert_eq!(run.on_result(&reply).emit.len(), 2);
        assert!(run.on_result(&reply).emit.is_empty());
    }

    #[test]
    fn test_watch_receives_updates() {
        let mut run = new_run();
        let rx = run.subscribe();
        let first = run.start();
        run.on_result(&task_for(&first, "discovery").failure_reply(ErrorKind::NotFound, "x"));
        assert_eq!(rx.borrow().status, WorkflowStatus::Failed);
    }
}
