//! Conductor Test Utilities
//!
//! Shared test infrastructure for the conductor workspace:
//! - Scripted worker agents (echo, failing, panicking, gated, slow)
//! - Recording progress sink and envelope observer
//! - Proptest generators for core types
//! - Fixtures and custom assertions

pub use conductor_agents::{
    AgentDescriptor, AgentFailure, AgentOutput, Capability, Orchestrator, WorkerAgent,
};
pub use conductor_core::{
    AgentRuntimeConfig, ConductorConfig, ConductorError, ConductorResult, ContextConfig,
    Envelope, EnvelopeObserver, MessageKind, Payload, Priority, ProgressRecord, ProgressSink,
    ProgressStatus, ProgressUpdate, RetryPolicy, SessionError, SessionStatus, TokenUsage,
    ProgressError, WorkflowError,
};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Descriptor with one capability covering `kinds`.
pub fn descriptor(agent_id: &str, kinds: Vec<MessageKind>, max_concurrent_tasks: usize) -> AgentDescriptor {
    AgentDescriptor::new(agent_id, "test").with_capability(Capability::new(
        "work",
        "scripted test capability",
        kinds,
        max_concurrent_tasks,
    ))
}

fn action_of(envelope: &Envelope) -> String {
    match &envelope.payload {
        Payload::Task(task) => task.action.clone(),
        Payload::Request(request) => request.query.clone(),
        other => other.kind().to_string(),
    }
}

fn input_of(envelope: &Envelope) -> JsonValue {
    match &envelope.payload {
        Payload::Task(task) => task.input.clone(),
        Payload::Request(request) => request.params.clone(),
        _ => JsonValue::Null,
    }
}

/// Tracks how many calls are in flight and the highest count observed.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SCRIPTED AGENTS
// ============================================================================

/// Replies with its id, the action and the input, plus a fixed number of
/// opportunities.
#[derive(Debug)]
pub struct EchoAgent {
    descriptor: AgentDescriptor,
    opportunities: usize,
    usage: Option<TokenUsage>,
    gauge: Arc<ConcurrencyGauge>,
}

impl EchoAgent {
    pub fn new(agent_id: &str) -> Self {
        Self {
            descriptor: descriptor(agent_id, vec![MessageKind::Task, MessageKind::Request], 4),
            opportunities: 0,
            usage: None,
            gauge: Arc::new(ConcurrencyGauge::default()),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent_tasks: usize) -> Self {
        let kinds = vec![MessageKind::Task, MessageKind::Request];
        self.descriptor = descriptor(&self.descriptor.agent_id, kinds, max_concurrent_tasks);
        self
    }

    pub fn with_opportunities(mut self, opportunities: usize) -> Self {
        self.opportunities = opportunities;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn gauge(&self) -> Arc<ConcurrencyGauge> {
        Arc::clone(&self.gauge)
    }
}

#[async_trait]
impl WorkerAgent for EchoAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, envelope: &Envelope) -> Result<AgentOutput, AgentFailure> {
        self.gauge.enter();
        let found: Vec<String> = (0..self.opportunities)
            .map(|i| format!("{}-{}", self.descriptor.agent_id, i))
            .collect();
        let output = AgentOutput::new(json!({
            "agent": self.descriptor.agent_id,
            "action": action_of(envelope),
            "input": input_of(envelope),
            "opportunities": found,
        }));
        self.gauge.exit();
        Ok(match self.usage {
            Some(usage) => output.with_usage(usage),
            None => output,
        })
    }
}

/// Always fails with the configured message.
#[derive(Debug)]
pub struct FailingAgent {
    descriptor: AgentDescriptor,
    message: String,
}

impl FailingAgent {
    pub fn new(agent_id: &str, message: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor(agent_id, vec![MessageKind::Task], 1),
            message: message.into(),
        }
    }
}

#[async_trait]
impl WorkerAgent for FailingAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, _envelope: &Envelope) -> Result<AgentOutput, AgentFailure> {
        Err(AgentFailure::new(self.message.clone()))
    }
}

/// Panics inside `process`.
#[derive(Debug)]
pub struct PanickingAgent {
    descriptor: AgentDescriptor,
}

impl PanickingAgent {
    pub fn new(agent_id: &str) -> Self {
        Self {
            descriptor: descriptor(agent_id, vec![MessageKind::Task], 1),
        }
    }
}

#[async_trait]
impl WorkerAgent for PanickingAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, _envelope: &Envelope) -> Result<AgentOutput, AgentFailure> {
        panic!("scripted panic");
    }
}

/// Blocks every call until the test releases a permit.
#[derive(Debug)]
pub struct GatedAgent {
    descriptor: AgentDescriptor,
    gate: Arc<Semaphore>,
    gauge: Arc<ConcurrencyGauge>,
}

impl GatedAgent {
    pub fn new(agent_id: &str, max_concurrent_tasks: usize) -> Self {
        Self {
            descriptor: descriptor(agent_id, vec![MessageKind::Task], max_concurrent_tasks),
            gate: Arc::new(Semaphore::new(0)),
            gauge: Arc::new(ConcurrencyGauge::default()),
        }
    }

    /// Handle used to open the gate after the agent was registered.
    pub fn gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.gate)
    }

    pub fn gauge(&self) -> Arc<ConcurrencyGauge> {
        Arc::clone(&self.gauge)
    }
}

#[async_trait]
impl WorkerAgent for GatedAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, envelope: &Envelope) -> Result<AgentOutput, AgentFailure> {
        self.gauge.enter();
        let permit = self.gate.acquire().await;
        self.gauge.exit();
        match permit {
            Ok(permit) => {
                permit.forget();
                Ok(AgentOutput::new(json!({ "input": input_of(envelope) })))
            }
            Err(_) => Err(AgentFailure::new("gate closed")),
        }
    }
}

/// Sleeps for a fixed delay before echoing the input.
#[derive(Debug)]
pub struct SlowAgent {
    descriptor: AgentDescriptor,
    delay: Duration,
    gauge: Arc<ConcurrencyGauge>,
}

impl SlowAgent {
    pub fn new(agent_id: &str, delay: Duration, max_concurrent_tasks: usize) -> Self {
        Self {
            descriptor: descriptor(agent_id, vec![MessageKind::Task], max_concurrent_tasks),
            delay,
            gauge: Arc::new(ConcurrencyGauge::default()),
        }
    }

    pub fn gauge(&self) -> Arc<ConcurrencyGauge> {
        Arc::clone(&self.gauge)
    }
}

#[async_trait]
impl WorkerAgent for SlowAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, envelope: &Envelope) -> Result<AgentOutput, AgentFailure> {
        self.gauge.enter();
        tokio::time::sleep(self.delay).await;
        self.gauge.exit();
        Ok(AgentOutput::new(json!({ "input": input_of(envelope) })))
    }
}

// ============================================================================
// RECORDING SEAMS
// ============================================================================

/// Collects every envelope it observes.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<Envelope>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        lock(&self.seen).clone()
    }
}

impl EnvelopeObserver for RecordingObserver {
    fn observe(&self, envelope: &Envelope) {
        lock(&self.seen).push(envelope.clone());
    }
}

/// Progress sink that keeps every update and a naive merged record.
#[derive(Debug, Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<(String, ProgressUpdate)>>,
    records: Mutex<HashMap<String, ProgressRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(String, ProgressUpdate)> {
        lock(&self.updates).clone()
    }

    /// Status values reported for `session_id`, in order.
    pub fn statuses(&self, session_id: &str) -> Vec<ProgressStatus> {
        lock(&self.updates)
            .iter()
            .filter(|(id, _)| id == session_id)
            .filter_map(|(_, update)| update.status)
            .collect()
    }

    pub fn record(&self, session_id: &str) -> ProgressRecord {
        lock(&self.records)
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| ProgressRecord::idle(session_id))
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, session_id: &str, update: ProgressUpdate) -> ConductorResult<ProgressRecord> {
        lock(&self.updates).push((session_id.to_string(), update.clone()));
        let mut records = lock(&self.records);
        let record = records
            .entry(session_id.to_string())
            .or_insert_with(|| ProgressRecord::idle(session_id));
        if let Some(v) = update.total_entities {
            record.total_entities = v;
        }
        if let Some(v) = update.processed_entities {
            record.processed_entities = v;
        }
        if let Some(v) = update.current_batch {
            record.current_batch = v;
        }
        if let Some(v) = update.total_batches {
            record.total_batches = v;
        }
        if let Some(v) = update.opportunities_found {
            record.opportunities_found = v;
        }
        if let Some(v) = update.status {
            record.status = v;
        }
        if let Some(v) = update.current_entity {
            record.current_entity = Some(v);
        }
        if let Some(v) = update.errors {
            record.errors = v;
        }
        Ok(record.clone())
    }

    fn report_error(&self, session_id: &str, message: String) -> ConductorResult<()> {
        lock(&self.records)
            .entry(session_id.to_string())
            .or_insert_with(|| ProgressRecord::idle(session_id))
            .errors
            .push(message);
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for conductor core types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_agent_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}"
    }

    pub fn arb_session_id() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9]{1,12}"
    }

    pub fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Medium),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    pub fn arb_message_kind() -> impl Strategy<Value = MessageKind> {
        proptest::sample::select(MessageKind::ALL.to_vec())
    }

    pub fn arb_session_status() -> impl Strategy<Value = SessionStatus> {
        prop_oneof![
            Just(SessionStatus::Active),
            Just(SessionStatus::Paused),
            Just(SessionStatus::Completed),
            Just(SessionStatus::Error),
        ]
    }

    pub fn arb_progress_status() -> impl Strategy<Value = ProgressStatus> {
        prop_oneof![
            Just(ProgressStatus::Idle),
            Just(ProgressStatus::Starting),
            Just(ProgressStatus::Running),
            Just(ProgressStatus::Paused),
            Just(ProgressStatus::Stopped),
            Just(ProgressStatus::Completed),
            Just(ProgressStatus::Error),
        ]
    }

    pub fn arb_token_usage() -> impl Strategy<Value = TokenUsage> {
        (0u64..100_000, 0u64..100_000, 0u64..50_000, 0u64..50_000).prop_map(
            |(input, output, read, creation)| TokenUsage::new(input, output).with_cache(read, creation),
        )
    }

    pub fn arb_retry_policy() -> impl Strategy<Value = RetryPolicy> {
        (1u64..2_000, 2_000u64..60_000, 1.0f64..4.0, 1u32..20).prop_map(
            |(initial_ms, max_ms, multiplier, max_attempts)| RetryPolicy {
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
                max_attempts,
            },
        )
    }

    /// A task envelope between two generated agents.
    pub fn arb_task_envelope() -> impl Strategy<Value = Envelope> {
        (arb_agent_id(), arb_agent_id(), "[a-z_]{1,12}", arb_priority(), any::<i64>()).prop_map(
            |(from, to, action, priority, n)| {
                Envelope::task(from, to, action, json!({ "n": n })).with_priority(priority)
            },
        )
    }

    /// Partial progress update with arbitrary counters and no status.
    pub fn arb_counter_update() -> impl Strategy<Value = ProgressUpdate> {
        (
            proptest::option::of(0u64..1_000),
            proptest::option::of(0u64..1_000),
            proptest::option::of(0u64..100),
            proptest::option::of(0u64..100),
            proptest::option::of(0u64..500),
        )
            .prop_map(|(total, processed, batch, batches, found)| ProgressUpdate {
                total_entities: total,
                processed_entities: processed,
                current_batch: batch,
                total_batches: batches,
                opportunities_found: found,
                ..ProgressUpdate::default()
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use conductor_agents::OPPORTUNITY_PIPELINE;

    /// Agent ids used by the built-in pipeline, in stage order.
    pub const PIPELINE_AGENTS: [&str; 4] =
        ["discovery", "intelligence", "market-research", "action-generation"];

    /// Runtime config with millisecond backoff so retry tests stay fast.
    pub fn fast_agent_config() -> AgentRuntimeConfig {
        AgentRuntimeConfig {
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(50),
                backoff_multiplier: 1.0,
                max_attempts: 10,
            },
            ..AgentRuntimeConfig::default()
        }
    }

    pub fn fast_orchestrator() -> Arc<Orchestrator> {
        Orchestrator::new(fast_agent_config(), ContextConfig::default())
    }

    /// Orchestrator with echo agents for every pipeline stage. The final
    /// stage reports `opportunities` opportunities per run.
    pub async fn pipeline_orchestrator(opportunities: usize) -> ConductorResult<Arc<Orchestrator>> {
        let orchestrator = fast_orchestrator();
        for id in PIPELINE_AGENTS {
            let agent = EchoAgent::new(id);
            let agent = if id == "action-generation" {
                agent.with_opportunities(opportunities)
            } else {
                agent
            };
            orchestrator.register(Arc::new(agent)).await?;
        }
        Ok(orchestrator)
    }

    pub fn pipeline_name() -> &'static str {
        OPPORTUNITY_PIPELINE
    }

    pub fn task(to: &str, n: i64) -> Envelope {
        Envelope::task("dashboard", to, "work", json!({ "n": n }))
    }

    /// Usage used by the pricing scenario: 1000 in, 500 out.
    pub fn sample_usage() -> TokenUsage {
        TokenUsage::new(1000, 500)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for conductor error variants.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &ConductorResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &ConductorResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    #[track_caller]
    pub fn assert_session_not_found<T: std::fmt::Debug>(result: &ConductorResult<T>) {
        match result {
            Err(ConductorError::Session(SessionError::NotFound { .. })) => {}
            other => panic!("Expected session NotFound, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_transition<T: std::fmt::Debug>(result: &ConductorResult<T>) {
        match result {
            Err(ConductorError::Session(SessionError::InvalidTransition { .. }))
            | Err(ConductorError::Progress(ProgressError::InvalidTransition { .. })) => {}
            other => panic!("Expected InvalidTransition, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "Expected {} to be within 1e-9 of {}",
            actual,
            expected
        );
    }
}
