//! Actor runtime wrapping a [`WorkerAgent`].
//!
//! Each registered agent gets an [`AgentHandle`]: a bounded inbox drained by a
//! single dispatcher task. The dispatcher admits envelopes strictly in FIFO
//! order, so two envelopes submitted to the same agent always start in
//! submission order. Admission works like this:
//!
//! 1. A stale envelope (TTL elapsed) is logged and dropped, no reply.
//! 2. An envelope whose kind the agent does not support is re-queued after
//!    the retry delay.
//! 3. When all `max_concurrent_tasks` slots are busy the dispatcher waits for
//!    the retry delay and tries again.
//!
//! Both rejection paths are bounded by [`RetryPolicy::max_attempts`]; an
//! envelope that runs out of attempts is dead-lettered and, if it wanted a
//! response, answered with a `CapacityExceeded` error result.
//!
//! Admitted envelopes are processed on their own task. Errors and panics are
//! turned into `ProcessingFailure` results, so a bad envelope never takes the
//! agent down.
//!
//! [`RetryPolicy::max_attempts`]: conductor_core::RetryPolicy

use crate::agent::{AgentDescriptor, WorkerAgent};
use chrono::Utc;
use conductor_core::{
    AgentError, AgentId, AgentRuntimeConfig, Envelope, ErrorKind, RetryPolicy, RoutingError,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

/// Channel on which agents emit their reply envelopes.
pub type ReplySender = mpsc::UnboundedSender<Envelope>;

enum Inbound {
    Envelope { envelope: Envelope, attempts: u32 },
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// STATS
// ============================================================================

/// Live per-agent counters.
#[derive(Debug, Default)]
pub struct AgentStats {
    pub accepted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub inbox_waits: AtomicU64,
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl AgentStats {
    pub fn snapshot(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            inbox_waits: self.inbox_waits.load(Ordering::Relaxed),
            active_tasks: self.active.load(Ordering::Acquire),
            peak_active: self.peak_active.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time copy of [`AgentStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AgentStatsSnapshot {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub stale_dropped: u64,
    /// Submissions that found the inbox full and had to wait.
    pub inbox_waits: u64,
    pub active_tasks: usize,
    pub peak_active: usize,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Mailbox of one running agent.
#[derive(Debug)]
pub struct AgentHandle {
    descriptor: AgentDescriptor,
    inbox: mpsc::Sender<Inbound>,
    accepting: AtomicBool,
    stats: Arc<AgentStats>,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inbound::Envelope { envelope, attempts } => f
                .debug_struct("Envelope")
                .field("id", &envelope.id)
                .field("attempts", attempts)
                .finish(),
            Inbound::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl AgentHandle {
    /// Start the dispatcher for `agent`. Must be called inside a tokio runtime.
    pub fn spawn(
        agent: Arc<dyn WorkerAgent>,
        config: &AgentRuntimeConfig,
        replies: ReplySender,
    ) -> Self {
        let descriptor = agent.descriptor().clone();
        let (tx, rx) = mpsc::channel(config.inbox_capacity.max(1));
        let stats = Arc::new(AgentStats::default());
        let max_concurrent = descriptor.max_concurrent_tasks();

        let dispatcher = Dispatcher {
            agent,
            agent_id: descriptor.agent_id.clone(),
            descriptor: descriptor.clone(),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            retry: config.retry.clone(),
            replies,
            requeue: tx.clone(),
            stats: Arc::clone(&stats),
        };
        tokio::spawn(dispatcher.run(rx));

        Self {
            descriptor,
            inbox: tx,
            accepting: AtomicBool::new(true),
            stats,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.descriptor.agent_id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn stats(&self) -> AgentStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Hand an envelope to the agent.
    ///
    /// Waits while the inbox is full. Admission happens later on the
    /// dispatcher; this only fails once the agent is shutting down.
    pub async fn submit(&self, envelope: Envelope) -> Result<(), AgentError> {
        if !self.is_accepting() {
            return Err(self.unavailable());
        }
        let item = Inbound::Envelope {
            envelope,
            attempts: 0,
        };
        match self.inbox.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(self.unavailable()),
            Err(TrySendError::Full(item)) => {
                self.stats.inbox_waits.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    agent_id = %self.descriptor.agent_id,
                    capacity = self.inbox.max_capacity(),
                    "Agent inbox full, submitter waiting"
                );
                self.inbox.send(item).await.map_err(|_| self.unavailable())
            }
        }
    }

    /// Stop accepting, wait for in-flight work, then shut the agent down.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.inbox.send(Inbound::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    fn unavailable(&self) -> AgentError {
        AgentError::Unavailable {
            agent_id: self.descriptor.agent_id.clone(),
        }
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

struct Dispatcher {
    agent: Arc<dyn WorkerAgent>,
    agent_id: AgentId,
    descriptor: AgentDescriptor,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    retry: RetryPolicy,
    replies: ReplySender,
    requeue: mpsc::Sender<Inbound>,
    stats: Arc<AgentStats>,
}

impl Dispatcher {
    async fn run(self, mut inbox: mpsc::Receiver<Inbound>) {
        tracing::debug!(
            agent_id = %self.agent_id,
            max_concurrent = self.max_concurrent,
            "Agent dispatcher started"
        );

        let mut done = None;
        while let Some(item) = inbox.recv().await {
            match item {
                Inbound::Envelope { envelope, attempts } => self.dispatch(envelope, attempts).await,
                Inbound::Shutdown(tx) => {
                    done = Some(tx);
                    break;
                }
            }
        }

        inbox.close();
        while let Ok(item) = inbox.try_recv() {
            if let Inbound::Envelope { envelope, attempts } = item {
                self.dead_letter(envelope, attempts, "agent shut down");
            }
        }

        self.drain().await;
        self.agent.shutdown().await;
        tracing::info!(
            agent_id = %self.agent_id,
            completed = self.stats.completed.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "Agent shut down"
        );

        if let Some(tx) = done {
            let _ = tx.send(());
        }
    }

    async fn dispatch(&self, envelope: Envelope, mut attempts: u32) {
        if envelope.is_stale() {
            self.drop_stale(&envelope);
            return;
        }

        if !self.descriptor.supports(envelope.kind()) {
            attempts += 1;
            self.requeue_unsupported(envelope, attempts);
            return;
        }

        let permit = loop {
            match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => break permit,
                Err(_) => {
                    attempts += 1;
                    if !self.retry.can_retry(attempts) {
                        self.dead_letter(envelope, attempts, "capacity retries exhausted");
                        return;
                    }
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.delay_for(attempts, envelope.priority);
                    tracing::debug!(
                        agent_id = %self.agent_id,
                        envelope_id = %envelope.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Agent at capacity, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    if envelope.is_stale() {
                        self.drop_stale(&envelope);
                        return;
                    }
                }
            }
        };

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.start(envelope, permit);
    }

    fn requeue_unsupported(&self, envelope: Envelope, attempts: u32) {
        if !self.retry.can_retry(attempts) {
            self.dead_letter(envelope, attempts, "unsupported message kind");
            return;
        }
        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        let delay = self.retry.delay_for(attempts, envelope.priority);
        tracing::debug!(
            agent_id = %self.agent_id,
            envelope_id = %envelope.id,
            kind = %envelope.kind(),
            attempt = attempts,
            "Unsupported message kind, re-queueing"
        );

        let requeue = self.requeue.clone();
        let agent_id = self.agent_id.clone();
        let stats = Arc::clone(&self.stats);
        let replies = self.replies.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = requeue.send(Inbound::Envelope { envelope, attempts }).await {
                if let Inbound::Envelope { envelope, attempts } = err.0 {
                    dead_letter(&agent_id, &stats, &replies, envelope, attempts, "agent shut down");
                }
            }
        });
    }

    fn start(&self, envelope: Envelope, permit: OwnedSemaphorePermit) {
        let agent = Arc::clone(&self.agent);
        let stats = Arc::clone(&self.stats);
        let replies = self.replies.clone();
        let agent_id = self.agent_id.clone();

        let active = stats.active.fetch_add(1, Ordering::AcqRel) + 1;
        stats.peak_active.fetch_max(active, Ordering::AcqRel);

        tokio::spawn(async move {
            let _permit = permit;
            let work = envelope.clone();
            let joined = tokio::spawn(async move { agent.process(&work).await }).await;

            let reply = match joined {
                Ok(Ok(output)) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    envelope.success_reply(output.output, output.usage)
                }
                Ok(Err(failure)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        agent_id = %agent_id,
                        envelope_id = %envelope.id,
                        error = %failure,
                        "Agent processing failed"
                    );
                    envelope.failure_reply(ErrorKind::ProcessingFailure, failure.message)
                }
                Err(join_err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    let message = if join_err.is_panic() {
                        panic_message(join_err.into_panic())
                    } else {
                        "processing task was cancelled".to_string()
                    };
                    tracing::error!(
                        agent_id = %agent_id,
                        envelope_id = %envelope.id,
                        error = %message,
                        "Agent processing panicked"
                    );
                    envelope.failure_reply(ErrorKind::ProcessingFailure, message)
                }
            };

            stats.active.fetch_sub(1, Ordering::AcqRel);

            if envelope.requires_response && replies.send(reply).is_err() {
                tracing::warn!(
                    agent_id = %agent_id,
                    envelope_id = %envelope.id,
                    "Reply channel closed, result discarded"
                );
            }
        });
    }

    fn drop_stale(&self, envelope: &Envelope) {
        self.stats.stale_dropped.fetch_add(1, Ordering::Relaxed);
        let age_ms = (Utc::now() - envelope.created_at).num_milliseconds().max(0) as u64;
        let err = RoutingError::StaleEnvelope {
            envelope_id: envelope.id,
            age_ms,
            ttl_ms: envelope.ttl_ms.unwrap_or_default(),
        };
        tracing::warn!(
            agent_id = %self.agent_id,
            context_id = %envelope.context_id,
            error = %err,
            "Dropping stale envelope"
        );
    }

    fn dead_letter(&self, envelope: Envelope, attempts: u32, reason: &str) {
        dead_letter(&self.agent_id, &self.stats, &self.replies, envelope, attempts, reason);
    }

    /// Wait until every slot is free again.
    async fn drain(&self) {
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        match self.slots.acquire_many(all).await {
            Ok(permits) => drop(permits),
            Err(_) => tracing::warn!(agent_id = %self.agent_id, "Slot semaphore closed during drain"),
        }
    }
}

/// Give up on an envelope, answering it with `CapacityExceeded` if it
/// wanted a response.
fn dead_letter(
    agent_id: &AgentId,
    stats: &AgentStats,
    replies: &ReplySender,
    envelope: Envelope,
    attempts: u32,
    reason: &str,
) {
    stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
    let err = RoutingError::CapacityExhausted {
        envelope_id: envelope.id,
        agent_id: agent_id.clone(),
        attempts,
    };
    tracing::warn!(
        context_id = %envelope.context_id,
        error = %err,
        reason,
        "Dead-lettering envelope"
    );
    if envelope.requires_response {
        let reply = envelope.failure_reply(
            ErrorKind::CapacityExceeded,
            format!("{}: {}", err, reason),
        );
        if replies.send(reply).is_err() {
            tracing::warn!(agent_id = %agent_id, "Reply channel closed, dead letter discarded");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("agent panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("agent panicked: {}", s)
    } else {
        "agent panicked".to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================
