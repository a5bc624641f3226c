//! Worker agents, routing and workflow sequencing.
//!
//! Each registered [`WorkerAgent`] runs behind an [`AgentHandle`]: a bounded
//! mailbox drained by one dispatcher task that enforces the agent's declared
//! capacity, retries rejected envelopes with priority-scaled backoff, and
//! turns every outcome (including panics) into exactly one result envelope.
//!
//! The [`Orchestrator`] owns the agent registry, the [`ContextStore`] and the
//! workflow run table. The [`ScanRunner`] drives batches of entities through
//! a workflow and reports progress through a [`conductor_core::ProgressSink`].

pub mod agent;
pub mod context;
pub mod orchestrator;
pub mod runtime;
pub mod scan;
pub mod workflow;

pub use agent::*;
pub use context::*;
pub use orchestrator::*;
pub use runtime::*;
pub use scan::*;
pub use workflow::*;
