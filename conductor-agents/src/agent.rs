//! Worker agent contract.
//!
//! A worker agent declares what it can do through an [`AgentDescriptor`] and
//! processes one envelope at a time per call. Admission, capacity, retry and
//! reply emission are handled by the runtime in [`crate::runtime`], so an
//! implementation only has to turn an envelope into an output.

use async_trait::async_trait;
use conductor_core::{AgentId, AgentRuntimeConfig, Envelope, MessageKind, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

// ============================================================================
// DESCRIPTOR
// ============================================================================

/// One declared capability of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub supported_kinds: Vec<MessageKind>,
    pub max_concurrent_tasks: usize,
}

impl Capability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        supported_kinds: Vec<MessageKind>,
        max_concurrent_tasks: usize,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            supported_kinds,
            max_concurrent_tasks,
        }
    }
}

/// Static identity and capability declaration of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    /// Category tag, e.g. "discovery" or "analysis"
    pub agent_type: String,
    pub capabilities: Vec<Capability>,
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<AgentId>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Concurrency bound: the maximum over all capabilities, at least 1.
    pub fn max_concurrent_tasks(&self) -> usize {
        self.capabilities
            .iter()
            .map(|c| c.max_concurrent_tasks)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    pub fn supports(&self, kind: MessageKind) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.supported_kinds.contains(&kind))
    }
}

// ============================================================================
// PROCESSING OUTPUT
// ============================================================================

/// Successful processing output.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub output: JsonValue,
    pub usage: Option<TokenUsage>,
}

impl AgentOutput {
    pub fn new(output: JsonValue) -> Self {
        Self {
            output,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Error raised by an agent while processing or initializing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct AgentFailure {
    pub message: String,
}

impl AgentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for AgentFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for AgentFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

// ============================================================================
// TRAIT
// ============================================================================

/// A capability-declared, capacity-limited unit of work.
///
/// `process` may suspend on external calls. Errors and panics are converted
/// into error-bearing result envelopes by the runtime and never take the
/// agent down.
#[async_trait]
pub trait WorkerAgent: Send + Sync + 'static {
    fn descriptor(&self) -> &AgentDescriptor;

    /// Called once at registration with the shared runtime configuration.
    async fn initialize(&self, _config: &AgentRuntimeConfig) -> Result<(), AgentFailure> {
        Ok(())
    }

    async fn process(&self, envelope: &Envelope) -> Result<AgentOutput, AgentFailure>;

    /// Release resources. Called after the last in-flight envelope finished.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_concurrent_tasks_is_max_over_capabilities() {
        let descriptor = AgentDescriptor::new("intel", "analysis")
            .with_capability(Capability::new("analyze", "", vec![MessageKind::Task], 2))
            .with_capability(Capability::new("answer", "", vec![MessageKind::Request], 5));
        assert_eq!(descriptor.max_concurrent_tasks(), 5);
        assert!(descriptor.supports(MessageKind::Request));
        assert!(!descriptor.supports(MessageKind::Alert));
    }

    #[test]
    fn test_descriptor_without_capabilities_allows_one_task() {
        let descriptor = AgentDescriptor::new("idle", "none");
        assert_eq!(descriptor.max_concurrent_tasks(), 1);
        assert!(!descriptor.supports(MessageKind::Task));
    }

    #[test]
    fn test_agent_failure_display() {
        let failure = AgentFailure::from("upstream timed out");
        assert_eq!(failure.to_string(), "upstream timed out");
    }
}
