//! Session data model.
//!
//! A session is a logical unit of accountable work, independent of any single
//! agent or context. The behaviour lives in `conductor-sessions`; this module
//! only holds the data.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::identity::{AgentId, SessionId, Timestamp};
use crate::usage::TokenUsage;

/// Metadata key holding the parent of a forked session.
pub const PARENT_SESSION_KEY: &str = "parentSessionId";

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent usage breakdown inside a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub calls: u64,
    pub duration_ms: u64,
    pub cost: f64,
}

/// One accounted message. `message_id` is the deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub message_id: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub timestamp: Timestamp,
    pub usage: TokenUsage,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// Accountable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub last_activity: Timestamp,
    pub status: SessionStatus,
    pub message_count: u64,
    pub total_cost: f64,
    pub agent_usage: HashMap<AgentId, AgentUsage>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub metadata: HashMap<String, JsonValue>,
}

impl Session {
    /// Create an active session with zeroed counters.
    pub fn new(session_id: SessionId, now: Timestamp) -> Self {
        Self {
            session_id,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Active,
            message_count: 0,
            total_cost: 0.0,
            agent_usage: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Parent session id for forked sessions.
    pub fn parent_session_id(&self) -> Option<&str> {
        self.metadata.get(PARENT_SESSION_KEY).and_then(|v| v.as_str())
    }
}

/// A message observed for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ActivityMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ActivityMessage {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            agent: None,
            tool: None,
            usage: None,
            duration_ms: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<AgentId>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Read-only cost aggregation for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub session_id: SessionId,
    pub total_cost: f64,
    pub message_count: u64,
    pub per_agent_cost: HashMap<AgentId, f64>,
    pub step_count: u64,
    pub avg_cost_per_step: f64,
}
