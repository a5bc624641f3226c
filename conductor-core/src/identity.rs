//! Identity types for conductor entities

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type EntityId = Uuid;

/// Identifier of a single envelope. Unique for the lifetime of the process.
pub type EnvelopeId = EntityId;

/// Identifier correlating the envelopes of one workflow run.
pub type ContextId = EntityId;

/// Routing key of a worker agent (e.g. `"discovery"`).
pub type AgentId = String;

/// Identifier of an accountable session or of a progress record.
pub type SessionId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Duration in milliseconds for TTL and timeout values.
pub type DurationMs = u64;

/// Routing key the orchestrator uses when it sends envelopes itself.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Generate a new session identifier.
pub fn new_session_id() -> SessionId {
    Uuid::now_v7().to_string()
}
