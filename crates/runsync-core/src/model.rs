// Entity and event envelope model
//
// Envelopes are the unit of the push stream and of history pages. Entities are
// owned by the server; the client only ever holds a cached snapshot of one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One discrete occurrence reported by a running job.
///
/// Identity is `(entity_id, id)`. Push frames that arrive without an id carry
/// a derived id instead, see [`Envelope::fingerprint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Server-assigned id, unique per entity
    pub id: String,

    /// Entity this event belongs to
    pub entity_id: String,

    /// Type tag, e.g. "agent.tool_use"
    pub event_type: String,

    /// Opaque event payload
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Server timestamp. Not guaranteed monotonic across transport paths.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        id: impl Into<String>,
        entity_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Set the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Deterministic id for frames that arrive without one.
    ///
    /// Hashes entity id, event type and the canonical (key-sorted) payload so a
    /// re-delivery of the same frame maps to the same id.
    pub fn derive_id(entity_id: &str, event_type: &str, payload: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entity_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(event_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.to_string().as_bytes());
        let digest = hasher.finalize();
        format!("derived-{}", hex::encode(&digest[..16]))
    }

    /// Content key of this occurrence: entity, type and payload.
    ///
    /// Equal to the id of an envelope whose id was derived, so a derived push
    /// and the server-id history row of the same occurrence share a key.
    pub fn fingerprint(&self) -> String {
        Self::derive_id(&self.entity_id, &self.event_type, &self.payload)
    }

    /// Whether the id was derived from content rather than assigned by the server
    pub fn has_derived_id(&self) -> bool {
        self.id.starts_with("derived-") && self.id == self.fingerprint()
    }
}

/// Which state machine an entity follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Autonomous agent run / sandbox: pending -> running -> terminal
    AgentRun,
    /// Long-lived session (preview, prototype): creating -> ready <-> busy
    Session,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentRun => write!(f, "agent_run"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Server-side record of the remote job, as last pulled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: String,

    /// Raw status string as reported by the server
    pub status: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Job-type-specific fields (framework, preview_url, ...)
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl EntitySnapshot {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            created_at: None,
            error_message: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// One page of historical events, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<Envelope>,
    /// Cursor for the next (older) page, if any
    pub next_cursor: Option<String>,
}
