//! Wire shapes of the server API
//!
//! Push frames (no id, no timestamp). Sandbox events are relayed with a
//! `SANDBOX_` type prefix and the reporter's `source` and the plain type
//! merged into the payload:
//!
//! ```json
//! { "event_type": "SANDBOX_agent.tool_use", "entity_type": "sandbox", "entity_id": "sb-1",
//!   "payload": { "tool": "bash", "source": "agent", "original_event_type": "agent.tool_use" } }
//! ```
//!
//! History rows (newest first, inside `{ events, total_count, sandbox_id }`):
//!
//! ```json
//! { "id": "...", "sandbox_id": "sb-1", "event_type": "agent.tool_use",
//!   "event_data": {}, "source": "agent", "created_at": "2025-01-01T00:00:00" }
//! ```
//!
//! The server emits naive timestamps; they are read as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use runsync_core::{EntitySnapshot, Envelope, PullError, TransportError};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Type prefix of sandbox events relayed to the push channel
pub const RELAY_PREFIX: &str = "SANDBOX_";

/// One decoded push frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Envelope(Envelope),
    /// Keep-alive or subscription acknowledgement
    Control,
    /// Server-side error report
    Error(String),
}

#[derive(Debug, Deserialize)]
struct PushFrame {
    #[serde(default)]
    id: Option<String>,
    event_type: String,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default, alias = "event_data")]
    payload: Value,
    #[serde(default, alias = "created_at", deserialize_with = "lenient_timestamp_opt")]
    timestamp: Option<DateTime<Utc>>,
}

/// Decode a push frame.
///
/// Relayed sandbox events are restored to the type and payload the history
/// endpoint reports for them. Frames without an entity id are attributed to
/// `fallback_entity`. Frames without an id get a deterministic derived id;
/// frames without a timestamp get the receipt time.
pub fn decode_push_frame(text: &str, fallback_entity: Option<&str>) -> Result<Frame, TransportError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| TransportError::decode(format!("invalid JSON frame: {}", e)))?;

    let Some(object) = value.as_object() else {
        return Err(TransportError::decode("frame is not a JSON object"));
    };
    if let Some(error) = object.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Ok(Frame::Error(message));
    }
    if !object.contains_key("event_type") {
        // {"type": "ping"}, {"status": "subscribed", ...}
        return Ok(Frame::Control);
    }

    let frame: PushFrame = serde_json::from_value(value)
        .map_err(|e| TransportError::decode(format!("invalid event frame: {}", e)))?;
    let entity_id = frame
        .entity_id
        .or_else(|| fallback_entity.map(str::to_string))
        .ok_or_else(|| TransportError::decode("event frame without entity_id"))?;
    let (event_type, payload) = unwrap_relayed(frame.event_type, frame.payload);
    let id = frame
        .id
        .unwrap_or_else(|| Envelope::derive_id(&entity_id, &event_type, &payload));

    Ok(Frame::Envelope(Envelope {
        id,
        entity_id,
        event_type,
        payload,
        timestamp: frame.timestamp.unwrap_or_else(Utc::now),
    }))
}

/// Undo the relay rewrite of a sandbox event
fn unwrap_relayed(event_type: String, mut payload: Value) -> (String, Value) {
    let Some(stripped) = event_type.strip_prefix(RELAY_PREFIX) else {
        return (event_type, payload);
    };
    let mut plain = stripped.to_string();
    if let Some(object) = payload.as_object_mut() {
        if let Some(Value::String(original)) = object.remove("original_event_type") {
            plain = original;
            object.remove("source");
        }
    }
    (plain, payload)
}

/// One row of the history endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEvent {
    pub id: String,
    pub sandbox_id: String,
    pub event_type: String,
    #[serde(default)]
    pub event_data: Value,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl From<HistoryEvent> for Envelope {
    fn from(event: HistoryEvent) -> Self {
        Envelope {
            id: event.id,
            entity_id: event.sandbox_id,
            event_type: event.event_type,
            payload: event.event_data,
            timestamp: event.created_at,
        }
    }
}

/// Body of the history endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    pub events: Vec<HistoryEvent>,
    pub total_count: usize,
    #[serde(default)]
    pub sandbox_id: Option<String>,
}

/// Body of a snapshot endpoint.
///
/// Preview records carry the id of the preview, not of the sandbox; the
/// entity id the caller asked for is kept as the snapshot id.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotBody {
    #[serde(default)]
    pub id: Option<String>,
    pub status: String,
    #[serde(default, deserialize_with = "lenient_timestamp_opt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl SnapshotBody {
    pub fn into_snapshot(self, entity_id: &str) -> EntitySnapshot {
        let mut fields = self.fields;
        if let Some(id) = self.id.filter(|id| id != entity_id) {
            fields.insert("record_id".to_string(), Value::String(id));
        }
        EntitySnapshot {
            id: entity_id.to_string(),
            status: self.status,
            created_at: self.created_at,
            error_message: self.error_message,
            fields,
        }
    }
}

pub fn decode_snapshot(body: &str, entity_id: &str) -> Result<EntitySnapshot, PullError> {
    serde_json::from_str::<SnapshotBody>(body)
        .map(|body| body.into_snapshot(entity_id))
        .map_err(|e| PullError::decode(format!("snapshot of {}: {}", entity_id, e)))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
}

fn lenient_timestamp_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw))),
        None => Ok(None),
    }
}
