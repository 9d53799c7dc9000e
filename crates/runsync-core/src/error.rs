// Error types for the reconciliation engine
//
// None of these escape to consumers of `SyncEngine` at runtime: transport
// errors become connection state, pull errors become cache flags. Only
// configuration errors are returned directly.

use serde::Serialize;
use thiserror::Error;

use crate::model::Lifecycle;

/// Push channel failures. Retried by the channel client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Established connection dropped
    #[error("Connection dropped: {0}")]
    Dropped(String),

    /// Server sent an error frame
    #[error("Server error frame: {0}")]
    Server(String),

    /// A frame could not be decoded into an envelope
    #[error("Decode error: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn connect(msg: impl Into<String>) -> Self {
        TransportError::Connect(msg.into())
    }

    pub fn dropped(msg: impl Into<String>) -> Self {
        TransportError::Dropped(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        TransportError::Decode(msg.into())
    }

    /// Decode errors skip one frame; everything else ends the connection
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(self, TransportError::Decode(_))
    }
}

/// Snapshot or history pull failures.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PullError {
    /// Entity does not exist (yet). Not an error for the engine.
    #[error("Not found")]
    NotFound,

    /// Request never produced a response
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Response body did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// The source has no snapshot endpoint for this lifecycle; the event
    /// history is the only pull
    #[error("No snapshot endpoint for {0} entities")]
    Unsupported(Lifecycle),
}

impl PullError {
    pub fn http(msg: impl Into<String>) -> Self {
        PullError::Http(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        PullError::Decode(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PullError::NotFound)
    }
}

/// Invalid configuration detected at construction time.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid event pattern '{0}': wildcard must be a whole leading or trailing segment")]
    InvalidPattern(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Missing configuration: {0}")]
    Missing(&'static str),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
