// Traits at the transport seams
//
// The engine never talks HTTP or WebSocket itself. It pulls through a
// SnapshotSource and subscribes through a PushTransport:
// - runsync-http provides reqwest / WebSocket / SSE implementations
// - `testing` provides scripted in-memory implementations

use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{PullError, TransportError};
use crate::model::{EntitySnapshot, EventPage, Envelope, Lifecycle};

// ============================================================================
// SnapshotSource - request/response pulls
// ============================================================================

/// Pull side of the server API
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the full current entity record.
    ///
    /// `PullError::NotFound` when the entity does not exist (yet).
    async fn fetch_snapshot(
        &self,
        entity_id: &str,
        lifecycle: Lifecycle,
    ) -> Result<EntitySnapshot, PullError>;

    /// Fetch one page of historical events, oldest first.
    ///
    /// `cursor` is the `next_cursor` of the previous page, `None` for the
    /// first (newest) page.
    async fn fetch_events(
        &self,
        entity_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, PullError>;
}

// ============================================================================
// PushTransport - live event subscription
// ============================================================================

/// What a push subscription selects
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Only events of this entity
    pub entity_id: Option<String>,

    /// Only these event types (exact names)
    pub event_types: Option<BTreeSet<String>>,
}

impl SubscriptionFilter {
    /// Every event of one entity
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            event_types: None,
        }
    }

    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    /// Whether an envelope falls inside this filter
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(entity_id) = &self.entity_id {
            if &envelope.entity_id != entity_id {
                return false;
            }
        }
        if let Some(event_types) = &self.event_types {
            if !event_types.contains(&envelope.event_type) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entity = self.entity_id.as_deref().unwrap_or("*");
        match &self.event_types {
            Some(types) => {
                let types: Vec<&str> = types.iter().map(String::as_str).collect();
                write!(f, "{}[{}]", entity, types.join(","))
            }
            None => write!(f, "{}[*]", entity),
        }
    }
}

/// Stream of envelopes from one open connection.
///
/// Ends (`None`) when the server closes the connection.
pub type PushStream = Pin<Box<dyn Stream<Item = Result<Envelope, TransportError>> + Send>>;

/// Push side of the server API
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open one connection for a filter
    async fn connect(&self, filter: &SubscriptionFilter) -> Result<PushStream, TransportError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str {
        "PushTransport"
    }
}
