// Push/Pull Reconciliation Engine
//
// Keeps a live, deduplicated, correctly-ordered view of a remote job's event
// stream and lifecycle status by combining push notifications (WebSocket/SSE)
// with request/response pulls.
//
// Key design decisions:
// - Push is a signal, pull is the truth: push payloads append to the event log
//   but never write the snapshot cache
// - Transport-agnostic via traits (SnapshotSource, PushTransport)
// - Status derivation is a pure function over (snapshot, events, vocabulary)
// - Every background task (connection, poll loop, debounce timer) is owned by
//   a handle and cancelled on drop

pub mod backoff;
pub mod bridge;
pub mod cache;
pub mod channel;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod model;
pub mod pattern;
pub mod scheduler;
pub mod status;
pub mod traits;

// Logging setup
pub mod telemetry;

// In-memory implementations for tests and demos
pub mod testing;

// Re-exports for convenience
pub use backoff::BackoffPolicy;
pub use bridge::{BridgeConfig, InvalidationBridge};
pub use cache::{CacheEntry, SnapshotCache};
pub use channel::{ChannelClient, ChannelConfig, ConnectionState, SubscriptionHandle};
pub use config::{HistoryConfig, SyncConfig};
pub use debounce::{DebouncedAction, Debouncer};
pub use engine::{EntityView, EntityWatch, SyncEngine, WatchOptions};
pub use error::{ConfigError, PullError, TransportError};
pub use event_log::{EventLogConfig, EventLogStore};
pub use model::{EntitySnapshot, EventPage, Envelope, Lifecycle};
pub use pattern::{EventPattern, EventPatternSet};
pub use scheduler::{
    next_poll, PollCounters, PollDecision, PollHandle, PollObservation, PollOptions,
    PollingConfig, PollingScheduler, SnapshotFetcher,
};
pub use status::{derive_status, EventKind, EventVocabulary, Status, VocabularyRule};
pub use traits::{PushStream, PushTransport, SnapshotSource, SubscriptionFilter};
