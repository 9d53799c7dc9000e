// HTTP / WebSocket / SSE transports for runsync
//
// Implements the engine's seams against the job server:
// - HttpSnapshotSource: snapshot and history pulls via reqwest
// - WsPushTransport / SsePushTransport: live event subscriptions
// - wire: decoding of the server's push frames and history rows

pub mod config;
pub mod push;
pub mod source;
pub mod wire;

use std::sync::Arc;

use runsync_core::{ConfigError, SyncConfig, SyncEngine};

pub use config::{HttpConfig, PushKind, SessionKind, DEFAULT_API_URL};
pub use push::{push_transport, SsePushTransport, WsPushTransport};
pub use source::HttpSnapshotSource;
pub use wire::{decode_push_frame, Frame};

/// Build an engine that talks to the server described by `http`
pub fn engine(http: HttpConfig, sync: SyncConfig) -> Result<SyncEngine, ConfigError> {
    let source = Arc::new(HttpSnapshotSource::new(http.clone())?);
    let transport = push_transport(http)?;
    SyncEngine::new(sync, source, transport)
}
