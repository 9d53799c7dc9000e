//! Channel client
//!
//! Owns push connections. One transport connection exists per distinct
//! [`SubscriptionFilter`]; every [`SubscriptionHandle`] for that filter shares
//! it. The connection is torn down when the last handle is dropped.
//!
//! ```text
//!            connect ok                 stream error / close
//! Connecting ─────────► Open ─────────────────────────────► Errored
//!     ▲                                                        │
//!     └──────────────── backoff delay ◄────────────────────────┘
//!
//! retries exhausted or last handle released ──► Closed
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::TransportError;
use crate::model::Envelope;
use crate::traits::{PushTransport, SubscriptionFilter};

/// Channel client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Reconnect policy
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::exponential(),
        }
    }
}

impl ChannelConfig {
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// State of one push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

type EventCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;
type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    events: Vec<(u64, EventCallback)>,
    states: Vec<(u64, StateCallback)>,
}

/// One underlying transport connection
struct Connection {
    filter: SubscriptionFilter,
    state: watch::Sender<ConnectionState>,
    retry_count: AtomicU32,
    listeners: Mutex<Listeners>,
    cancel: CancellationToken,
}

impl Connection {
    fn new(filter: SubscriptionFilter) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            filter,
            state,
            retry_count: AtomicU32::new(0),
            listeners: Mutex::new(Listeners::default()),
            cancel: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        debug!(filter = %self.filter, from = %previous, to = %state, "Connection state changed");

        // Invoke outside the lock so callbacks may register or drop handles
        let callbacks: Vec<StateCallback> = self
            .listeners
            .lock()
            .states
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(state);
        }
    }

    fn dispatch(&self, envelope: &Envelope) {
        let callbacks: Vec<EventCallback> = self
            .listeners
            .lock()
            .events
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(envelope);
        }
    }

    fn remove_listeners(&self, handle_id: u64) {
        let mut listeners = self.listeners.lock();
        listeners.events.retain(|(id, _)| *id != handle_id);
        listeners.states.retain(|(id, _)| *id != handle_id);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

struct ConnectionSlot {
    connection: Arc<Connection>,
    refs: usize,
}

struct ChannelInner {
    transport: Arc<dyn PushTransport>,
    config: ChannelConfig,
    connections: Mutex<HashMap<SubscriptionFilter, ConnectionSlot>>,
    next_handle: AtomicU64,
}

impl ChannelInner {
    fn release(&self, handle_id: u64, connection: &Arc<Connection>) {
        connection.remove_listeners(handle_id);

        let mut connections = self.connections.lock();
        let Some(slot) = connections.get_mut(&connection.filter) else {
            return;
        };
        if !Arc::ptr_eq(&slot.connection, connection) {
            return;
        }
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            if let Some(slot) = connections.remove(&connection.filter) {
                slot.connection.cancel.cancel();
                debug!(filter = %connection.filter, "Released last handle, closing connection");
            }
        }
    }
}

/// Push connection manager.
///
/// Cheap to clone; clones share connections.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ChannelInner>,
}

impl ChannelClient {
    pub fn new(transport: Arc<dyn PushTransport>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                config,
                connections: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Acquire a handle for a filter, opening a connection if none exists.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, filter: SubscriptionFilter) -> SubscriptionHandle {
        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.inner.connections.lock();

        let connection = match connections.get_mut(&filter) {
            Some(slot) => {
                slot.refs += 1;
                // A connection that gave up retrying gets a fresh start
                if slot.connection.current_state() == ConnectionState::Closed
                    && !slot.connection.cancel.is_cancelled()
                {
                    self.spawn(slot.connection.clone());
                }
                slot.connection.clone()
            }
            None => {
                let connection = Arc::new(Connection::new(filter.clone()));
                connections.insert(
                    filter.clone(),
                    ConnectionSlot {
                        connection: connection.clone(),
                        refs: 1,
                    },
                );
                info!(filter = %filter, transport = self.inner.transport.name(), "Opening push connection");
                self.spawn(connection.clone());
                connection
            }
        };

        SubscriptionHandle {
            id,
            connection,
            client: Arc::downgrade(&self.inner),
        }
    }

    /// Release a handle. Equivalent to dropping it.
    pub fn close(&self, handle: SubscriptionHandle) {
        drop(handle);
    }

    /// Register an envelope listener on a handle
    pub fn on_event(
        &self,
        handle: &SubscriptionHandle,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) {
        handle.on_event(callback);
    }

    /// Register a connection state listener on a handle
    pub fn on_state_change(
        &self,
        handle: &SubscriptionHandle,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) {
        handle.on_state_change(callback);
    }

    /// Number of live transport connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    fn spawn(&self, connection: Arc<Connection>) {
        let transport = self.inner.transport.clone();
        let backoff = self.inner.config.backoff.clone();
        tokio::spawn(run_connection(transport, connection, backoff));
    }
}

/// Connection loop: connect, forward envelopes, back off, repeat.
async fn run_connection(
    transport: Arc<dyn PushTransport>,
    connection: Arc<Connection>,
    backoff: BackoffPolicy,
) {
    let cancel = connection.cancel.clone();
    let mut failures: u32 = 0;

    loop {
        connection.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.connect(&connection.filter) => result,
        };

        let error = match connected {
            Ok(mut stream) => {
                failures = 0;
                connection.retry_count.store(0, Ordering::Relaxed);
                connection.set_state(ConnectionState::Open);

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => None,
                        next = stream.next() => Some(next),
                    };
                    let Some(next) = next else {
                        connection.set_state(ConnectionState::Closed);
                        return;
                    };

                    match next {
                        Some(Ok(envelope)) => {
                            if connection.filter.matches(&envelope) {
                                connection.dispatch(&envelope);
                            } else {
                                debug!(
                                    filter = %connection.filter,
                                    entity_id = %envelope.entity_id,
                                    event_type = %envelope.event_type,
                                    "Dropping envelope outside subscription filter"
                                );
                            }
                        }
                        Some(Err(e)) if !e.is_fatal_for_connection() => {
                            warn!(filter = %connection.filter, error = %e, "Skipping undecodable frame");
                        }
                        Some(Err(e)) => break e,
                        None => break TransportError::dropped("server closed the connection"),
                    }
                }
            }
            Err(e) => e,
        };

        failures += 1;
        connection.retry_count.store(failures, Ordering::Relaxed);
        connection.set_state(ConnectionState::Errored);

        if !backoff.has_retries_remaining(failures) {
            warn!(filter = %connection.filter, error = %error, failures, "Push connection retries exhausted");
            break;
        }

        let delay = backoff.delay_for_retry(failures);
        warn!(
            filter = %connection.filter,
            error = %error,
            retry = failures,
            delay_ms = delay.as_millis() as u64,
            "Push connection failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    connection.set_state(ConnectionState::Closed);
}

/// Scoped acquisition of a push subscription.
///
/// Dropping the handle removes its listeners and releases its reference on
/// the shared connection.
pub struct SubscriptionHandle {
    id: u64,
    connection: Arc<Connection>,
    client: Weak<ChannelInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.connection.filter
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.current_state()
    }

    /// Receiver that observes every state change
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state.subscribe()
    }

    /// Consecutive failed attempts since the connection was last open
    pub fn retry_count(&self) -> u32 {
        self.connection.retry_count.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Called for every envelope, in arrival order, until the handle drops
    pub fn on_event(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.connection
            .listeners
            .lock()
            .events
            .push((self.id, Arc::new(callback)));
    }

    /// Called on every state transition until the handle drops
    pub fn on_state_change(&self, callback: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.connection
            .listeners
            .lock()
            .states
            .push((self.id, Arc::new(callback)));
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        match self.client.upgrade() {
            Some(client) => client.release(self.id, &self.connection),
            None => {
                self.connection.remove_listeners(self.id);
                self.connection.cancel.cancel();
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("filter", &self.connection.filter)
            .field("state", &self.state())
            .finish()
    }
}
