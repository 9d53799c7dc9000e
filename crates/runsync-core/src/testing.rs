//! In-memory fakes for the transport seams
//!
//! - [`ScriptedSource`]: a [`SnapshotSource`] with scripted snapshots and a
//!   paged history that behaves like the server's (newest page first)
//! - [`ChannelTransport`]: a [`PushTransport`] whose connections are fed by
//!   the test

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;

use crate::error::{PullError, TransportError};
use crate::model::{EntitySnapshot, EventPage, Envelope, Lifecycle};
use crate::traits::{PushStream, PushTransport, SnapshotSource, SubscriptionFilter};

/// Scripted pull side.
///
/// Snapshot answers are queued per entity; the last queued answer repeats.
/// Entities without answers are not found.
#[derive(Default)]
pub struct ScriptedSource {
    snapshots: Mutex<HashMap<String, VecDeque<Result<EntitySnapshot, PullError>>>>,
    history: Mutex<HashMap<String, Vec<Envelope>>>,
    history_errors: Mutex<HashMap<String, PullError>>,
    snapshot_calls: Mutex<HashMap<String, usize>>,
    history_calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the script of `snapshot.id` with one repeating answer
    pub fn set_snapshot(&self, snapshot: EntitySnapshot) {
        let id = snapshot.id.clone();
        self.snapshots
            .lock()
            .insert(id, VecDeque::from([Ok(snapshot)]));
    }

    /// Queue an answer behind the current one
    pub fn queue_snapshot(&self, entity_id: &str, answer: Result<EntitySnapshot, PullError>) {
        self.snapshots
            .lock()
            .entry(entity_id.to_string())
            .or_default()
            .push_back(answer);
    }

    /// Make every following pull fail
    pub fn set_error(&self, entity_id: &str, error: PullError) {
        self.snapshots
            .lock()
            .insert(entity_id.to_string(), VecDeque::from([Err(error)]));
    }

    /// Full history of an entity, oldest first
    pub fn set_history(&self, entity_id: &str, events: Vec<Envelope>) {
        self.history.lock().insert(entity_id.to_string(), events);
    }

    pub fn append_history(&self, envelope: Envelope) {
        self.history
            .lock()
            .entry(envelope.entity_id.clone())
            .or_default()
            .push(envelope);
    }

    pub fn fail_history(&self, entity_id: &str, error: PullError) {
        self.history_errors.lock().insert(entity_id.to_string(), error);
    }

    pub fn snapshot_calls(&self, entity_id: &str) -> usize {
        self.snapshot_calls.lock().get(entity_id).copied().unwrap_or(0)
    }

    pub fn history_calls(&self, entity_id: &str) -> usize {
        self.history_calls.lock().get(entity_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch_snapshot(
        &self,
        entity_id: &str,
        _lifecycle: Lifecycle,
    ) -> Result<EntitySnapshot, PullError> {
        *self
            .snapshot_calls
            .lock()
            .entry(entity_id.to_string())
            .or_default() += 1;

        let mut snapshots = self.snapshots.lock();
        let Some(script) = snapshots.get_mut(entity_id) else {
            return Err(PullError::NotFound);
        };
        let answer = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        answer.unwrap_or(Err(PullError::NotFound))
    }

    async fn fetch_events(
        &self,
        entity_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, PullError> {
        *self
            .history_calls
            .lock()
            .entry(entity_id.to_string())
            .or_default() += 1;

        if let Some(error) = self.history_errors.lock().get(entity_id) {
            return Err(error.clone());
        }

        // Cursor is the number of newest events already returned
        let offset = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|e| PullError::decode(format!("bad cursor '{}': {}", raw, e)))?,
            None => 0,
        };

        let history = self.history.lock();
        let events = history.get(entity_id).map(Vec::as_slice).unwrap_or(&[]);
        let end = events.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);

        Ok(EventPage {
            events: events[start..end].to_vec(),
            next_cursor: (start > 0).then(|| (offset + (end - start)).to_string()),
        })
    }
}

type Sender = mpsc::UnboundedSender<Result<Envelope, TransportError>>;

/// Push side fed by the test.
///
/// Every `connect` opens a fresh in-memory stream. `push` delivers to the
/// streams whose filter matches; `disconnect_all` ends every stream as if the
/// server had closed it.
#[derive(Default)]
pub struct ChannelTransport {
    streams: Mutex<Vec<(SubscriptionFilter, Sender)>>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Deliver to every open stream whose filter matches
    pub fn push(&self, envelope: Envelope) -> usize {
        self.send(|filter| filter.matches(&envelope), Ok(envelope.clone()))
    }

    /// Deliver to every open stream, ignoring filters
    pub fn push_unfiltered(&self, envelope: Envelope) -> usize {
        self.send(|_| true, Ok(envelope))
    }

    /// Deliver an error item to every open stream
    pub fn push_error(&self, error: TransportError) -> usize {
        self.send(|_| true, Err(error))
    }

    pub fn disconnect_all(&self) {
        self.streams.lock().clear();
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Streams whose receiving end is still alive
    pub fn active_streams(&self) -> usize {
        let mut streams = self.streams.lock();
        streams.retain(|(_, tx)| !tx.is_closed());
        streams.len()
    }

    fn send(
        &self,
        selects: impl Fn(&SubscriptionFilter) -> bool,
        item: Result<Envelope, TransportError>,
    ) -> usize {
        let mut streams = self.streams.lock();
        streams.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (filter, tx) in streams.iter() {
            if selects(filter) && tx.unbounded_send(item.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl PushTransport for ChannelTransport {
    async fn connect(&self, filter: &SubscriptionFilter) -> Result<PushStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::connect("scripted connect failure"));
        }

        let (tx, rx) = mpsc::unbounded();
        self.streams.lock().push((filter.clone(), tx));
        Ok(Box::pin(rx))
    }

    fn name(&self) -> &'static str {
        "ChannelTransport"
    }
}
