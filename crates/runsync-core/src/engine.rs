//! Sync engine
//!
//! Wires the channel client, event log, snapshot cache, polling scheduler and
//! invalidation bridge into one view model per watched entity:
//!
//! ```text
//!  push ──► ChannelClient ──► EventLogStore.merge ──► derive status
//!                │                                       ▲
//!                └──► InvalidationBridge ──► pull ──► SnapshotCache
//!                                              ▲
//!                      PollingScheduler ───────┘
//! ```
//!
//! Every entity's merge and status recompute happen under that entity's log
//! lock, so derived state always reflects exactly one merged log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::bridge::InvalidationBridge;
use crate::cache::SnapshotCache;
use crate::channel::{ChannelClient, ConnectionState, SubscriptionHandle};
use crate::config::SyncConfig;
use crate::error::{ConfigError, PullError};
use crate::event_log::EventLogStore;
use crate::model::{EntitySnapshot, Envelope, Lifecycle};
use crate::scheduler::{PollHandle, PollObservation, PollOptions, PollingScheduler, SnapshotFetcher};
use crate::status::{derive_status, Status};
use crate::traits::{PushTransport, SnapshotSource, SubscriptionFilter};

/// How to watch an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub lifecycle: Lifecycle,

    /// The caller just created the entity; a not-found answer means "not
    /// ready yet" and keeps polling
    pub just_created: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::agent_run()
    }
}

impl WatchOptions {
    pub fn agent_run() -> Self {
        Self {
            lifecycle: Lifecycle::AgentRun,
            just_created: false,
        }
    }

    pub fn session() -> Self {
        Self {
            lifecycle: Lifecycle::Session,
            just_created: false,
        }
    }

    pub fn just_created(mut self) -> Self {
        self.just_created = true;
        self
    }
}

/// Everything a consumer renders for one entity
#[derive(Debug, Clone, Serialize)]
pub struct EntityView {
    pub entity_id: String,
    pub lifecycle: Lifecycle,
    pub status: Status,
    pub connection: ConnectionState,
    pub retry_count: u32,
    pub stale: bool,
    pub not_found: bool,
    /// A poll loop is scheduled; when false only push or a refresh can
    /// change the entity
    pub polling: bool,
    pub last_error: Option<PullError>,
    pub snapshot: Option<EntitySnapshot>,
    pub events: Vec<Envelope>,
}

impl EntityView {
    /// Failure reason reported by the server for a failed entity
    pub fn error_message(&self) -> Option<&str> {
        if self.status != Status::Failed {
            return None;
        }
        self.snapshot.as_ref()?.error_message.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-entity engine state, shared by every watch of the entity
struct EntityState {
    entity_id: String,
    lifecycle: Lifecycle,
    poll_options: PollOptions,
    status: Mutex<Status>,
    changes: watch::Sender<u64>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    poll: Mutex<Option<PollHandle>>,
    /// Outcome of the latest pull made while a poll loop was running
    pending_poll: Mutex<Option<PollObservation>>,
    released: AtomicBool,
}

impl EntityState {
    fn new(entity_id: &str, options: WatchOptions) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            entity_id: entity_id.to_string(),
            lifecycle: options.lifecycle,
            poll_options: PollOptions {
                just_created: options.just_created,
            },
            status: Mutex::new(Status::initial(options.lifecycle)),
            changes,
            subscription: Mutex::new(None),
            poll: Mutex::new(None),
            pending_poll: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn connection(&self) -> (ConnectionState, u32) {
        match self.subscription.lock().as_ref() {
            Some(handle) => (handle.state(), handle.retry_count()),
            None => (ConnectionState::Connecting, 0),
        }
    }
}

struct EntitySlot {
    state: Arc<EntityState>,
    watchers: usize,
}

struct EngineInner {
    config: SyncConfig,
    source: Arc<dyn SnapshotSource>,
    channel: ChannelClient,
    scheduler: PollingScheduler,
    cache: Arc<SnapshotCache>,
    log: Arc<EventLogStore>,
    bridge: InvalidationBridge,
    fetcher: Arc<dyn SnapshotFetcher>,
    entities: Mutex<HashMap<String, EntitySlot>>,
    self_ref: Weak<EngineInner>,
}

/// Routes scheduler and bridge pulls back into the engine without keeping it
/// alive.
struct EngineFetcher(Weak<EngineInner>);

#[async_trait]
impl SnapshotFetcher for EngineFetcher {
    async fn fetch(&self, entity_id: &str) -> PollObservation {
        match self.0.upgrade() {
            Some(engine) => engine.pull(entity_id).await,
            // Engine gone; stop quietly
            None => PollObservation::NotFound,
        }
    }

    fn stopped(&self, entity_id: &str, last: &PollObservation) {
        if let Some(engine) = self.0.upgrade() {
            engine.on_poll_stopped(entity_id, last);
        }
    }
}

impl EngineInner {
    fn state(&self, entity_id: &str) -> Option<Arc<EntityState>> {
        self.entities
            .lock()
            .get(entity_id)
            .map(|slot| slot.state.clone())
    }

    fn acquire(&self, entity_id: &str, options: WatchOptions) -> (Arc<EntityState>, bool) {
        let mut entities = self.entities.lock();
        if let Some(slot) = entities.get_mut(entity_id) {
            slot.watchers += 1;
            if slot.state.lifecycle != options.lifecycle {
                warn!(
                    entity_id = %entity_id,
                    watched_as = %slot.state.lifecycle,
                    requested = %options.lifecycle,
                    "Entity already watched with another lifecycle"
                );
            }
            return (slot.state.clone(), false);
        }

        let state = Arc::new(EntityState::new(entity_id, options));
        self.cache.register(entity_id, options.lifecycle);
        self.log.open(entity_id);
        entities.insert(
            entity_id.to_string(),
            EntitySlot {
                state: state.clone(),
                watchers: 1,
            },
        );
        (state, true)
    }

    fn release(&self, entity_id: &str) {
        let removed = {
            let mut entities = self.entities.lock();
            let Some(slot) = entities.get_mut(entity_id) else {
                return;
            };
            slot.watchers = slot.watchers.saturating_sub(1);
            if slot.watchers > 0 {
                return;
            }
            entities.remove(entity_id).map(|slot| slot.state)
        };
        let Some(state) = removed else {
            return;
        };

        state.released.store(true, Ordering::Release);
        let subscription = state.subscription.lock().take();
        let poll = state.poll.lock().take();
        drop(subscription);
        drop(poll);

        self.bridge.forget(entity_id);
        self.cache.unregister(entity_id);
        self.log.discard(entity_id);
        info!(entity_id = %entity_id, "Stopped watching entity");
    }

    /// First watch of an entity: seed history, subscribe, pull, poll
    async fn start(&self, state: &Arc<EntityState>) {
        info!(entity_id = %state.entity_id, lifecycle = %state.lifecycle, "Watching entity");

        self.catch_up(state).await;
        if state.is_released() {
            return;
        }

        let handle = self.channel.open(SubscriptionFilter::entity(&state.entity_id));
        let engine = self.self_ref.clone();
        let entity = Arc::downgrade(state);
        handle.on_event(move |envelope| {
            if let (Some(engine), Some(state)) = (engine.upgrade(), entity.upgrade()) {
                engine.on_push(&state, envelope);
            }
        });
        let engine = self.self_ref.clone();
        let entity = Arc::downgrade(state);
        handle.on_state_change(move |connection| {
            if let (Some(engine), Some(state)) = (engine.upgrade(), entity.upgrade()) {
                engine.on_connection_state(&state, connection);
            }
        });
        if state.is_released() {
            return;
        }
        *state.subscription.lock() = Some(handle);

        self.pull(&state.entity_id).await;
    }

    fn on_push(&self, state: &EntityState, envelope: &Envelope) {
        if state.is_released() {
            return;
        }

        let appended = self.log.merge_then(
            &state.entity_id,
            std::iter::once(envelope.clone()),
            |appended, events| {
                if appended > 0 {
                    self.apply_status(state, events);
                }
                appended
            },
        );
        if appended > 0 {
            state.notify();
        }

        if !self.log.is_noise(&envelope.event_type) {
            self.bridge.on_push_event(envelope);
        }
    }

    fn on_connection_state(&self, state: &EntityState, connection: ConnectionState) {
        state.notify();
        if connection != ConnectionState::Open || state.is_released() {
            return;
        }

        // Recover events missed while the channel was down
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        let entity_id = state.entity_id.clone();
        tokio::spawn(async move {
            if let Some(state) = engine.state(&entity_id) {
                engine.catch_up(&state).await;
            }
        });
    }

    async fn catch_up(&self, state: &EntityState) {
        if let Err(e) = self.pull_history(state).await {
            warn!(entity_id = %state.entity_id, error = %e, "History pull failed");
            self.cache.record_failure(&state.entity_id, e);
            state.notify();
        }
    }

    /// Page backwards through history until it overlaps the log, then merge
    /// oldest first.
    #[instrument(level = "debug", skip(self, state), fields(entity_id = %state.entity_id))]
    async fn pull_history(&self, state: &EntityState) -> Result<usize, PullError> {
        let history = &self.config.history;
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..history.max_pages.max(1) {
            let page = self
                .source
                .fetch_events(&state.entity_id, cursor.as_deref(), history.page_size)
                .await?;
            let overlaps = page
                .events
                .iter()
                .any(|e| self.log.holds(&state.entity_id, e));
            let exhausted = page.events.is_empty() || page.next_cursor.is_none();
            cursor = page.next_cursor;
            pages.push(page.events);
            if overlaps || exhausted {
                break;
            }
        }

        if state.is_released() {
            return Ok(0);
        }

        let batch: Vec<Envelope> = pages.into_iter().rev().flatten().collect();
        let appended = self.log.merge_then(&state.entity_id, batch, |appended, events| {
            if appended > 0 {
                self.apply_status(state, events);
            }
            appended
        });
        if appended > 0 {
            debug!(appended, "Merged history");
            state.notify();
        }
        Ok(appended)
    }

    /// Pull the snapshot, update the cache and re-derive status.
    ///
    /// Entities without a snapshot endpoint pull their history instead.
    #[instrument(level = "debug", skip(self))]
    async fn pull(&self, entity_id: &str) -> PollObservation {
        let Some(state) = self.state(entity_id) else {
            return PollObservation::NotFound;
        };

        let observation = match self.source.fetch_snapshot(entity_id, state.lifecycle).await {
            Ok(snapshot) => {
                if Status::parse(state.lifecycle, &snapshot.status).is_none() {
                    warn!(
                        entity_id = %entity_id,
                        status = %snapshot.status,
                        lifecycle = %state.lifecycle,
                        "Unknown snapshot status, treating as initial"
                    );
                }
                self.cache.record_snapshot(entity_id, snapshot);
                PollObservation::Status(self.recompute(&state))
            }
            Err(PullError::Unsupported(_)) => match self.pull_history(&state).await {
                Ok(_) => {
                    self.cache.record_events_only(entity_id);
                    PollObservation::Status(self.recompute(&state))
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "History pull failed");
                    self.cache.record_failure(entity_id, e);
                    PollObservation::Failed
                }
            },
            Err(PullError::NotFound) => {
                debug!(entity_id = %entity_id, "Entity not found yet");
                self.cache.record_not_found(entity_id);
                self.recompute(&state);
                PollObservation::NotFound
            }
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "Snapshot pull failed");
                self.cache.record_failure(entity_id, e);
                PollObservation::Failed
            }
        };

        self.ensure_polling(&state, &observation);
        state.notify();
        observation
    }

    fn recompute(&self, state: &EntityState) -> Status {
        self.log
            .with_entries(&state.entity_id, |events| self.apply_status(state, events))
            .unwrap_or_else(|| self.apply_status(state, &[]))
    }

    /// Re-derive and store the status. Terminal statuses are pinned.
    fn apply_status(&self, state: &EntityState, events: &[Envelope]) -> Status {
        let snapshot = self.cache.snapshot(&state.entity_id);
        let derived = derive_status(
            state.lifecycle,
            snapshot.as_ref(),
            events,
            self.config.vocabulary(state.lifecycle),
        );

        let mut current = state.status.lock();
        if current.is_terminal() {
            if derived != *current {
                debug!(entity_id = %state.entity_id, pinned = %*current, derived = %derived, "Ignoring change after terminal status");
            }
            return *current;
        }
        if derived != *current {
            info!(entity_id = %state.entity_id, from = %*current, to = %derived, "Status changed");
            *current = derived;
        }
        derived
    }

    /// Start a poll loop unless one is running or `last` means stop
    fn ensure_polling(&self, state: &EntityState, last: &PollObservation) {
        if state.is_released() {
            return;
        }
        let mut poll = state.poll.lock();
        if poll.as_ref().is_some_and(|handle| !handle.is_finished()) {
            // The loop may be on its way out; it re-checks this when it stops
            *state.pending_poll.lock() = Some(*last);
            return;
        }
        *state.pending_poll.lock() = None;
        *poll = self.scheduler.resume(
            state.entity_id.clone(),
            self.fetcher.clone(),
            state.poll_options,
            last,
        );
        if poll.is_some() {
            debug!(entity_id = %state.entity_id, ?last, "Polling armed");
        }
    }

    /// The running poll loop stopped on `last`. A pull made elsewhere while
    /// it ran may have seen a different answer; continue from that one.
    fn on_poll_stopped(&self, entity_id: &str, last: &PollObservation) {
        let Some(state) = self.state(entity_id) else {
            return;
        };
        if state.is_released() {
            return;
        }
        {
            let mut poll = state.poll.lock();
            let pending = state.pending_poll.lock().take();
            let next = pending.filter(|pending| pending != last).and_then(|pending| {
                self.scheduler.resume(
                    state.entity_id.clone(),
                    self.fetcher.clone(),
                    state.poll_options,
                    &pending,
                )
            });
            if next.is_some() {
                debug!(entity_id = %entity_id, ?pending, "Polling re-armed after stop");
            }
            *poll = next;
        }
        state.notify();
    }

    fn view(&self, entity_id: &str) -> Option<EntityView> {
        let state = self.state(entity_id)?;
        let entry = self.cache.get(entity_id);
        let (connection, retry_count) = state.connection();
        let status = *state.status.lock();
        let view = Some(EntityView {
            entity_id: entity_id.to_string(),
            lifecycle: state.lifecycle,
            status,
            connection,
            retry_count,
            stale: entry.as_ref().is_some_and(|e| e.is_stale()),
            not_found: entry.as_ref().is_some_and(|e| e.not_found),
            polling: state
                .poll
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
            last_error: entry.as_ref().and_then(|e| e.last_error.clone()),
            snapshot: entry.and_then(|e| e.snapshot),
            events: self.log.snapshot(entity_id),
        });
        view
    }

    fn status(&self, entity_id: &str) -> Option<Status> {
        self.state(entity_id).map(|state| *state.status.lock())
    }

    fn is_connected(&self, entity_id: &str) -> bool {
        self.state(entity_id)
            .is_some_and(|state| state.connection().0 == ConnectionState::Open)
    }

    fn changes(&self, entity_id: &str) -> Option<watch::Receiver<u64>> {
        self.state(entity_id).map(|state| state.changes.subscribe())
    }

    async fn refresh(&self, entity_id: &str) -> Option<PollObservation> {
        let state = self.state(entity_id)?;
        self.catch_up(&state).await;
        Some(self.pull(entity_id).await)
    }
}

/// Client-side reconciliation engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn SnapshotSource>,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = Arc::new(SnapshotCache::new());
        let log = Arc::new(EventLogStore::new(config.event_log.clone()));
        let channel = ChannelClient::new(transport, config.channel.clone());
        let scheduler = PollingScheduler::new(config.polling.clone());

        let inner = Arc::new_cyclic(|self_ref: &Weak<EngineInner>| {
            let fetcher: Arc<dyn SnapshotFetcher> = Arc::new(EngineFetcher(self_ref.clone()));
            EngineInner {
                bridge: InvalidationBridge::new(config.bridge.clone(), cache.clone(), fetcher.clone()),
                config,
                source,
                channel,
                scheduler,
                cache,
                log,
                fetcher,
                entities: Mutex::new(HashMap::new()),
                self_ref: self_ref.clone(),
            }
        });

        Ok(Self { inner })
    }

    /// Start watching an entity.
    ///
    /// The first watch of an entity seeds its history, subscribes to push,
    /// pulls the snapshot and starts polling before returning. Further
    /// watches share that state.
    pub async fn watch(&self, entity_id: impl Into<String>, options: WatchOptions) -> EntityWatch {
        let entity_id = entity_id.into();
        let (state, first) = self.inner.acquire(&entity_id, options);

        // Created before awaiting so a cancelled `watch` still releases
        let watch = EntityWatch {
            entity_id,
            engine: Arc::downgrade(&self.inner),
            active: true,
        };
        if first {
            self.inner.start(&state).await;
        }
        watch
    }

    /// Event log of an entity, in arrival order
    pub fn events(&self, entity_id: &str) -> Vec<Envelope> {
        self.inner.log.snapshot(entity_id)
    }

    pub fn status(&self, entity_id: &str) -> Option<Status> {
        self.inner.status(entity_id)
    }

    pub fn is_connected(&self, entity_id: &str) -> bool {
        self.inner.is_connected(entity_id)
    }

    pub fn is_stale(&self, entity_id: &str) -> bool {
        self.inner.cache.is_stale(entity_id)
    }

    /// Catch up history and pull the snapshot now.
    ///
    /// `None` when the entity is not watched.
    pub async fn refresh(&self, entity_id: &str) -> Option<PollObservation> {
        self.inner.refresh(entity_id).await
    }

    pub fn view(&self, entity_id: &str) -> Option<EntityView> {
        self.inner.view(entity_id)
    }

    /// Receiver bumped whenever anything about the entity may have changed
    pub fn changes(&self, entity_id: &str) -> Option<watch::Receiver<u64>> {
        self.inner.changes(entity_id)
    }

    /// Ids of all watched entities
    pub fn watched(&self) -> Vec<String> {
        self.inner.entities.lock().keys().cloned().collect()
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.inner.cache
    }

    pub fn event_log(&self) -> &EventLogStore {
        &self.inner.log
    }

    pub fn channel(&self) -> &ChannelClient {
        &self.inner.channel
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

/// Scoped watch of one entity. Dropping it releases the watch.
pub struct EntityWatch {
    entity_id: String,
    engine: Weak<EngineInner>,
    active: bool,
}

impl EntityWatch {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn status(&self) -> Option<Status> {
        self.engine.upgrade()?.status(&self.entity_id)
    }

    pub fn events(&self) -> Vec<Envelope> {
        self.engine
            .upgrade()
            .map(|engine| engine.log.snapshot(&self.entity_id))
            .unwrap_or_default()
    }

    pub fn view(&self) -> Option<EntityView> {
        self.engine.upgrade()?.view(&self.entity_id)
    }

    pub fn changes(&self) -> Option<watch::Receiver<u64>> {
        self.engine.upgrade()?.changes(&self.entity_id)
    }

    pub fn is_connected(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|engine| engine.is_connected(&self.entity_id))
    }

    /// Release the watch now
    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.release(&self.entity_id);
        }
    }
}

impl Drop for EntityWatch {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for EntityWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityWatch")
            .field("entity_id", &self.entity_id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChannelTransport, ScriptedSource};
    use std::time::Duration;

    fn engine(source: &Arc<ScriptedSource>) -> SyncEngine {
        SyncEngine::new(
            SyncConfig::default(),
            source.clone(),
            Arc::new(ChannelTransport::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = SyncConfig::default().with_history(crate::config::HistoryConfig {
            page_size: 0,
            max_pages: 1,
        });
        let result = SyncEngine::new(
            config,
            Arc::new(ScriptedSource::new()),
            Arc::new(ChannelTransport::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchers_share_state_until_last_release() {
        let source = Arc::new(ScriptedSource::new());
        source.set_snapshot(EntitySnapshot::new("sb-1", "running"));
        let engine = engine(&source);

        let first = engine.watch("sb-1", WatchOptions::agent_run()).await;
        let second = engine.watch("sb-1", WatchOptions::agent_run()).await;
        assert_eq!(source.snapshot_calls("sb-1"), 1);

        drop(first);
        assert_eq!(engine.status("sb-1"), Some(Status::Running));
        assert!(engine.cache().contains("sb-1"));

        second.stop();
        assert_eq!(engine.status("sb-1"), None);
        assert!(!engine.cache().contains("sb-1"));
        assert!(!engine.event_log().contains("sb-1"));
        assert!(engine.watched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_exposes_failure_reason() {
        let source = Arc::new(ScriptedSource::new());
        source.set_snapshot(EntitySnapshot::new("sb-1", "failed").with_error_message("OOM killed"));
        let engine = engine(&source);

        let watch = engine.watch("sb-1", WatchOptions::agent_run()).await;
        let view = watch.view().unwrap();

        assert_eq!(view.status, Status::Failed);
        assert_eq!(view.error_message(), Some("OOM killed"));
        assert!(view.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_pull_during_final_poll_rearms() {
        let source = Arc::new(ScriptedSource::new());
        source.set_snapshot(EntitySnapshot::new("pv-1", "creating"));
        let engine = engine(&source);

        let _watch = engine.watch("pv-1", WatchOptions::session()).await;
        assert_eq!(source.snapshot_calls("pv-1"), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // A pull made elsewhere sees a busy entity while the loop is still
        // alive, then the loop stops on a stable answer
        let state = engine.inner.state("pv-1").unwrap();
        engine
            .inner
            .ensure_polling(&state, &PollObservation::Status(Status::Prompting));
        engine
            .inner
            .on_poll_stopped("pv-1", &PollObservation::Status(Status::Ready));

        // The old loop (due at 3s) is gone; the re-armed one polls at 5s
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(source.snapshot_calls("pv-1"), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.snapshot_calls("pv-1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_latest_answer_ends_polling() {
        let source = Arc::new(ScriptedSource::new());
        source.set_snapshot(EntitySnapshot::new("pv-1", "creating"));
        let engine = engine(&source);

        let watch = engine.watch("pv-1", WatchOptions::session()).await;
        assert!(watch.view().unwrap().polling);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut changes = watch.changes().unwrap();
        let _ = changes.borrow_and_update();

        let state = engine.inner.state("pv-1").unwrap();
        engine
            .inner
            .ensure_polling(&state, &PollObservation::Status(Status::Ready));
        engine
            .inner
            .on_poll_stopped("pv-1", &PollObservation::Status(Status::Ready));

        assert!(state.pending_poll.lock().is_none());
        assert!(!watch.view().unwrap().polling);
        assert!(changes.has_changed().unwrap());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.snapshot_calls("pv-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_entity_is_not_polled() {
        let source = Arc::new(ScriptedSource::new());
        let engine = engine(&source);

        let watch = engine.watch("sb-404", WatchOptions::agent_run()).await;
        let view = watch.view().unwrap();

        assert!(view.not_found);
        assert!(!view.polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatched_entity_has_no_view() {
        let source = Arc::new(ScriptedSource::new());
        let engine = engine(&source);

        assert!(engine.view("sb-1").is_none());
        assert!(engine.refresh("sb-1").await.is_none());
        assert!(!engine.is_connected("sb-1"));
    }
}
