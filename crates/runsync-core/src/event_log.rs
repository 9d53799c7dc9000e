//! Event log store
//!
//! Append-only, deduplicated, per-entity ordered collections of envelopes.
//! History pages and live pushes go through the same `merge`, so an
//! occurrence delivered by both paths is stored once, at the position of its
//! first arrival.
//!
//! Push frames may carry no server id. Such envelopes get a content-derived id
//! and are paired with the history row of the same occurrence by
//! [`Envelope::fingerprint`]: each derived entry absorbs at most one server-id
//! entry with the same content and vice versa.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::model::Envelope;
use crate::pattern::EventPatternSet;

/// Event log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLogConfig {
    /// Event types dropped before they enter any log
    #[serde(default = "default_denylist")]
    pub denylist: EventPatternSet,
}

fn default_denylist() -> EventPatternSet {
    EventPatternSet::parse(["*.heartbeat", "ping"]).unwrap_or_default()
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
        }
    }
}

impl EventLogConfig {
    pub fn with_denylist(mut self, denylist: EventPatternSet) -> Self {
        self.denylist = denylist;
        self
    }
}

/// Entries of one content fingerprint not yet paired across paths
#[derive(Debug, Default)]
struct Unpaired {
    server: usize,
    derived: usize,
}

/// Log of one entity
struct EntityLog {
    seen: HashSet<String>,
    unpaired: HashMap<String, Unpaired>,
    entries: Vec<Envelope>,
    watchers: usize,
    version: watch::Sender<u64>,
}

impl EntityLog {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            seen: HashSet::new(),
            unpaired: HashMap::new(),
            entries: Vec::new(),
            watchers: 0,
            version,
        }
    }

    /// Whether an envelope is an occurrence this log already holds
    fn holds(&self, envelope: &Envelope) -> bool {
        if self.seen.contains(&envelope.id) {
            return true;
        }
        let derived = envelope.has_derived_id();
        self.unpaired
            .get(&envelope.fingerprint())
            .is_some_and(|u| if derived { u.server > 0 } else { u.derived > 0 })
    }

    /// Record a new envelope, or pair it with its counterpart from the other
    /// path. Returns true when the envelope is new.
    fn accept(&mut self, envelope: &Envelope) -> bool {
        if !self.seen.insert(envelope.id.clone()) {
            return false;
        }
        let derived = envelope.has_derived_id();
        let unpaired = self.unpaired.entry(envelope.fingerprint()).or_default();
        let counterpart = if derived {
            &mut unpaired.server
        } else {
            &mut unpaired.derived
        };
        if *counterpart > 0 {
            *counterpart -= 1;
            return false;
        }
        if derived {
            unpaired.derived += 1;
        } else {
            unpaired.server += 1;
        }
        true
    }
}

/// Per-entity event logs.
///
/// Each entity's log sits behind its own mutex; merges for the same entity are
/// serialized, merges for different entities do not contend.
pub struct EventLogStore {
    denylist: EventPatternSet,
    logs: RwLock<HashMap<String, Arc<Mutex<EntityLog>>>>,
}

impl EventLogStore {
    pub fn new(config: EventLogConfig) -> Self {
        Self {
            denylist: config.denylist,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a watcher; creates an empty log on first watch.
    pub(crate) fn open(&self, entity_id: &str) {
        let log = self.entry(entity_id);
        log.lock().watchers += 1;
    }

    /// Release a watcher; the log is discarded with its last watcher.
    ///
    /// Returns true when the log was discarded.
    pub(crate) fn discard(&self, entity_id: &str) -> bool {
        let mut logs = self.logs.write();
        let Some(log) = logs.get(entity_id).cloned() else {
            return false;
        };
        let mut guard = log.lock();
        guard.watchers = guard.watchers.saturating_sub(1);
        if guard.watchers == 0 {
            drop(guard);
            logs.remove(entity_id);
            trace!(entity_id = %entity_id, "Discarded event log");
            true
        } else {
            false
        }
    }

    /// Merge a batch and return how many envelopes were appended.
    ///
    /// Envelopes already seen, envelopes of denylisted types and envelopes
    /// addressed to another entity are dropped. New envelopes are appended in
    /// batch order.
    pub fn merge<I>(&self, entity_id: &str, envelopes: I) -> usize
    where
        I: IntoIterator<Item = Envelope>,
    {
        self.merge_then(entity_id, envelopes, |appended, _| appended)
    }

    /// Merge a batch, then run `then` on the resulting log while still holding
    /// the entity lock, so derived state is computed from exactly this merge.
    pub fn merge_then<I, R>(
        &self,
        entity_id: &str,
        envelopes: I,
        then: impl FnOnce(usize, &[Envelope]) -> R,
    ) -> R
    where
        I: IntoIterator<Item = Envelope>,
    {
        let log = self.entry(entity_id);
        let mut log = log.lock();

        let mut appended = 0;
        for envelope in envelopes {
            if envelope.entity_id != entity_id {
                warn!(
                    entity_id = %entity_id,
                    envelope_entity = %envelope.entity_id,
                    event_id = %envelope.id,
                    "Dropping envelope addressed to another entity"
                );
                continue;
            }
            if self.denylist.matches(&envelope.event_type) {
                trace!(entity_id = %entity_id, event_type = %envelope.event_type, "Filtered noise event");
                continue;
            }
            if !log.accept(&envelope) {
                continue;
            }
            log.entries.push(envelope);
            appended += 1;
        }

        if appended > 0 {
            log.version.send_modify(|v| *v += 1);
            trace!(entity_id = %entity_id, appended, total = log.entries.len(), "Merged events");
        }

        then(appended, &log.entries)
    }

    /// Owned copy of an entity's log, in arrival order
    pub fn snapshot(&self, entity_id: &str) -> Vec<Envelope> {
        self.with_entries(entity_id, |entries| entries.to_vec())
            .unwrap_or_default()
    }

    /// Run `f` against an entity's log under its lock
    pub fn with_entries<R>(&self, entity_id: &str, f: impl FnOnce(&[Envelope]) -> R) -> Option<R> {
        let log = self.logs.read().get(entity_id).cloned()?;
        let log = log.lock();
        Some(f(&log.entries))
    }

    /// Number of accepted envelopes
    pub fn len(&self, entity_id: &str) -> usize {
        self.with_entries(entity_id, |entries| entries.len())
            .unwrap_or(0)
    }

    /// Id of the last accepted envelope
    pub fn cursor(&self, entity_id: &str) -> Option<String> {
        self.with_entries(entity_id, |entries| entries.last().map(|e| e.id.clone()))
            .flatten()
    }

    /// Whether an entity currently has a log
    pub fn contains(&self, entity_id: &str) -> bool {
        self.logs.read().contains_key(entity_id)
    }

    /// Whether an envelope id was already accepted for an entity
    pub fn contains_event(&self, entity_id: &str, event_id: &str) -> bool {
        let Some(log) = self.logs.read().get(entity_id).cloned() else {
            return false;
        };
        let seen = log.lock().seen.contains(event_id);
        seen
    }

    /// Whether the occurrence an envelope describes is already in the log,
    /// by id or by pairing with an entry from the other delivery path
    pub fn holds(&self, entity_id: &str, envelope: &Envelope) -> bool {
        let Some(log) = self.logs.read().get(entity_id).cloned() else {
            return false;
        };
        let held = log.lock().holds(envelope);
        held
    }

    /// Whether an event type is dropped at merge time
    pub fn is_noise(&self, event_type: &str) -> bool {
        self.denylist.matches(event_type)
    }

    /// Receiver that changes whenever envelopes are appended
    pub fn subscribe(&self, entity_id: &str) -> Option<watch::Receiver<u64>> {
        let log = self.logs.read().get(entity_id).cloned()?;
        let receiver = log.lock().version.subscribe();
        Some(receiver)
    }

    fn entry(&self, entity_id: &str) -> Arc<Mutex<EntityLog>> {
        if let Some(log) = self.logs.read().get(entity_id) {
            return log.clone();
        }
        self.logs
            .write()
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(EntityLog::new())))
            .clone()
    }
}

impl Default for EventLogStore {
    fn default() -> Self {
        Self::new(EventLogConfig::default())
    }
}
