//! Snapshot cache
//!
//! Holds the last authoritative snapshot of every watched entity. Only pulls
//! write snapshots; the invalidation bridge may only mark an entry stale.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::PullError;
use crate::model::{EntitySnapshot, Lifecycle};

/// Cached state of one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub lifecycle: Lifecycle,

    /// Last good snapshot; `None` until the first successful pull or while
    /// the entity does not exist yet
    pub snapshot: Option<EntitySnapshot>,

    /// Time of the last successful pull (including not-found answers)
    pub fetched_at: Option<DateTime<Utc>>,

    /// Set when newer data is suspected; cleared by the next successful pull
    pub stale_since: Option<DateTime<Utc>>,

    /// Last pull reported not found
    pub not_found: bool,

    /// Error of the last pull, if it failed
    pub last_error: Option<PullError>,

    #[serde(skip)]
    watchers: usize,
}

impl CacheEntry {
    fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            snapshot: None,
            fetched_at: None,
            stale_since: None,
            not_found: false,
            last_error: None,
            watchers: 0,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }
}

/// Entity snapshots keyed by entity id.
///
/// Readable by any consumer; mutators are crate-private.
#[derive(Default)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of an entity's entry
    pub fn get(&self, entity_id: &str) -> Option<CacheEntry> {
        self.entries.read().get(entity_id).cloned()
    }

    /// Last good snapshot of an entity
    pub fn snapshot(&self, entity_id: &str) -> Option<EntitySnapshot> {
        self.entries
            .read()
            .get(entity_id)
            .and_then(|e| e.snapshot.clone())
    }

    /// Whether the entity is actively cached (watched)
    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.read().contains_key(entity_id)
    }

    pub fn is_stale(&self, entity_id: &str) -> bool {
        self.entries
            .read()
            .get(entity_id)
            .map(|e| e.is_stale())
            .unwrap_or(false)
    }

    pub fn lifecycle(&self, entity_id: &str) -> Option<Lifecycle> {
        self.entries.read().get(entity_id).map(|e| e.lifecycle)
    }

    /// Ids of all cached entities
    pub fn entity_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub(crate) fn register(&self, entity_id: &str, lifecycle: Lifecycle) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(entity_id.to_string())
            .or_insert_with(|| CacheEntry::new(lifecycle));
        entry.watchers += 1;
    }

    /// Returns true when the entry was removed with its last watcher
    pub(crate) fn unregister(&self, entity_id: &str) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(entity_id) else {
            return false;
        };
        entry.watchers = entry.watchers.saturating_sub(1);
        if entry.watchers == 0 {
            entries.remove(entity_id);
            true
        } else {
            false
        }
    }

    pub(crate) fn record_snapshot(&self, entity_id: &str, snapshot: EntitySnapshot) {
        if let Some(entry) = self.entries.write().get_mut(entity_id) {
            entry.snapshot = Some(snapshot);
            entry.fetched_at = Some(Utc::now());
            entry.stale_since = None;
            entry.not_found = false;
            entry.last_error = None;
        }
    }

    pub(crate) fn record_not_found(&self, entity_id: &str) {
        if let Some(entry) = self.entries.write().get_mut(entity_id) {
            entry.fetched_at = Some(Utc::now());
            entry.stale_since = None;
            entry.not_found = true;
            entry.last_error = None;
        }
    }

    /// A successful pull that had no snapshot to fetch (history only)
    pub(crate) fn record_events_only(&self, entity_id: &str) {
        if let Some(entry) = self.entries.write().get_mut(entity_id) {
            entry.fetched_at = Some(Utc::now());
            entry.stale_since = None;
            entry.not_found = false;
            entry.last_error = None;
        }
    }

    /// Keep the last good snapshot visible, remember the error
    pub(crate) fn record_failure(&self, entity_id: &str, error: PullError) {
        if let Some(entry) = self.entries.write().get_mut(entity_id) {
            entry.last_error = Some(error);
        }
    }

    /// Returns true if the entry exists
    pub(crate) fn mark_stale(&self, entity_id: &str) -> bool {
        match self.entries.write().get_mut(entity_id) {
            Some(entry) => {
                entry.stale_since.get_or_insert_with(Utc::now);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_keeps_last_good_snapshot() {
        let cache = SnapshotCache::new();
        cache.register("sb-1", Lifecycle::AgentRun);
        cache.record_snapshot("sb-1", EntitySnapshot::new("sb-1", "running"));

        cache.record_failure("sb-1", PullError::http("connection reset"));

        let entry = cache.get("sb-1").unwrap();
        assert_eq!(entry.snapshot.unwrap().status, "running");
        assert_eq!(entry.last_error, Some(PullError::http("connection reset")));
    }

    #[test]
    fn test_stale_until_next_successful_pull() {
        let cache = SnapshotCache::new();
        cache.register("sb-1", Lifecycle::AgentRun);

        assert!(cache.mark_stale("sb-1"));
        let first = cache.get("sb-1").unwrap().stale_since;
        assert!(cache.mark_stale("sb-1"));
        assert_eq!(cache.get("sb-1").unwrap().stale_since, first);

        cache.record_failure("sb-1", PullError::http("timeout"));
        assert!(cache.is_stale("sb-1"));

        cache.record_snapshot("sb-1", EntitySnapshot::new("sb-1", "running"));
        assert!(!cache.is_stale("sb-1"));
    }

    #[test]
    fn test_unwatched_entities_are_not_written() {
        let cache = SnapshotCache::new();

        assert!(!cache.mark_stale("sb-9"));
        cache.record_snapshot("sb-9", EntitySnapshot::new("sb-9", "running"));
        assert!(!cache.contains("sb-9"));
    }

    #[test]
    fn test_refcounted_registration() {
        let cache = SnapshotCache::new();
        cache.register("pv-1", Lifecycle::Session);
        cache.register("pv-1", Lifecycle::Session);

        assert!(!cache.unregister("pv-1"));
        assert!(cache.contains("pv-1"));
        assert!(cache.unregister("pv-1"));
        assert!(!cache.contains("pv-1"));
    }

    #[test]
    fn test_events_only_pull_clears_stale() {
        let cache = SnapshotCache::new();
        cache.register("sb-1", Lifecycle::AgentRun);
        cache.mark_stale("sb-1");
        cache.record_failure("sb-1", PullError::http("timeout"));

        cache.record_events_only("sb-1");

        let entry = cache.get("sb-1").unwrap();
        assert!(!entry.is_stale());
        assert!(entry.last_error.is_none());
        assert!(entry.snapshot.is_none());
        assert!(entry.fetched_at.is_some());
    }

    #[test]
    fn test_not_found_clears_error() {
        let cache = SnapshotCache::new();
        cache.register("sb-1", Lifecycle::AgentRun);
        cache.record_failure("sb-1", PullError::http("timeout"));

        cache.record_not_found("sb-1");

        let entry = cache.get("sb-1").unwrap();
        assert!(entry.not_found);
        assert!(entry.last_error.is_none());
        assert!(entry.snapshot.is_none());
    }
}
