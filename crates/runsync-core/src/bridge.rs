// Cache invalidation bridge
//
// Push events are signals, pulls are truth. The bridge turns a relevant push
// event into "this entity's snapshot is stale" plus one debounced re-pull. It
// never copies push payloads into the cache.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::SnapshotCache;
use crate::debounce::{DebouncedAction, Debouncer};
use crate::model::Envelope;
use crate::pattern::EventPatternSet;
use crate::scheduler::SnapshotFetcher;

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Triggers within this window coalesce into one pull
    #[serde(with = "crate::config::duration_millis")]
    pub debounce_window: Duration,

    /// Event types that invalidate the snapshot
    pub watched_event_types: EventPatternSet,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(250),
            watched_event_types: EventPatternSet::any(),
        }
    }
}

impl BridgeConfig {
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn with_watched_event_types(mut self, patterns: EventPatternSet) -> Self {
        self.watched_event_types = patterns;
        self
    }
}

pub struct InvalidationBridge {
    watched: EventPatternSet,
    cache: Arc<SnapshotCache>,
    debouncer: Debouncer<String>,
}

impl InvalidationBridge {
    pub fn new(config: BridgeConfig, cache: Arc<SnapshotCache>, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        let action: DebouncedAction<String> = Arc::new(move |entity_id: String| -> BoxFuture<'static, ()> {
            let fetcher = fetcher.clone();
            Box::pin(async move {
                let observation = fetcher.fetch(&entity_id).await;
                debug!(entity_id = %entity_id, ?observation, "Invalidation re-pull finished");
            })
        });

        Self {
            watched: config.watched_event_types,
            cache,
            debouncer: Debouncer::new(config.debounce_window, action),
        }
    }

    /// Handle one push envelope.
    ///
    /// Returns true when the envelope invalidated a cached entity.
    pub fn on_push_event(&self, envelope: &Envelope) -> bool {
        if !self.watched.matches(&envelope.event_type) {
            return false;
        }
        if !self.cache.mark_stale(&envelope.entity_id) {
            return false;
        }

        let scheduled = self.debouncer.trigger(envelope.entity_id.clone());
        debug!(
            entity_id = %envelope.entity_id,
            event_type = %envelope.event_type,
            scheduled,
            "Snapshot invalidated by push event"
        );
        true
    }

    /// Drop pending re-pulls for an entity
    pub fn forget(&self, entity_id: &str) {
        self.debouncer.cancel(&entity_id.to_string());
    }

    /// Whether a re-pull is pending or running for an entity
    pub fn is_pending(&self, entity_id: &str) -> bool {
        self.debouncer.is_active(&entity_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntitySnapshot, Lifecycle};
    use crate::scheduler::PollObservation;
    use crate::status::Status;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingFetcher {
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SnapshotFetcher for RecordingFetcher {
        async fn fetch(&self, entity_id: &str) -> PollObservation {
            self.fetched.lock().push(entity_id.to_string());
            PollObservation::Status(Status::Running)
        }
    }

    fn setup(config: BridgeConfig) -> (Arc<SnapshotCache>, Arc<RecordingFetcher>, InvalidationBridge) {
        let cache = Arc::new(SnapshotCache::new());
        cache.register("sb-1", Lifecycle::AgentRun);
        cache.record_snapshot("sb-1", EntitySnapshot::new("sb-1", "running"));
        let fetcher = Arc::new(RecordingFetcher::default());
        let bridge = InvalidationBridge::new(config, cache.clone(), fetcher.clone());
        (cache, fetcher, bridge)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_on_watched_entity_pulls_once() {
        let (cache, fetcher, bridge) = setup(BridgeConfig::default());

        for (i, delay) in [0u64, 80, 80].into_iter().enumerate() {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let envelope = Envelope::new(format!("e{}", i), "sb-1", "agent.tool_use", json!({}));
            assert!(bridge.on_push_event(&envelope));
        }
        assert!(cache.is_stale("sb-1"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*fetcher.fetched.lock(), vec!["sb-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_entity_is_ignored() {
        let (cache, fetcher, bridge) = setup(BridgeConfig::default());

        let envelope = Envelope::new("x1", "sb-2", "agent.completed", json!({}));
        assert!(!bridge.on_push_event(&envelope));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(fetcher.fetched.lock().is_empty());
        assert!(!cache.is_stale("sb-1"));
        assert!(!cache.contains("sb-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_watched_types_invalidate() {
        let config = BridgeConfig::default()
            .with_watched_event_types(EventPatternSet::parse(["*.completed", "*.failed"]).unwrap());
        let (cache, fetcher, bridge) = setup(config);

        assert!(!bridge.on_push_event(&Envelope::new("e1", "sb-1", "agent.tool_use", json!({}))));
        assert!(!cache.is_stale("sb-1"));

        assert!(bridge.on_push_event(&Envelope::new("e2", "sb-1", "agent.completed", json!({}))));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fetcher.fetched.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_payload_never_written() {
        let (cache, _fetcher, bridge) = setup(BridgeConfig::default());

        bridge.on_push_event(&Envelope::new(
            "e1",
            "sb-1",
            "agent.completed",
            json!({ "status": "completed" }),
        ));

        assert_eq!(cache.snapshot("sb-1").unwrap().status, "running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_cancels_pending_pull() {
        let (_cache, fetcher, bridge) = setup(BridgeConfig::default());

        bridge.on_push_event(&Envelope::new("e1", "sb-1", "agent.tool_use", json!({})));
        assert!(bridge.is_pending("sb-1"));
        bridge.forget("sb-1");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(fetcher.fetched.lock().is_empty());
    }
}
