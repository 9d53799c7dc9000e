// Integration tests for SyncEngine with in-memory transports
//
// These tests drive the whole push/pull pipeline (channel, event log, status
// derivation, polling, invalidation) against ScriptedSource and
// ChannelTransport with a paused clock, so every timing is deterministic.
//
// Run with: cargo test -p runsync-core --test engine_test

use std::sync::Arc;
use std::time::Duration;

use runsync_core::testing::{ChannelTransport, ScriptedSource};
use runsync_core::{
    ConnectionState, EntitySnapshot, Envelope, Lifecycle, PullError, Status, SyncConfig,
    SyncEngine, WatchOptions,
};
use serde_json::json;

struct Harness {
    source: Arc<ScriptedSource>,
    transport: Arc<ChannelTransport>,
    engine: SyncEngine,
}

fn harness() -> Harness {
    let source = Arc::new(ScriptedSource::new());
    let transport = Arc::new(ChannelTransport::new());
    let engine = SyncEngine::new(SyncConfig::default(), source.clone(), transport.clone())
        .expect("default config is valid");
    Harness {
        source,
        transport,
        engine,
    }
}

fn env(id: &str, entity_id: &str, event_type: &str) -> Envelope {
    Envelope::new(id, entity_id, event_type, json!({}))
}

fn ids(events: &[Envelope]) -> Vec<&str> {
    events.iter().map(|e| e.id.as_str()).collect()
}

/// Let spawned tasks run without reaching any poll interval
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_history_then_push_dedups() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("sb-1", "running"));
    h.source.set_history(
        "sb-1",
        vec![env("e1", "sb-1", "agent.started"), env("e2", "sb-1", "agent.tool_use")],
    );

    let watch = h.engine.watch("sb-1", WatchOptions::agent_run()).await;
    assert_eq!(ids(&watch.events()), vec!["e1", "e2"]);
    settle().await;
    assert!(watch.is_connected());

    h.transport.push(env("e2", "sb-1", "agent.tool_use"));
    h.transport.push(env("e3", "sb-1", "agent.tool_result"));
    settle().await;

    assert_eq!(ids(&watch.events()), vec!["e1", "e2", "e3"]);
    assert_eq!(watch.status(), Some(Status::Running));
}

#[tokio::test(start_paused = true)]
async fn test_session_polls_until_ready() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("pv-1", "creating"));
    h.source.queue_snapshot("pv-1", Ok(EntitySnapshot::new("pv-1", "creating")));
    h.source.queue_snapshot("pv-1", Ok(EntitySnapshot::new("pv-1", "ready")));

    let watch = h.engine.watch("pv-1", WatchOptions::session()).await;
    assert_eq!(watch.status(), Some(Status::Creating));
    assert_eq!(h.source.snapshot_calls("pv-1"), 1);

    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(h.source.snapshot_calls("pv-1"), 2);
    assert_eq!(watch.status(), Some(Status::Creating));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.source.snapshot_calls("pv-1"), 3);
    assert_eq!(watch.status(), Some(Status::Ready));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.source.snapshot_calls("pv-1"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_push_does_not_repull() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("pv-1", "ready"));

    let watch = h.engine.watch("pv-1", WatchOptions::session()).await;
    settle().await;

    h.transport.push_unfiltered(env("x1", "pv-2", "preview.progress"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.source.snapshot_calls("pv-1"), 1);
    assert_eq!(h.source.snapshot_calls("pv-2"), 0);
    assert!(watch.events().is_empty());
    assert!(!h.engine.is_stale("pv-1"));
}

#[tokio::test(start_paused = true)]
async fn test_push_burst_coalesces_into_one_repull() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("pv-1", "ready"));

    let watch = h.engine.watch("pv-1", WatchOptions::session()).await;
    settle().await;

    h.transport.push(env("p1", "pv-1", "preview.progress"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.transport.push(env("p2", "pv-1", "preview.progress"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.transport.push(env("p3", "pv-1", "preview.progress"));
    settle().await;
    assert!(h.engine.is_stale("pv-1"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.source.snapshot_calls("pv-1"), 2);
    assert!(!h.engine.is_stale("pv-1"));
    assert_eq!(watch.events().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_polling_stops_after_terminal_status() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("sb-1", "running"));
    h.source.queue_snapshot("sb-1", Ok(EntitySnapshot::new("sb-1", "completed")));

    let watch = h.engine.watch("sb-1", WatchOptions::agent_run()).await;
    assert_eq!(watch.status(), Some(Status::Running));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.source.snapshot_calls("sb-1"), 2);
    assert_eq!(watch.status(), Some(Status::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_terminal_push_is_pinned() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("sb-1", "running"));

    let watch = h.engine.watch("sb-1", WatchOptions::agent_run()).await;
    settle().await;

    // Server reports a different terminal state afterwards
    h.source.set_snapshot(EntitySnapshot::new("sb-1", "failed"));
    h.transport.push(env("done", "sb-1", "agent.completed"));
    settle().await;
    assert_eq!(watch.status(), Some(Status::Completed));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(watch.status(), Some(Status::Completed));
    let view = watch.view().unwrap();
    assert_eq!(view.snapshot.unwrap().status, "failed");
}

#[tokio::test(start_paused = true)]
async fn test_noise_events_are_ignored() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("pv-1", "ready"));

    let watch = h.engine.watch("pv-1", WatchOptions::session()).await;
    settle().await;

    h.transport.push(env("h1", "pv-1", "agent.heartbeat"));
    h.transport.push(env("h2", "pv-1", "ping"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(watch.events().is_empty());
    assert_eq!(h.source.snapshot_calls("pv-1"), 1);
    assert_eq!(watch.status(), Some(Status::Ready));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_catches_up_missed_events() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("pv-1", "ready"));
    h.source.set_history("pv-1", vec![env("e1", "pv-1", "preview.progress")]);

    let watch = h.engine.watch("pv-1", WatchOptions::session()).await;
    settle().await;
    assert!(watch.is_connected());

    // Missed while the channel is down
    h.transport.disconnect_all();
    h.source.append_history(env("e2", "pv-1", "preview.progress"));
    settle().await;
    assert_eq!(watch.view().unwrap().connection, ConnectionState::Errored);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(watch.is_connected());
    assert_eq!(ids(&watch.events()), vec!["e1", "e2"]);
    assert_eq!(h.transport.connect_count(), 2);
    assert_eq!(h.source.history_calls("pv-1"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_just_created_waits_for_entity() {
    let h = harness();

    let watch = h
        .engine
        .watch("sb-1", WatchOptions::agent_run().just_created())
        .await;
    let view = watch.view().unwrap();
    assert!(view.not_found);
    assert_eq!(view.status, Status::Pending);

    h.source.set_snapshot(EntitySnapshot::new("sb-1", "running"));
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let view = watch.view().unwrap();
    assert!(!view.not_found);
    assert_eq!(view.status, Status::Running);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_stops_quietly_unless_just_created() {
    let h = harness();

    let watch = h.engine.watch("sb-404", WatchOptions::agent_run()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.source.snapshot_calls("sb-404"), 1);
    assert!(watch.view().unwrap().not_found);
}

#[tokio::test(start_paused = true)]
async fn test_session_rearms_polling_when_busy_again() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("pv-1", "ready"));

    let watch = h.engine.watch("pv-1", WatchOptions::session()).await;
    settle().await;

    h.source.set_snapshot(EntitySnapshot::new("pv-1", "prompting"));
    h.transport.push(env("p1", "pv-1", "agent.started"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(watch.status(), Some(Status::Prompting));
    assert_eq!(h.source.snapshot_calls("pv-1"), 2);

    h.source.set_snapshot(EntitySnapshot::new("pv-1", "ready"));
    h.transport.push(env("p2", "pv-1", "PROTOTYPE_PROMPT_APPLIED"));
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(watch.status(), Some(Status::Ready));
    // Initial, two invalidations and one poll that observed ready
    assert_eq!(h.source.snapshot_calls("pv-1"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_drop_releases_everything() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("sb-1", "running"));

    let watch = h.engine.watch("sb-1", WatchOptions::agent_run()).await;
    settle().await;
    assert_eq!(h.transport.active_streams(), 1);

    drop(watch);
    settle().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.source.snapshot_calls("sb-1"), 1);
    assert_eq!(h.transport.active_streams(), 0);
    assert_eq!(h.transport.connect_count(), 1);
    assert!(h.engine.events("sb-1").is_empty());
    assert!(h.engine.status("sb-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_changes_notify_on_push() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("pv-1", "ready"));

    let watch = h.engine.watch("pv-1", WatchOptions::session()).await;
    settle().await;
    let mut changes = watch.changes().unwrap();
    changes.borrow_and_update();

    h.transport.push(env("p1", "pv-1", "preview.progress"));
    tokio::time::timeout(Duration::from_secs(1), changes.changed())
        .await
        .expect("no change notification")
        .unwrap();
    assert_eq!(watch.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_pull_keeps_last_snapshot() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("sb-1", "running"));

    let watch = h.engine.watch("sb-1", WatchOptions::agent_run()).await;
    h.source
        .set_error("sb-1", runsync_core::PullError::http("connection reset"));
    tokio::time::sleep(Duration::from_millis(3100)).await;

    let view = watch.view().unwrap();
    assert_eq!(view.snapshot.unwrap().status, "running");
    assert!(view.last_error.is_some());
    assert_eq!(view.status, Status::Running);
}

#[tokio::test(start_paused = true)]
async fn test_history_drives_runs_without_snapshot_route() {
    let h = harness();
    h.source
        .set_error("sb-1", PullError::Unsupported(Lifecycle::AgentRun));
    h.source.set_history("sb-1", vec![env("e1", "sb-1", "agent.started")]);

    let watch = h.engine.watch("sb-1", WatchOptions::agent_run()).await;
    assert_eq!(watch.status(), Some(Status::Running));
    let view = watch.view().unwrap();
    assert!(view.last_error.is_none());
    assert!(!view.not_found);

    // Push is down; the poll loop pulls history instead
    h.source.append_history(env("e2", "sb-1", "agent.completed"));
    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(watch.status(), Some(Status::Completed));
    assert_eq!(ids(&watch.events()), vec!["e1", "e2"]);

    let history_calls = h.source.history_calls("sb-1");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.source.history_calls("sb-1"), history_calls);
    assert!(!h.engine.is_stale("sb-1"));
}

#[tokio::test(start_paused = true)]
async fn test_pushed_copy_of_stored_event_is_not_duplicated() {
    let h = harness();
    h.source.set_snapshot(EntitySnapshot::new("sb-1", "running"));
    let payload = json!({"tool": "bash"});
    h.source.set_history(
        "sb-1",
        vec![Envelope::new("7f1c", "sb-1", "agent.tool_use", payload.clone())],
    );

    let watch = h.engine.watch("sb-1", WatchOptions::agent_run()).await;
    settle().await;

    // The live frame of the same occurrence carries no server id
    let derived = Envelope::derive_id("sb-1", "agent.tool_use", &payload);
    h.transport
        .push(Envelope::new(derived, "sb-1", "agent.tool_use", payload));
    settle().await;
    h.engine.refresh("sb-1").await;

    assert_eq!(ids(&watch.events()), vec!["7f1c"]);
}
