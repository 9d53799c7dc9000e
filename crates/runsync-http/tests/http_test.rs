// Integration tests for the HTTP, WebSocket and SSE adapters
//
// Pulls run against wiremock; the WebSocket transport runs against a local
// tokio-tungstenite server.
//
// Run with: cargo test -p runsync-http --test http_test

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use runsync_core::{
    Envelope, Lifecycle, PullError, PushStream, PushTransport, SnapshotSource, Status,
    SubscriptionFilter, SyncConfig, TransportError, WatchOptions,
};
use runsync_http::{
    HttpConfig, HttpSnapshotSource, PushKind, SessionKind, SsePushTransport, WsPushTransport,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TASK_PATH: &str = "/api/v1/tasks/{id}";

fn history_row(id: &str, event_type: &str, created_at: &str) -> serde_json::Value {
    history_row_with(id, event_type, created_at, json!({}))
}

fn history_row_with(
    id: &str,
    event_type: &str,
    created_at: &str,
    event_data: serde_json::Value,
) -> serde_json::Value {
    json!({
        "id": id,
        "sandbox_id": "sb-1",
        "event_type": event_type,
        "event_data": event_data,
        "source": "agent",
        "created_at": created_at
    })
}

fn task_config(uri: &str) -> HttpConfig {
    HttpConfig::new(uri).unwrap().with_agent_run_path(TASK_PATH)
}

/// Serve the given frames to the first WebSocket client, then close
async fn serve_ws(frames: Vec<&'static str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for frame in frames {
            ws.send(Message::Text(frame.into())).await.unwrap();
        }
        let _ = ws.close(None).await;
    });
    format!("http://{}", addr)
}

async fn next(stream: &mut PushStream) -> Option<Result<Envelope, TransportError>> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_snapshot_pull() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/tasks/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t-1",
            "status": "running",
            "created_at": "2025-03-01T10:00:00.000000",
            "spec_id": "spec-1"
        })))
        .mount(&server)
        .await;

    let source = HttpSnapshotSource::new(task_config(&server.uri())).unwrap();
    let snapshot = source.fetch_snapshot("t-1", Lifecycle::AgentRun).await.unwrap();

    assert_eq!(snapshot.status, "running");
    assert_eq!(snapshot.fields["spec_id"], json!("spec-1"));
}

#[tokio::test]
async fn test_agent_run_without_route_is_unsupported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let source = HttpSnapshotSource::new(HttpConfig::new(&server.uri()).unwrap()).unwrap();

    assert_eq!(
        source.fetch_snapshot("sb-1", Lifecycle::AgentRun).await,
        Err(PullError::Unsupported(Lifecycle::AgentRun))
    );
}

#[tokio::test]
async fn test_prototype_session_route() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/prototype/session/ps-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ps-1",
            "sandbox_id": "sb-1",
            "status": "prompting"
        })))
        .mount(&server)
        .await;

    let config = HttpConfig::new(&server.uri())
        .unwrap()
        .with_session_kind(SessionKind::Prototype);
    let source = HttpSnapshotSource::new(config).unwrap();
    let snapshot = source.fetch_snapshot("ps-1", Lifecycle::Session).await.unwrap();

    assert_eq!(snapshot.id, "ps-1");
    assert_eq!(Status::parse(Lifecycle::Session, &snapshot.status), Some(Status::Prompting));
}

#[tokio::test]
async fn test_session_pull_uses_preview_route() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/preview/sandbox/sb-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pv-1",
            "sandbox_id": "sb-1",
            "status": "ready",
            "preview_url": "https://preview.example"
        })))
        .mount(&server)
        .await;

    let source = HttpSnapshotSource::new(HttpConfig::new(&server.uri()).unwrap()).unwrap();
    let snapshot = source.fetch_snapshot("sb-1", Lifecycle::Session).await.unwrap();

    assert_eq!(snapshot.id, "sb-1");
    assert_eq!(Status::parse(Lifecycle::Session, &snapshot.status), Some(Status::Ready));
}

#[tokio::test]
async fn test_not_found_and_api_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/tasks/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/tasks/broken"))
        .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
        .mount(&server)
        .await;

    let source = HttpSnapshotSource::new(task_config(&server.uri())).unwrap();

    assert_eq!(
        source.fetch_snapshot("missing", Lifecycle::AgentRun).await,
        Err(PullError::NotFound)
    );
    assert_eq!(
        source.fetch_snapshot("broken", Lifecycle::AgentRun).await,
        Err(PullError::Api {
            status: 503,
            message: "try later".to_string()
        })
    );
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/tasks/t-1"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
        .mount(&server)
        .await;

    let config = task_config(&server.uri()).with_api_token("secret");
    let source = HttpSnapshotSource::new(config).unwrap();

    assert!(source.fetch_snapshot("t-1", Lifecycle::AgentRun).await.is_ok());
}

#[tokio::test]
async fn test_history_pages_are_chronological() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1/events"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                history_row("e3", "agent.tool_result", "2025-03-01T10:00:03"),
                history_row("e2", "agent.tool_use", "2025-03-01T10:00:02"),
            ],
            "total_count": 3,
            "sandbox_id": "sb-1"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1/events"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [history_row("e1", "agent.started", "2025-03-01T10:00:01")],
            "total_count": 3,
            "sandbox_id": "sb-1"
        })))
        .mount(&server)
        .await;

    let source = HttpSnapshotSource::new(HttpConfig::new(&server.uri()).unwrap()).unwrap();

    let first = source.fetch_events("sb-1", None, 2).await.unwrap();
    let ids: Vec<_> = first.events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["e2", "e3"]);
    assert_eq!(first.next_cursor.as_deref(), Some("2"));

    let second = source
        .fetch_events("sb-1", first.next_cursor.as_deref(), 2)
        .await
        .unwrap();
    assert_eq!(second.events[0].id, "e1");
    assert!(second.next_cursor.is_none());
}

#[tokio::test]
async fn test_sse_stream_decodes_events() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"type\":\"ping\"}\n\n",
        "data: {\"id\":\"e1\",\"event_type\":\"agent.started\",\"entity_id\":\"sb-1\",\"payload\":{}}\n\n",
        ": keep-alive comment\n\n",
        "data: {\"event_type\":\"agent.tool_use\",\"payload\":{\"tool\":\"bash\"}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let config = HttpConfig::new(&server.uri()).unwrap().with_push(PushKind::Sse);
    let transport = SsePushTransport::new(config).unwrap();
    let stream = transport
        .connect(&SubscriptionFilter::entity("sb-1"))
        .await
        .unwrap();

    let items: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap();
    let envelopes: Vec<_> = items.into_iter().map(|item| item.unwrap()).collect();

    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].id, "e1");
    assert_eq!(envelopes[1].entity_id, "sb-1");
    assert_eq!(envelopes[1].event_type, "agent.tool_use");
}

#[tokio::test]
async fn test_sse_rejected_connect_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let transport = SsePushTransport::new(HttpConfig::new(&server.uri()).unwrap()).unwrap();
    let result = transport.connect(&SubscriptionFilter::entity("sb-1")).await;

    assert!(matches!(result, Err(TransportError::Connect(_))));
}

#[tokio::test]
async fn test_websocket_frames() {
    let url = serve_ws(vec![
        r#"{"type":"ping"}"#,
        r#"{"event_type":"agent.started","entity_type":"sandbox","entity_id":"sb-1","payload":{}}"#,
        "not json",
        r#"{"error":"Service not ready, please retry"}"#,
    ])
    .await;

    let transport = WsPushTransport::new(HttpConfig::new(&url).unwrap());
    let mut stream = transport
        .connect(&SubscriptionFilter::entity("sb-1"))
        .await
        .unwrap();

    let started = next(&mut stream).await.unwrap().unwrap();
    assert_eq!(started.event_type, "agent.started");
    assert!(started.id.starts_with("derived-"));

    assert!(matches!(next(&mut stream).await, Some(Err(TransportError::Decode(_)))));
    assert!(matches!(next(&mut stream).await, Some(Err(TransportError::Server(_)))));
    assert!(!matches!(next(&mut stream).await, Some(Ok(_))));
}

#[tokio::test]
async fn test_websocket_refused_is_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = WsPushTransport::new(HttpConfig::new(&format!("http://{}", addr)).unwrap());
    let result = transport.connect(&SubscriptionFilter::entity("sb-1")).await;

    assert!(matches!(result, Err(TransportError::Connect(_))));
}

#[tokio::test]
async fn test_engine_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/tasks/sb-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sb-1",
            "status": "completed"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                history_row("e2", "agent.completed", "2025-03-01T10:00:02"),
                history_row("e1", "agent.started", "2025-03-01T10:00:01"),
            ],
            "total_count": 2,
            "sandbox_id": "sb-1"
        })))
        .mount(&server)
        .await;
    let ws_url = serve_ws(vec![]).await;

    let http = task_config(&server.uri())
        .with_ws_url(&ws_url.replacen("http", "ws", 1))
        .unwrap();
    let engine = runsync_http::engine(http, SyncConfig::default()).unwrap();

    let watch = engine.watch("sb-1", WatchOptions::agent_run()).await;
    let view = watch.view().unwrap();

    let ids: Vec<_> = view.events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["e1", "e2"]);
    assert_eq!(view.status, Status::Completed);
}

#[tokio::test]
async fn test_relayed_push_merges_with_history_without_snapshot_route() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                history_row_with(
                    "7f1c",
                    "iteration.completed",
                    "2025-03-01T10:00:02",
                    json!({"iteration": 1})
                ),
                history_row("h1", "agent.started", "2025-03-01T10:00:01"),
            ],
            "total_count": 2,
            "sandbox_id": "sb-1"
        })))
        .mount(&server)
        .await;
    let ws_url = serve_ws(vec![
        r#"{"event_type":"SANDBOX_iteration.completed","entity_type":"sandbox","entity_id":"sb-1","payload":{"iteration":1,"source":"agent","original_event_type":"iteration.completed"}}"#,
        r#"{"event_type":"SANDBOX_agent.tool_use","entity_type":"sandbox","entity_id":"sb-1","payload":{"tool":"bash","source":"agent","original_event_type":"agent.tool_use"}}"#,
    ])
    .await;

    let http = HttpConfig::new(&server.uri())
        .unwrap()
        .with_ws_url(&ws_url.replacen("http", "ws", 1))
        .unwrap();
    let engine = runsync_http::engine(http, SyncConfig::default()).unwrap();
    let watch = engine.watch("sb-1", WatchOptions::agent_run()).await;

    let view = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = watch.view().unwrap();
            if view.events.len() >= 3 {
                break view;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    // Let any late duplicate land before asserting
    tokio::time::sleep(Duration::from_millis(100)).await;
    let view = watch.view().unwrap_or(view);

    let types: Vec<_> = view.events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.len(), 3, "{types:?}");
    assert!(types.iter().all(|t| !t.starts_with("SANDBOX_")));
    assert!(types.contains(&"agent.tool_use"));
    assert_eq!(view.status, Status::Running);
    assert!(view.snapshot.is_none());
}
