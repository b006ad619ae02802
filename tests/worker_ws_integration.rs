//! Integration tests for the worker and dashboard WebSocket endpoints.
//!
//! Each test starts a full orchestrator on a random port, connects via
//! tokio-tungstenite, and drives the real wire protocol.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use worker_orchestrator::config::OrchestratorConfig;
use worker_orchestrator::dispatcher::{TaskRequest, TaskStatus, TaskType};
use worker_orchestrator::federation::{BUILTIN_HUB_ID, CreateTokenRequest, TokenScope};
use worker_orchestrator::orchestrator::Orchestrator;
use worker_orchestrator::store::MemoryStore;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Start an orchestrator on a random port, return (port, orchestrator).
async fn start_server(config: OrchestratorConfig) -> (u16, Arc<Orchestrator>) {
    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(MemoryStore::new())));
    orchestrator.start().await.expect("orchestrator start");

    let app = orchestrator.router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (port, orchestrator)
}

async fn connect(port: u16, path: &str) -> Socket {
    let url = format!("ws://127.0.0.1:{port}{path}");
    let (ws, _) = connect_async(&url).await.expect("WS connect failed");
    ws
}

async fn send_json(ws: &mut Socket, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("WS send failed");
}

/// Helper: parse a WS text message as JSON.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(text) => serde_json::from_str(text).expect("invalid JSON"),
        other => panic!("Expected text message, got {other:?}"),
    }
}

/// Read frames until one with the given `type` arrives.
async fn next_of_type(ws: &mut Socket, kind: &str) -> Value {
    loop {
        let msg = ws.next().await.expect("stream ended").expect("WS error");
        if !msg.is_text() {
            continue;
        }
        let json = parse_ws_json(&msg);
        if json["type"] == kind {
            return json;
        }
    }
}

/// Read event frames until one with the given event kind arrives.
async fn next_event(ws: &mut Socket, kind: &str) -> Value {
    loop {
        let frame = next_of_type(ws, "event").await;
        if frame["event"]["type"] == kind {
            return frame["event"].clone();
        }
    }
}

/// Connect a worker and complete the auth handshake.
async fn connect_worker(port: u16, auth: Value) -> (Socket, String) {
    let mut ws = connect(port, "/ws/worker").await;
    send_json(&mut ws, auth).await;
    let reply = next_of_type(&mut ws, "auth:success").await;
    let worker_id = reply["workerId"].as_str().expect("workerId").to_string();
    (ws, worker_id)
}

async fn wait_for_status(orchestrator: &Orchestrator, task_id: &str, status: TaskStatus) {
    loop {
        let task = orchestrator.dispatcher().get(task_id).await.unwrap().unwrap();
        if task.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn worker_handshake_reports_granted_capabilities() {
    timeout(TEST_TIMEOUT, async {
        let (port, orchestrator) = start_server(OrchestratorConfig::default()).await;

        let mut ws = connect(port, "/ws/worker").await;
        send_json(
            &mut ws,
            json!({"type": "auth", "capabilities": ["summarize", "embedding", "summarize"]}),
        )
        .await;

        let reply = next_of_type(&mut ws, "auth:success").await;
        assert_eq!(reply["capabilities"], json!(["embedding", "summarize"]));
        assert!(reply["workerId"].is_string());

        send_json(&mut ws, json!({"type": "ping"})).await;
        next_of_type(&mut ws, "pong").await;

        let workers = orchestrator.hub().snapshot().await;
        assert_eq!(workers.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn first_frame_must_be_auth() {
    timeout(TEST_TIMEOUT, async {
        let (port, orchestrator) = start_server(OrchestratorConfig::default()).await;

        let mut ws = connect(port, "/ws/worker").await;
        send_json(&mut ws, json!({"type": "ping"})).await;

        let reply = next_of_type(&mut ws, "auth:failed").await;
        assert_eq!(reply["reason"], "authentication required");
        assert!(orchestrator.hub().snapshot().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn anonymous_worker_rejected_when_disallowed() {
    timeout(TEST_TIMEOUT, async {
        let mut config = OrchestratorConfig::default();
        config.hub.allow_anonymous = false;
        let (port, _orchestrator) = start_server(config).await;

        let mut ws = connect(port, "/ws/worker").await;
        send_json(&mut ws, json!({"type": "auth", "capabilities": ["summarize"]})).await;
        let reply = next_of_type(&mut ws, "auth:failed").await;
        assert_eq!(reply["reason"], "credential required");

        let mut ws = connect(port, "/ws/worker").await;
        send_json(
            &mut ws,
            json!({"type": "auth", "token": "wkt_not_a_real_token", "capabilities": []}),
        )
        .await;
        next_of_type(&mut ws, "auth:failed").await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn task_flows_from_submit_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let (port, orchestrator) = start_server(OrchestratorConfig::default()).await;
        let (mut ws, worker_id) =
            connect_worker(port, json!({"type": "auth", "capabilities": ["summarize"]})).await;

        let task = orchestrator
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Summarize).with_payload(json!({"text": "hello"})))
            .await
            .unwrap();

        let assign = next_of_type(&mut ws, "task:assign").await;
        assert_eq!(assign["task"]["id"], task.id.as_str());
        assert_eq!(assign["task"]["payload"]["text"], "hello");
        assert_eq!(assign["task"]["assignedWorkerId"], worker_id.as_str());

        send_json(&mut ws, json!({"type": "task:started", "taskId": task.id})).await;
        wait_for_status(&orchestrator, &task.id, TaskStatus::Processing).await;

        send_json(
            &mut ws,
            json!({"type": "task:progress", "taskId": task.id, "progress": 0.5}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "task:complete", "taskId": task.id, "result": {"summary": "hi"}}),
        )
        .await;
        wait_for_status(&orchestrator, &task.id, TaskStatus::Completed).await;

        let done = orchestrator.dispatcher().get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.result, Some(json!({"summary": "hi"})));

        // The worker is idle again and picks up the next task.
        let next = orchestrator
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Summarize))
            .await
            .unwrap();
        let assign = next_of_type(&mut ws, "task:assign").await;
        assert_eq!(assign["task"]["id"], next.id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_error_requeues_then_fails() {
    timeout(TEST_TIMEOUT, async {
        let mut config = OrchestratorConfig::default();
        config.dispatcher.backoff.first = Duration::ZERO;
        config.dispatcher.backoff.max = Duration::ZERO;
        let (port, orchestrator) = start_server(config).await;
        let (mut ws, _) =
            connect_worker(port, json!({"type": "auth", "capabilities": ["summarize"]})).await;

        let task = orchestrator
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Summarize).with_max_retries(1))
            .await
            .unwrap();

        next_of_type(&mut ws, "task:assign").await;
        send_json(&mut ws, json!({"type": "task:error", "taskId": task.id, "error": "boom"})).await;

        // Requeued with zero backoff and handed straight back.
        let again = next_of_type(&mut ws, "task:assign").await;
        assert_eq!(again["task"]["id"], task.id.as_str());
        assert_eq!(again["task"]["retryCount"], 1);

        send_json(&mut ws, json!({"type": "task:error", "taskId": task.id, "error": "boom"})).await;
        wait_for_status(&orchestrator, &task.id, TaskStatus::Failed).await;

        let failed = orchestrator.dispatcher().get(&task.id).await.unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn project_token_limits_assignments() {
    timeout(TEST_TIMEOUT, async {
        let (port, orchestrator) = start_server(OrchestratorConfig::default()).await;

        let mut request = CreateTokenRequest::new("demo", TokenScope::Project);
        request.project_filter = Some("demo-*".into());
        let created = orchestrator.tokens().create_token(request).await.unwrap();

        let (mut ws, worker_id) = connect_worker(
            port,
            json!({"type": "auth", "token": created.token, "capabilities": ["summarize"]}),
        )
        .await;

        let other = orchestrator
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Summarize).with_project("other"))
            .await
            .unwrap();
        let demo = orchestrator
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Summarize).with_project("demo-site"))
            .await
            .unwrap();

        let assign = next_of_type(&mut ws, "task:assign").await;
        assert_eq!(assign["task"]["id"], demo.id.as_str());

        let other = orchestrator.dispatcher().get(&other.id).await.unwrap().unwrap();
        assert_eq!(other.status, TaskStatus::Pending);

        let registrations = orchestrator
            .tokens()
            .registrations_for_token(&created.id)
            .await
            .unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].worker_id, worker_id);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn revoking_token_disconnects_worker() {
    timeout(TEST_TIMEOUT, async {
        let (port, orchestrator) = start_server(OrchestratorConfig::default()).await;

        let mut request = CreateTokenRequest::new("ci", TokenScope::Group);
        request.hub_id = Some(BUILTIN_HUB_ID.to_string());
        let created = orchestrator.tokens().create_token(request).await.unwrap();
        let (mut ws, _) = connect_worker(
            port,
            json!({"type": "auth", "token": created.token, "capabilities": ["embedding"]}),
        )
        .await;
        assert_eq!(orchestrator.hub().snapshot().await.len(), 1);

        let (_, disconnected) = orchestrator.hub().revoke_token(&created.id).await.unwrap();
        assert_eq!(disconnected, 1);

        let shutdown = next_of_type(&mut ws, "shutdown").await;
        assert_eq!(shutdown["reason"], "token revoked");
        assert!(orchestrator.hub().snapshot().await.is_empty());

        // The revoked credential no longer authenticates.
        let mut ws = connect(port, "/ws/worker").await;
        send_json(&mut ws, json!({"type": "auth", "token": created.token})).await;
        next_of_type(&mut ws, "auth:failed").await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dashboard_receives_subscribed_channels_only() {
    timeout(TEST_TIMEOUT, async {
        let (port, orchestrator) = start_server(OrchestratorConfig::default()).await;

        let mut dash = connect(port, "/ws/events").await;
        send_json(&mut dash, json!({"type": "auth"})).await;
        next_of_type(&mut dash, "auth:success").await;

        send_json(&mut dash, json!({"type": "subscribe", "channels": ["task"]})).await;
        let subscribed = next_of_type(&mut dash, "subscribed").await;
        assert_eq!(subscribed["channels"], json!(["task"]));

        // Worker events are filtered out; the first event seen is the task one.
        let (_worker, _) =
            connect_worker(port, json!({"type": "auth", "capabilities": ["summarize"]})).await;
        let task = orchestrator
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Summarize))
            .await
            .unwrap();

        let frame = next_of_type(&mut dash, "event").await;
        assert_eq!(frame["event"]["type"], "task:queued");
        assert_eq!(frame["event"]["data"]["taskId"], task.id.as_str());

        let assigned = next_event(&mut dash, "task:assigned").await;
        assert_eq!(assigned["data"]["taskId"], task.id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dashboard_rejects_wrong_token() {
    timeout(TEST_TIMEOUT, async {
        let mut config = OrchestratorConfig::default();
        config.hub.dashboard_token = Some("s3cret".to_string().into());
        let (port, _orchestrator) = start_server(config).await;

        let mut dash = connect(port, "/ws/events").await;
        send_json(&mut dash, json!({"type": "auth", "token": "nope"})).await;
        next_of_type(&mut dash, "auth:failed").await;

        let mut dash = connect(port, "/ws/events").await;
        send_json(&mut dash, json!({"type": "auth", "token": "s3cret"})).await;
        next_of_type(&mut dash, "auth:success").await;
    })
    .await
    .expect("test timed out");
}
