//! WebSocket integration tests

use futures::StreamExt;
use ralph_dashboard::{router, store, AppState};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

async fn setup_server() -> SocketAddr {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    store::migrate(&pool).await.expect("Failed to migrate");

    let app = router(AppState::new(pool));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr) -> Socket {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect");
    ws
}

async fn next_push(ws: &mut Socket) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("Timed out waiting for push")
        .expect("Stream ended")
        .expect("WebSocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("Expected text message, got {:?}", other),
    }
}

async fn post_hook(addr: SocketAddr, event: &str, body: Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{}/hooks/{}", addr, event))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn test_connected_greeting() {
    let addr = setup_server().await;
    let mut ws = connect(addr).await;

    let greeting = next_push(&mut ws).await;
    assert_eq!(greeting["kind"], "connected");
    assert!(greeting["timestamp"].is_string());
}

#[tokio::test]
async fn test_lifecycle_pushes_reach_every_observer() {
    let addr = setup_server().await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    next_push(&mut first).await;
    next_push(&mut second).await;

    post_hook(
        addr,
        "worker-start",
        json!({"workerId": "w-1", "specName": "auth", "taskId": "1.1", "executor": "codex"}),
    )
    .await;

    for ws in [&mut first, &mut second] {
        let push = next_push(ws).await;
        assert_eq!(push["kind"], "worker-start");
        assert_eq!(push["payload"]["workerId"], "w-1");
        assert_eq!(push["payload"]["status"], "running");
    }

    post_hook(
        addr,
        "worker-stop",
        json!({"workerId": "w-1", "result": "TASK_COMPLETE"}),
    )
    .await;
    let push = next_push(&mut first).await;
    assert_eq!(push["kind"], "worker-stop");
    assert_eq!(push["payload"]["status"], "completed");
}

#[tokio::test]
async fn test_session_stop_push_lists_swept_workers() {
    let addr = setup_server().await;
    let mut ws = connect(addr).await;
    next_push(&mut ws).await;

    post_hook(
        addr,
        "worker-start",
        json!({"workerId": "w-9", "specName": "auth", "taskId": "2"}),
    )
    .await;
    next_push(&mut ws).await;

    post_hook(addr, "session-stop", json!({})).await;
    let push = next_push(&mut ws).await;
    assert_eq!(push["kind"], "session-stop");
    assert_eq!(push["payload"]["sweptWorkers"], json!(["w-9"]));
}

#[tokio::test]
async fn test_disconnected_observer_does_not_block_hooks() {
    let addr = setup_server().await;
    let mut gone = connect(addr).await;
    next_push(&mut gone).await;
    gone.close(None).await.unwrap();
    drop(gone);

    let mut alive = connect(addr).await;
    next_push(&mut alive).await;

    post_hook(addr, "subagent-start", json!({"agent": "reviewer"})).await;
    let push = next_push(&mut alive).await;
    assert_eq!(push["kind"], "subagent-start");
    assert_eq!(push["payload"]["agent"], "reviewer");
}
