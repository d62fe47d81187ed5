//! Read API integration tests

use axum::{body::Body, Router};
use ralph_dashboard::{router, store, AppState};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

async fn setup_app() -> Router {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    store::migrate(&pool).await.expect("Failed to migrate");

    router(AppState::new(pool))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (hyper::StatusCode, Value) {
    let request = hyper::Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn get(app: &Router, uri: &str) -> (hyper::StatusCode, Value) {
    send(app, "GET", uri, None).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (hyper::StatusCode, Value) {
    send(app, "POST", uri, Some(body)).await
}

/// Two specs: auth with one completed and one running worker, billing with one failed
async fn seed(app: &Router) {
    for (worker, spec, executor) in [
        ("w-1", "auth", "codex"),
        ("w-2", "auth", "task-agent"),
        ("w-3", "billing", "codex"),
    ] {
        let (status, _) = post(
            app,
            "/hooks/worker-start",
            json!({"workerId": worker, "specName": spec, "taskId": "1", "executor": executor}),
        )
        .await;
        assert_eq!(status, hyper::StatusCode::OK);
    }
    post(
        app,
        "/hooks/worker-stop",
        json!({"workerId": "w-1", "result": "TASK_COMPLETE", "durationMs": 1000}),
    )
    .await;
    post(
        app,
        "/hooks/worker-stop",
        json!({"workerId": "w-3", "result": "error", "durationMs": 3000}),
    )
    .await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = setup_app().await;
    let (status, body) = get(&app, "/health").await;

    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_list_specs_with_counts() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, body) = get(&app, "/api/specs").await;
    assert_eq!(status, hyper::StatusCode::OK);
    let specs = body.as_array().unwrap();
    assert_eq!(specs.len(), 2);

    let auth = specs.iter().find(|s| s["name"] == "auth").unwrap();
    assert_eq!(auth["totalWorkers"], 2);
    assert_eq!(auth["completedWorkers"], 1);
    assert_eq!(auth["runningWorkers"], 1);
    assert_eq!(auth["failedWorkers"], 0);
}

#[tokio::test]
async fn test_get_spec_by_name_and_id() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, by_name) = get(&app, "/api/specs/auth").await;
    assert_eq!(status, hyper::StatusCode::OK);
    let id = by_name["specId"].as_str().unwrap().to_string();

    let (status, by_id) = get(&app, &format!("/api/specs/{}", id)).await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(by_id["name"], "auth");

    let (status, body) = get(&app, "/api/specs/missing").await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_spec_workers_oldest_first() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, body) = get(&app, "/api/specs/auth/workers").await;
    assert_eq!(status, hyper::StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["workerId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["w-1", "w-2"]);
}

#[tokio::test]
async fn test_complete_spec_is_idempotent() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, first) = post(&app, "/api/specs/auth/complete", json!({})).await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert!(first["completedAt"].is_string());

    let (_, second) = post(&app, "/api/specs/auth/complete", json!({})).await;
    assert_eq!(first["completedAt"], second["completedAt"]);

    let (status, _) = post(&app, "/api/specs/nope/complete", json!({})).await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_filter_workers() {
    let app = setup_app().await;
    seed(&app).await;

    let (_, running) = get(&app, "/api/workers?status=running").await;
    assert_eq!(running.as_array().unwrap().len(), 1);
    assert_eq!(running[0]["workerId"], "w-2");

    let (_, codex) = get(&app, "/api/workers?executor=codex").await;
    assert_eq!(codex.as_array().unwrap().len(), 2);

    let (_, all) = get(&app, "/api/workers").await;
    assert_eq!(all.as_array().unwrap().len(), 3);

    let (status, _) = get(&app, "/api/workers?status=sleeping").await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);

    let (status, worker) = get(&app, "/api/workers/w-3").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(worker["status"], "failed");

    let (status, _) = get(&app, "/api/workers/nope").await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delegation_log_newest_first() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, body) = get(&app, "/api/delegation-log").await;
    assert_eq!(status, hyper::StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 5);
    assert_eq!(events[0]["event"], "worker-stop");
    assert_eq!(events[0]["workerId"], "w-3");
    assert_eq!(events[4]["workerId"], "w-1");

    let (_, limited) = get(&app, "/api/delegation-log?limit=2").await;
    assert_eq!(limited.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_stats() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, stats) = get(&app, "/api/stats").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(stats["totalSpecs"], 2);
    assert_eq!(stats["totalWorkers"], 3);
    assert_eq!(stats["completedWorkers"], 1);
    assert_eq!(stats["failedWorkers"], 1);
    assert_eq!(stats["runningWorkers"], 1);
    assert_eq!(stats["codexWorkers"], 2);
    assert_eq!(stats["taskAgentWorkers"], 1);
    assert_eq!(stats["avgDurationMs"], 2000.0);
}

#[tokio::test]
async fn test_context_entries() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, entry) = post(
        &app,
        "/api/context/auth",
        json!({
            "entryType": "decision",
            "content": "Use JWT for sessions",
            "workerId": "w-1",
            "tags": ["security", "it's quoted"]
        }),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::CREATED);
    assert_eq!(entry["tags"][1], "it's quoted");

    post(
        &app,
        "/api/context/auth",
        json!({"entryType": "blocker", "content": "Waiting on API keys"}),
    )
    .await;

    let (_, all) = get(&app, "/api/context/auth").await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, blockers) = get(&app, "/api/context/auth?type=blocker").await;
    assert_eq!(blockers.as_array().unwrap().len(), 1);

    let (status, smart) = get(&app, "/api/context/auth/smart").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(smart["decisions"].as_array().unwrap().len(), 1);
    assert_eq!(smart["blockers"].as_array().unwrap().len(), 1);
    assert!(smart["learnings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_context_validation() {
    let app = setup_app().await;
    seed(&app).await;

    let (status, _) = post(
        &app,
        "/api/context/unknown-spec",
        json!({"entryType": "note", "content": "hi"}),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);

    let (status, _) = post(
        &app,
        "/api/context/auth",
        json!({"entryType": "note", "content": "   "}),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/api/context/auth?type=rumor").await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_context_body_uses_error_shape() {
    let app = setup_app().await;
    seed(&app).await;

    let request = hyper::Request::builder()
        .method("POST")
        .uri("/api/context/auth")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), hyper::StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].as_str().unwrap().contains("Invalid context entry"));

    let (status, body) = post(
        &app,
        "/api/context/auth",
        json!({"entryType": "rumor", "content": "hi"}),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}
