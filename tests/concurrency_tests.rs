//! Concurrent ingestion against a file-backed database with several connections

use axum::{body::Body, Router};
use ralph_dashboard::models::{WorkerStatus, SESSION_TERMINATED, TASK_COMPLETE};
use ralph_dashboard::{router, store, AppState};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

async fn setup_app(dir: &TempDir) -> (Router, Arc<AppState>) {
    let url = format!("sqlite://{}", dir.path().join("ralph.db").display());
    let options = SqliteConnectOptions::from_str(&url)
        .expect("Invalid database url")
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .expect("Failed to open database");
    store::migrate(&pool).await.expect("Failed to migrate");

    let state = AppState::new(pool);
    (router(state.clone()), state)
}

async fn post(app: Router, uri: &str, body: Value) -> (hyper::StatusCode, Value) {
    let response = app
        .oneshot(
            hyper::Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_starts_share_one_spec() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = setup_app(&dir).await;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                post(
                    app,
                    "/hooks/worker-start",
                    json!({"workerId": format!("w-{}", i), "specName": "payments", "taskId": "1"}),
                )
                .await
            })
        })
        .collect();

    for handle in handles {
        let (status, ack) = handle.await.unwrap();
        assert_eq!(status, hyper::StatusCode::OK, "start failed: {}", ack);
    }

    let specs = state.store.list_specs().await.unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].total_workers, 20);
    assert_eq!(specs[0].running_workers, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_session_stop_closes_worker_once() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = setup_app(&dir).await;

    for round in 0..10 {
        let worker_id = format!("w-{}", round);
        let (status, _) = post(
            app.clone(),
            "/hooks/worker-start",
            json!({"workerId": worker_id, "specName": "auth", "taskId": "1"}),
        )
        .await;
        assert_eq!(status, hyper::StatusCode::OK);

        let stop = tokio::spawn(post(
            app.clone(),
            "/hooks/worker-stop",
            json!({"workerId": worker_id, "result": TASK_COMPLETE}),
        ));
        let sweep = tokio::spawn(post(app.clone(), "/hooks/session-stop", json!({})));

        let (stop_status, stop_ack) = stop.await.unwrap();
        let (sweep_status, sweep_ack) = sweep.await.unwrap();
        assert_eq!(stop_status, hyper::StatusCode::OK);
        assert_eq!(sweep_status, hyper::StatusCode::OK);

        let stop_applied = stop_ack.get("outcome").is_none();
        let swept = sweep_ack["swept"].as_u64().unwrap();
        assert!(swept <= 1);
        assert_ne!(
            stop_applied,
            swept == 1,
            "round {}: stop {} / sweep {}",
            round,
            stop_ack,
            sweep_ack
        );

        let worker = state.store.get_worker(&worker_id).await.unwrap();
        if stop_applied {
            assert_eq!(worker.status, WorkerStatus::Completed);
            assert_eq!(worker.result.as_deref(), Some(TASK_COMPLETE));
        } else {
            assert_eq!(stop_ack["outcome"], "already_terminal");
            assert_eq!(worker.status, WorkerStatus::Failed);
            assert_eq!(worker.result.as_deref(), Some(SESSION_TERMINATED));
        }
    }
}
