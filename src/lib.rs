//! Ralph dashboard - delegation lifecycle tracker for CEO/worker agents

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod hooks;
pub mod models;
pub mod publisher;
pub mod recovery;
pub mod store;
pub mod websocket;

use axum::{
    routing::{get, post},
    Json, Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::publisher::Publisher;
use crate::store::Store;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub publisher: Publisher,
}

impl AppState {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Self::with_capacity(pool, publisher::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(pool: SqlitePool, broadcast_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            store: Store::new(pool),
            publisher: Publisher::new(broadcast_capacity),
        })
    }
}

/// Full HTTP surface: hook ingestion, read API and the observer socket
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket::handler))
        .route("/hooks/:event", post(hooks::handler))
        .route("/api/specs", get(api::list_specs))
        .route("/api/specs/:id", get(api::get_spec))
        .route("/api/specs/:id/workers", get(api::spec_workers))
        .route("/api/specs/:id/complete", post(api::complete_spec))
        .route("/api/workers", get(api::list_workers))
        .route("/api/workers/:id", get(api::get_worker))
        .route("/api/delegation-log", get(api::delegation_log))
        .route("/api/stats", get(api::stats))
        .route(
            "/api/context/:spec_id",
            get(api::list_context).post(api::add_context),
        )
        .route("/api/context/:spec_id/smart", get(api::smart_context))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
    }))
}
