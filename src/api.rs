//! Read API for the dashboard plus the context-entry endpoints

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{
    ContextEntry, CreateContextEntryRequest, DelegationEvent, EntryType, SmartContext, Spec,
    SpecSummary, Stats, Worker, WorkerFilter, WorkerStatus,
};
use crate::AppState;

pub const DEFAULT_LOG_LIMIT: i64 = 100;
pub const MAX_LOG_LIMIT: i64 = 1000;

pub async fn list_specs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<SpecSummary>>> {
    Ok(Json(state.store.list_specs().await?))
}

pub async fn get_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Spec>> {
    Ok(Json(state.store.get_spec(&id).await?))
}

pub async fn spec_workers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Worker>>> {
    Ok(Json(state.store.workers_for_spec(&id).await?))
}

/// Mark a spec complete. Repeating the call keeps the first timestamp.
pub async fn complete_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Spec>> {
    let spec = state.store.complete_spec(&id).await?;
    tracing::info!(spec_id = %spec.spec_id, name = %spec.name, "spec completed");
    state.publisher.publish(
        "spec-complete",
        json!({
            "specId": spec.spec_id,
            "name": spec.name,
            "completedAt": spec.completed_at,
        }),
    );
    Ok(Json(spec))
}

/// Raw query string for `/api/workers`; status is parsed here so a bad value is a 400
#[derive(Debug, Default, Deserialize)]
pub struct WorkerQuery {
    pub status: Option<String>,
    pub executor: Option<String>,
    pub spec_id: Option<String>,
}

impl TryFrom<WorkerQuery> for WorkerFilter {
    type Error = AppError;

    fn try_from(query: WorkerQuery) -> Result<Self> {
        let status = query
            .status
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<WorkerStatus>())
            .transpose()
            .map_err(AppError::Validation)?;
        Ok(WorkerFilter {
            status,
            executor: query.executor.filter(|s| !s.is_empty()),
            spec_id: query.spec_id.filter(|s| !s.is_empty()),
        })
    }
}

pub async fn list_workers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkerQuery>,
) -> Result<Json<Vec<Worker>>> {
    let filter = WorkerFilter::try_from(query)?;
    Ok(Json(state.store.list_workers(&filter).await?))
}

pub async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Worker>> {
    Ok(Json(state.store.get_worker(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub spec_id: Option<String>,
}

impl LogQuery {
    fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, MAX_LOG_LIMIT)
    }
}

pub async fn delegation_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<DelegationEvent>>> {
    let events = state
        .store
        .list_events(query.spec_id.as_deref(), query.effective_limit())
        .await?;
    Ok(Json(events))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Stats>> {
    Ok(Json(state.store.aggregate_stats().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextQuery {
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
}

pub async fn list_context(
    State(state): State<Arc<AppState>>,
    Path(spec_id): Path<String>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<Vec<ContextEntry>>> {
    let spec = state.store.get_spec(&spec_id).await?;
    let entries = match query.entry_type.as_deref() {
        Some(t) => {
            let entry_type = t.parse::<EntryType>().map_err(AppError::Validation)?;
            state.store.context_by_type(&spec.spec_id, entry_type).await?
        }
        None => state.store.context_for_spec(&spec.spec_id).await?,
    };
    Ok(Json(entries))
}

pub async fn smart_context(
    State(state): State<Arc<AppState>>,
    Path(spec_id): Path<String>,
) -> Result<Json<SmartContext>> {
    let spec = state.store.get_spec(&spec_id).await?;
    Ok(Json(state.store.smart_context(&spec.spec_id).await?))
}

/// Decode a new context entry, reporting malformed bodies in the usual `{error}` shape
fn parse_context_request(raw: &[u8]) -> Result<CreateContextEntryRequest> {
    let req: CreateContextEntryRequest = serde_json::from_slice(raw)
        .map_err(|e| AppError::Validation(format!("Invalid context entry: {}", e)))?;
    if req.content.trim().is_empty() {
        return Err(AppError::Validation("content must not be empty".to_string()));
    }
    Ok(req)
}

pub async fn add_context(
    State(state): State<Arc<AppState>>,
    Path(spec_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<ContextEntry>)> {
    let req = parse_context_request(&body)?;
    let spec = state.store.get_spec(&spec_id).await?;
    let entry = state
        .store
        .add_context_entry(
            &spec.spec_id,
            req.entry_type,
            &req.content,
            req.worker_id.as_deref(),
            &req.tags,
        )
        .await?;

    state.publisher.publish(
        "context-added",
        json!({
            "specId": entry.spec_id,
            "entryId": entry.entry_id,
            "entryType": entry.entry_type,
        }),
    );
    Ok((StatusCode::CREATED, Json(entry)))
}
