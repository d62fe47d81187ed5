//! Event ingestion gateway
//!
//! Lifecycle events arrive as JSON on `POST /hooks/{event}`. Each handler
//! validates its payload before touching state, applies the transition,
//! appends exactly one audit record with the raw body, and only then
//! notifies observers. Unknown event names are recorded, never rejected.

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{
    NewWorker, Registration, Transition, WorkerResult, WorkerStatus, EXECUTOR_TASK_AGENT,
};
use crate::recovery;
use crate::AppState;

/// Tag under which events with an unrecognized name are logged
pub const UNKNOWN_EVENT: &str = "unknown";

/// A lifecycle event, decoded from its name and body
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    WorkerStart(WorkerStart),
    WorkerStop(WorkerStop),
    SessionStop,
    SubagentStart,
    SubagentStop,
    /// Any other event name, kept for forward compatibility
    Unknown(String),
}

impl HookEvent {
    /// Decode an event. Fails only when a known event carries a malformed payload.
    pub fn parse(name: &str, body: &Value) -> Result<Self> {
        let name = normalize_name(name);
        match name.as_str() {
            "worker-start" => {
                let payload: WorkerStart = decode(&name, body)?;
                payload.validate()?;
                Ok(HookEvent::WorkerStart(payload))
            }
            "worker-stop" => {
                let payload: WorkerStop = decode(&name, body)?;
                if payload.worker_id.trim().is_empty() {
                    return Err(AppError::Validation(
                        "worker-stop: workerId must not be empty".to_string(),
                    ));
                }
                Ok(HookEvent::WorkerStop(payload))
            }
            "session-stop" => Ok(HookEvent::SessionStop),
            "subagent-start" => Ok(HookEvent::SubagentStart),
            "subagent-stop" => Ok(HookEvent::SubagentStop),
            _ => Ok(HookEvent::Unknown(name)),
        }
    }

    /// Name recorded in the delegation log
    pub fn name(&self) -> &str {
        match self {
            HookEvent::WorkerStart(_) => "worker-start",
            HookEvent::WorkerStop(_) => "worker-stop",
            HookEvent::SessionStop => "session-stop",
            HookEvent::SubagentStart => "subagent-start",
            HookEvent::SubagentStop => "subagent-stop",
            HookEvent::Unknown(_) => UNKNOWN_EVENT,
        }
    }
}

/// Body of `worker-start`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStart {
    pub worker_id: String,
    pub spec_id: Option<String>,
    pub spec_name: Option<String>,
    #[serde(alias = "session_id")]
    pub session_id: Option<String>,
    pub task_id: String,
    pub task_title: Option<String>,
    pub executor: Option<String>,
}

impl WorkerStart {
    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.worker_id.trim().is_empty() {
            missing.push("workerId");
        }
        if self.task_id.trim().is_empty() {
            missing.push("taskId");
        }
        if self.spec_key().is_none() {
            missing.push("specName or specId");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "worker-start: missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Name the spec is looked up by: its name, falling back to its id
    pub fn spec_key(&self) -> Option<&str> {
        self.spec_name
            .as_deref()
            .or(self.spec_id.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

/// Body of `worker-stop`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStop {
    pub worker_id: String,
    pub result: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub commit_hash: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Acknowledgment returned for every accepted event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub ok: bool,
    pub event: String,
    /// Set when the event was logged but changed no state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swept: Option<usize>,
}

impl Ack {
    fn new(event: &str) -> Self {
        Self {
            ok: true,
            event: event.to_string(),
            outcome: None,
            swept: None,
        }
    }

    fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }
}

/// Turn a host-style `SubagentStop` or `worker_start` into `subagent-stop` / `worker-start`
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev: Option<char> = None;
    for c in raw.trim().chars() {
        if c.is_ascii_uppercase() {
            // Word boundary only at a lower-to-upper step, so WORKER_STOP stays two words
            if prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            out.push('-');
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, body: &Value) -> Result<T> {
    serde_json::from_value(body.clone())
        .map_err(|e| AppError::Validation(format!("{}: {}", name, e)))
}

/// `POST /hooks/{event}`
pub async fn handler(
    State(state): State<Arc<AppState>>,
    Path(event): Path<String>,
    body: Bytes,
) -> Result<Json<Ack>> {
    let body = parse_body(&body)?;
    let ack = ingest(&state, &event, body).await?;
    Ok(Json(ack))
}

fn parse_body(raw: &[u8]) -> Result<Value> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(raw).map_err(|e| AppError::Validation(format!("Invalid JSON body: {}", e)))
}

/// Apply one lifecycle event
pub async fn ingest(state: &AppState, name: &str, body: Value) -> Result<Ack> {
    let event = HookEvent::parse(name, &body)?;

    match event {
        HookEvent::WorkerStart(payload) => worker_start(state, payload, body).await,
        HookEvent::WorkerStop(payload) => worker_stop(state, payload, body).await,
        HookEvent::SessionStop => session_stop(state, body).await,
        HookEvent::SubagentStart => log_only(state, "subagent-start", body).await,
        HookEvent::SubagentStop => log_only(state, "subagent-stop", body).await,
        HookEvent::Unknown(original) => {
            tracing::info!(event = %original, "recording unrecognized hook event");
            let payload = json!({ "hookEvent": original, "body": body });
            state
                .store
                .append_event(UNKNOWN_EVENT, None, None, &payload)
                .await?;
            state.publisher.publish(UNKNOWN_EVENT, payload);
            Ok(Ack::new(UNKNOWN_EVENT))
        }
    }
}

/// Events that only leave an audit record
async fn log_only(state: &AppState, event: &str, body: Value) -> Result<Ack> {
    state.store.append_event(event, None, None, &body).await?;
    state.publisher.publish(event, body);
    Ok(Ack::new(event))
}

async fn worker_start(state: &AppState, payload: WorkerStart, body: Value) -> Result<Ack> {
    const EVENT: &str = "worker-start";

    let executor = payload
        .executor
        .clone()
        .unwrap_or_else(|| EXECUTOR_TASK_AGENT.to_string());

    let name = payload.spec_key().unwrap_or_default();
    let seed_id = payload.spec_id.as_deref().unwrap_or(name);
    let registered = state
        .store
        .register_worker(
            name,
            seed_id,
            NewWorker {
                worker_id: payload.worker_id.clone(),
                session_id: payload.session_id.clone(),
                task_id: payload.task_id.clone(),
                task_title: payload.task_title.clone(),
                executor,
            },
        )
        .await;

    match registered {
        Ok(Registration::Started(worker)) => {
            state
                .store
                .append_event(EVENT, Some(&worker.spec_id), Some(&worker.worker_id), &body)
                .await?;
            state.publisher.publish(
                EVENT,
                json!({
                    "workerId": worker.worker_id,
                    "specId": worker.spec_id,
                    "taskId": worker.task_id,
                    "taskTitle": worker.task_title,
                    "executor": worker.executor,
                    "status": worker.status,
                }),
            );
            Ok(Ack::new(EVENT))
        }
        Ok(Registration::Duplicate(existing)) => {
            tracing::warn!(
                worker_id = %existing.worker_id,
                spec_id = %existing.spec_id,
                "worker-start for a known worker ignored"
            );
            state
                .store
                .append_event(EVENT, Some(&existing.spec_id), Some(&existing.worker_id), &body)
                .await?;
            Ok(Ack::new(EVENT).with_outcome("duplicate_worker"))
        }
        Err(e) => {
            log_best_effort(state, EVENT, Some(&payload.worker_id), &body).await;
            Err(e)
        }
    }
}

async fn worker_stop(state: &AppState, payload: WorkerStop, body: Value) -> Result<Ack> {
    const EVENT: &str = "worker-stop";

    let status = WorkerStatus::from_result(payload.result.as_deref());
    let fields = WorkerResult {
        result: payload.result.clone(),
        summary: payload.summary.clone(),
        files_changed: payload.files_changed.clone(),
        commit_hash: payload.commit_hash.clone(),
        duration_ms: payload.duration_ms,
    };
    let worker_id = payload.worker_id.as_str();

    match state.store.transition_worker(worker_id, status, fields).await {
        Ok(Transition::Applied(worker)) => {
            state
                .store
                .append_event(EVENT, Some(&worker.spec_id), Some(worker_id), &body)
                .await?;
            state.publisher.publish(
                EVENT,
                json!({
                    "workerId": worker.worker_id,
                    "specId": worker.spec_id,
                    "status": worker.status,
                    "result": worker.result,
                    "durationMs": worker.duration_ms,
                }),
            );
            Ok(Ack::new(EVENT))
        }
        Ok(Transition::AlreadyTerminal(worker)) => {
            tracing::warn!(
                worker_id,
                status = worker.status.as_str(),
                "worker-stop for a closed worker ignored"
            );
            state
                .store
                .append_event(EVENT, Some(&worker.spec_id), Some(worker_id), &body)
                .await?;
            Ok(Ack::new(EVENT).with_outcome("already_terminal"))
        }
        Ok(Transition::UnknownWorker) => {
            tracing::warn!(worker_id, "worker-stop for an unknown worker");
            state
                .store
                .append_event(EVENT, None, Some(worker_id), &body)
                .await?;
            Ok(Ack::new(EVENT).with_outcome("unknown_worker"))
        }
        Err(e) => {
            log_best_effort(state, EVENT, Some(worker_id), &body).await;
            Err(e)
        }
    }
}

async fn session_stop(state: &AppState, body: Value) -> Result<Ack> {
    const EVENT: &str = "session-stop";

    let report = match recovery::sweep(&state.store).await {
        Ok(report) => report,
        Err(e) => {
            log_best_effort(state, EVENT, None, &body).await;
            return Err(e);
        }
    };

    state.store.append_event(EVENT, None, None, &body).await?;
    state.publisher.publish(
        EVENT,
        json!({ "sweptWorkers": report.worker_ids, "payload": body }),
    );

    let mut ack = Ack::new(EVENT);
    ack.swept = Some(report.count());
    Ok(ack)
}

/// Keep the audit trail even when the state change failed
async fn log_best_effort(state: &AppState, event: &str, worker_id: Option<&str>, body: &Value) {
    if let Err(e) = state.store.append_event(event, None, worker_id, body).await {
        tracing::error!(event, "failed to record event after error: {}", e);
    }
}
