//! Data models for specs, workers, the delegation log and context entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result value a worker reports when it finished its task.
pub const TASK_COMPLETE: &str = "TASK_COMPLETE";

/// Result stamped on workers closed by the recovery sweep.
pub const SESSION_TERMINATED: &str = "session terminated";

pub const EXECUTOR_CODEX: &str = "codex";
pub const EXECUTOR_TASK_AGENT: &str = "task-agent";

/// A unit of overall delegated work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub spec_id: String,
    pub name: String,
    pub goal: Option<String>,
    pub phase: Option<String>,
    pub executor: Option<String>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A spec together with its worker counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecSummary {
    #[serde(flatten)]
    pub spec: Spec,
    pub total_workers: i64,
    pub completed_workers: i64,
    pub failed_workers: i64,
    pub running_workers: i64,
}

/// One delegated execution attempt, owned by a spec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub worker_id: String,
    pub spec_id: String,
    pub session_id: Option<String>,
    pub task_id: String,
    pub task_title: Option<String>,
    pub executor: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
    pub commit_hash: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Lifecycle status of a worker. Only `running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerStatus::Running)
    }

    /// Terminal status for a reported result: only the completion sentinel counts as success.
    pub fn from_result(result: Option<&str>) -> Self {
        match result {
            Some(TASK_COMPLETE) => WorkerStatus::Completed,
            _ => WorkerStatus::Failed,
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkerStatus::Running),
            "completed" => Ok(WorkerStatus::Completed),
            "failed" => Ok(WorkerStatus::Failed),
            _ => Err(format!("Invalid worker status: {}", s)),
        }
    }
}

/// Fields recorded when a worker is first seen
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub worker_id: String,
    pub session_id: Option<String>,
    pub task_id: String,
    pub task_title: Option<String>,
    pub executor: String,
}

/// Fields stamped on a worker when it reaches a terminal status
#[derive(Debug, Clone, Default)]
pub struct WorkerResult {
    pub result: Option<String>,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
    pub commit_hash: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Outcome of registering a worker under a spec
#[derive(Debug, Clone)]
pub enum Registration {
    /// A new running worker was stored, along with its spec if it was new.
    Started(Worker),
    /// The worker id was already known. Nothing was written.
    Duplicate(Worker),
}

/// Outcome of a terminal transition attempt
#[derive(Debug, Clone)]
pub enum Transition {
    /// The worker moved from `running` to the requested status.
    Applied(Worker),
    /// The worker was already closed; the row was left untouched.
    AlreadyTerminal(Worker),
    /// No worker with that id exists.
    UnknownWorker,
}

/// Filters for listing workers
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerFilter {
    pub status: Option<WorkerStatus>,
    pub executor: Option<String>,
    pub spec_id: Option<String>,
}

/// Immutable audit record of a lifecycle occurrence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationEvent {
    pub id: i64,
    pub event: String,
    pub spec_id: Option<String>,
    pub worker_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate counters over specs and workers
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_specs: i64,
    pub completed_specs: i64,
    pub total_workers: i64,
    pub completed_workers: i64,
    pub failed_workers: i64,
    pub running_workers: i64,
    pub avg_duration_ms: Option<f64>,
    pub codex_workers: i64,
    pub task_agent_workers: i64,
}

/// Kind of a context entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Decision,
    Blocker,
    Learning,
    Handoff,
    Note,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Decision => "decision",
            EntryType::Blocker => "blocker",
            EntryType::Learning => "learning",
            EntryType::Handoff => "handoff",
            EntryType::Note => "note",
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(EntryType::Decision),
            "blocker" => Ok(EntryType::Blocker),
            "learning" => Ok(EntryType::Learning),
            "handoff" => Ok(EntryType::Handoff),
            "note" => Ok(EntryType::Note),
            _ => Err(format!("Invalid entry type: {}", s)),
        }
    }
}

/// A free-form note attached to a spec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub entry_id: String,
    pub spec_id: String,
    pub worker_id: Option<String>,
    pub entry_type: EntryType,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Context entries grouped by the kinds a worker needs before starting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartContext {
    pub decisions: Vec<ContextEntry>,
    pub blockers: Vec<ContextEntry>,
    pub learnings: Vec<ContextEntry>,
    pub handoffs: Vec<ContextEntry>,
}

/// Request to attach a context entry to a spec
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContextEntryRequest {
    pub entry_type: EntryType,
    pub content: String,
    pub worker_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
