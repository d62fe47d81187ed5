//! In-memory task execution tracker
//!
//! Each task id moves `pending -> running -> {completed, failed}`. The table
//! lives behind a plain mutex that is never held across an await, so a
//! `cancel` can land while the backend call for the same task is in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::backend::{ExecutionBackend, TokenUsage};
use super::context::{system_prompt, ContextPackage, Mode};
use super::signals::{self, FileModification, Signal};
use crate::error::{AppError, Result};

pub const CANCELLED_BY_USER: &str = "Cancelled by user";
pub const DISPATCH_ABANDONED: &str = "dispatch abandoned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// How long finished tasks are kept, and how many entries the table may hold
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub ttl: Duration,
    pub max_tasks: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_tasks: 256,
        }
    }
}

#[derive(Debug)]
struct TaskEntry {
    status: TaskStatus,
    generation: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    output: Option<String>,
    error: Option<String>,
    token_usage: Option<TokenUsage>,
}

impl TaskEntry {
    fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished = Some(Instant::now());
    }
}

/// Point-in-time view returned by [`TaskTracker::status`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip)]
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Recorded result of a task; fields stay empty until the task is terminal
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

/// Outcome of a dispatch that ran to the end
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub files_modified: Vec<FileModification>,
    pub tokens_used: u64,
    pub signal: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

pub struct TaskTracker {
    backend: Arc<dyn ExecutionBackend>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    retention: RetentionPolicy,
    working_directory: String,
    next_generation: AtomicU64,
}

impl TaskTracker {
    pub fn new(backend: Arc<dyn ExecutionBackend>, working_directory: impl Into<String>) -> Self {
        Self::with_retention(backend, working_directory, RetentionPolicy::default())
    }

    pub fn with_retention(
        backend: Arc<dyn ExecutionBackend>,
        working_directory: impl Into<String>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            backend,
            tasks: Mutex::new(HashMap::new()),
            retention,
            working_directory: working_directory.into(),
            next_generation: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one task to completion against the backend.
    ///
    /// Rejects a second dispatch while the id is pending or running. Dropping
    /// the returned future before it resolves fails the task.
    pub async fn dispatch(
        &self,
        task_id: &str,
        package: &ContextPackage,
        mode: Mode,
    ) -> Result<DispatchResult> {
        package.validate(task_id)?;

        let generation = self.register(task_id)?;
        let mut guard = AbandonGuard {
            tracker: self,
            task_id,
            generation,
            armed: true,
        };

        let working_directory = package
            .working_directory
            .as_deref()
            .unwrap_or(&self.working_directory);
        let system = system_prompt(working_directory);
        let task = package.build_task_prompt();

        self.update(task_id, generation, |entry| {
            entry.status = TaskStatus::Running;
        });
        tracing::info!(task_id, ?mode, "dispatching task");

        let result = self.backend.execute(&system, &task, mode).await;
        guard.armed = false;

        match result {
            Ok(response) => {
                let interpretation = signals::interpret(&response.text);
                let (status, error) = match &interpretation.signal {
                    Signal::Complete => (TaskStatus::Completed, None),
                    Signal::Blocked(reason) => (TaskStatus::Failed, Some(format!("blocked: {}", reason))),
                    Signal::None => (TaskStatus::Failed, Some("no completion signal".to_string())),
                };

                let recorded = self.update(task_id, generation, |entry| {
                    if entry.status != TaskStatus::Running {
                        return false;
                    }
                    entry.output = Some(response.text.clone());
                    entry.token_usage = Some(response.token_usage);
                    entry.finish(status, error.clone());
                    true
                });
                if recorded != Some(true) {
                    tracing::info!(task_id, "backend finished after task was cancelled");
                    return Err(AppError::Conflict(format!("Task {} was cancelled", task_id)));
                }

                tracing::info!(
                    task_id,
                    signal = interpretation.signal.label(),
                    tokens = response.token_usage.total,
                    "task finished"
                );

                let block_reason = match &interpretation.signal {
                    Signal::Blocked(reason) => Some(reason.clone()),
                    _ => None,
                };
                Ok(DispatchResult {
                    task_id: task_id.to_string(),
                    success: interpretation.signal.is_complete(),
                    output: response.text,
                    files_modified: interpretation.files,
                    tokens_used: response.token_usage.total,
                    signal: interpretation.signal.label(),
                    block_reason,
                })
            }
            Err(e) => {
                tracing::warn!(task_id, "backend call failed: {}", e);
                let message = e.to_string();
                self.update(task_id, generation, |entry| {
                    if entry.status == TaskStatus::Running {
                        entry.finish(TaskStatus::Failed, Some(message));
                    }
                });
                Err(e)
            }
        }
    }

    pub fn status(&self, task_id: &str) -> Option<TaskSnapshot> {
        let tasks = self.table();
        tasks.get(task_id).map(|entry| TaskSnapshot {
            task_id: task_id.to_string(),
            status: entry.status,
            start_time: entry.started_at,
            elapsed: entry.started.elapsed(),
            error: entry.error.clone(),
        })
    }

    pub fn output(&self, task_id: &str) -> Option<TaskOutput> {
        let tasks = self.table();
        tasks.get(task_id).map(|entry| {
            let done = entry.status.is_terminal();
            TaskOutput {
                task_id: task_id.to_string(),
                status: entry.status,
                output: entry.output.clone().filter(|_| done),
                error: entry.error.clone().filter(|_| done),
                token_usage: entry.token_usage.filter(|_| done),
            }
        })
    }

    /// Fail a running task. Returns false when the task is unknown or not running.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = self.table();
        match tasks.get_mut(task_id) {
            Some(entry) if entry.status == TaskStatus::Running => {
                entry.finish(TaskStatus::Failed, Some(CANCELLED_BY_USER.to_string()));
                tracing::info!(task_id, "task cancelled");
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, task_id: &str) -> Result<u64> {
        let mut tasks = self.table();
        self.prune(&mut tasks);

        if let Some(existing) = tasks.get(task_id) {
            if !existing.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "Task {} is already {}",
                    task_id,
                    existing.status.as_str()
                )));
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        tasks.insert(
            task_id.to_string(),
            TaskEntry {
                status: TaskStatus::Pending,
                generation,
                started_at: Utc::now(),
                started: Instant::now(),
                finished: None,
                output: None,
                error: None,
                token_usage: None,
            },
        );
        Ok(generation)
    }

    /// Apply `f` to the entry only if it still belongs to this dispatch
    fn update<T>(
        &self,
        task_id: &str,
        generation: u64,
        f: impl FnOnce(&mut TaskEntry) -> T,
    ) -> Option<T> {
        let mut tasks = self.table();
        tasks
            .get_mut(task_id)
            .filter(|entry| entry.generation == generation)
            .map(f)
    }

    /// Drop expired terminal tasks, then the oldest terminal tasks until a new entry fits
    fn prune(&self, tasks: &mut HashMap<String, TaskEntry>) {
        let ttl = self.retention.ttl;
        let before = tasks.len();
        tasks.retain(|_, entry| match entry.finished {
            Some(finished) => finished.elapsed() < ttl,
            None => true,
        });

        if tasks.len() >= self.retention.max_tasks {
            let mut finished: Vec<(Instant, String)> = tasks
                .iter()
                .filter_map(|(id, entry)| entry.finished.map(|at| (at, id.clone())))
                .collect();
            finished.sort();
            let excess = tasks.len() + 1 - self.retention.max_tasks.max(1);
            for (_, id) in finished.into_iter().take(excess) {
                tasks.remove(&id);
            }
        }

        let evicted = before - tasks.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = tasks.len(), "pruned finished tasks");
        }
    }
}

/// Fails the task if the dispatch future is dropped mid-flight
struct AbandonGuard<'a> {
    tracker: &'a TaskTracker,
    task_id: &'a str,
    generation: u64,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let applied = self.tracker.update(self.task_id, self.generation, |entry| {
            if entry.status.is_terminal() {
                false
            } else {
                entry.finish(TaskStatus::Failed, Some(DISPATCH_ABANDONED.to_string()));
                true
            }
        });
        if applied == Some(true) {
            tracing::warn!(task_id = self.task_id, "dispatch abandoned before backend returned");
        }
    }
}
