//! Line-delimited JSON tool calls over stdio
//!
//! One request per line: `{"id", "name", "arguments"}`. Every request gets
//! exactly one response line `{"id", "content": [{"type": "text", "text"}], "isError"}`.
//! Calls run concurrently, so `cancel_task` can overtake a running `execute_task`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::context::{ContextPackage, Mode};
use super::tracker::TaskTracker;
use crate::error::{AppError, Result};

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Value,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResponse {
    pub id: Value,
    pub content: Vec<TextContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolResponse {
    fn text(id: Value, body: &Value, is_error: bool) -> Self {
        Self {
            id,
            content: vec![TextContent {
                kind: "text".to_string(),
                text: body.to_string(),
            }],
            is_error,
        }
    }

    fn error(id: Value, message: &str) -> Self {
        Self::text(id, &json!({ "success": false, "error": message }), true)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteArgs {
    task_id: String,
    context_package: ContextPackage,
    #[serde(default)]
    mode: Mode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdArgs {
    task_id: String,
}

fn args<T: serde::de::DeserializeOwned>(tool: &str, arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| AppError::Validation(format!("Invalid arguments for {}: {}", tool, e)))
}

pub struct ToolDispatcher {
    tracker: Arc<TaskTracker>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(tracker: Arc<TaskTracker>, timeout: Duration) -> Self {
        Self { tracker, timeout }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Run one named tool and return its JSON result
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value> {
        match name {
            "execute_task" => {
                let ExecuteArgs {
                    task_id,
                    context_package,
                    mode,
                } = args(name, arguments)?;
                let dispatch = self.tracker.dispatch(&task_id, &context_package, mode);
                let result = tokio::time::timeout(self.timeout, dispatch)
                    .await
                    .map_err(|_| {
                        AppError::Backend(format!(
                            "Task {} timed out after {}s",
                            task_id,
                            self.timeout.as_secs()
                        ))
                    })??;
                serde_json::to_value(result).map_err(|e| AppError::Internal(e.to_string()))
            }
            "check_status" => {
                let TaskIdArgs { task_id } = args(name, arguments)?;
                Ok(match self.tracker.status(&task_id) {
                    Some(snapshot) => json!({
                        "taskId": snapshot.task_id,
                        "status": snapshot.status,
                        "startTime": snapshot.start_time,
                        "duration": snapshot.elapsed.as_secs(),
                        "error": snapshot.error,
                    }),
                    None => json!({ "taskId": task_id, "status": "not_found" }),
                })
            }
            "get_output" => {
                let TaskIdArgs { task_id } = args(name, arguments)?;
                Ok(match self.tracker.output(&task_id) {
                    Some(output) => json!({
                        "taskId": output.task_id,
                        "found": true,
                        "status": output.status,
                        "output": output.output,
                        "error": output.error,
                        "tokensUsed": output.token_usage.map(|usage| usage.total),
                    }),
                    None => json!({ "taskId": task_id, "found": false }),
                })
            }
            "cancel_task" => {
                let TaskIdArgs { task_id } = args(name, arguments)?;
                Ok(if self.tracker.cancel(&task_id) {
                    json!({ "success": true, "message": "Task cancelled" })
                } else {
                    json!({ "success": false, "message": "Task not found or not running" })
                })
            }
            "list_tools" => Ok(json!({ "tools": tool_definitions() })),
            other => Err(AppError::NotFound(format!("Unknown tool: {}", other))),
        }
    }

    /// Answer one call. Errors become `isError` responses, never a dropped request.
    pub async fn handle(&self, call: ToolCall) -> ToolResponse {
        tracing::debug!(tool = %call.name, "tool call");
        match self.call(&call.name, call.arguments).await {
            Ok(body) => ToolResponse::text(call.id, &body, false),
            Err(e) => {
                tracing::warn!(tool = %call.name, "tool call failed: {}", e);
                ToolResponse::error(call.id, &e.to_string())
            }
        }
    }
}

/// Tool calls still running. Finished calls are reaped before each new spawn.
#[derive(Default)]
struct InFlight {
    calls: JoinSet<()>,
}

impl InFlight {
    fn spawn<F>(&mut self, call: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.reap();
        self.calls.spawn(call);
    }

    fn reap(&mut self) {
        while let Some(finished) = self.calls.try_join_next() {
            log_join_error(finished);
        }
    }

    async fn drain(&mut self) {
        while let Some(finished) = self.calls.join_next().await {
            log_join_error(finished);
        }
    }

    fn len(&self) -> usize {
        self.calls.len()
    }
}

fn log_join_error(finished: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        tracing::error!("tool call task failed: {}", e);
    }
}

/// Serve tool calls until `reader` hits EOF, then wait for in-flight calls
pub async fn serve<R, W>(dispatcher: Arc<ToolDispatcher>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ToolResponse>();

    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode tool response: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                tracing::error!("Failed to write tool response: {}", e);
                break;
            }
            let _ = writer.flush().await;
        }
    });

    let mut calls = InFlight::default();
    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read request: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let call: ToolCall = match serde_json::from_str(&line) {
            Ok(call) => call,
            Err(e) => {
                let _ = tx.send(ToolResponse::error(
                    Value::Null,
                    &format!("Invalid request: {}", e),
                ));
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        calls.spawn(async move {
            let response = dispatcher.handle(call).await;
            let _ = tx.send(response);
        });
    }

    calls.drain().await;
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

/// Serve on the process's stdin and stdout
pub async fn serve_stdio(dispatcher: Arc<ToolDispatcher>) -> Result<()> {
    tracing::info!("worker bridge listening on stdio");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(dispatcher, stdin, tokio::io::stdout()).await
}

fn task_id_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "taskId": { "type": "string", "description": description }
        },
        "required": ["taskId"]
    })
}

pub fn tool_definitions() -> Value {
    json!([
        {
            "name": "execute_task",
            "description": "Execute a task on the worker backend and return the interpreted result.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "taskId": { "type": "string", "description": "Unique task id, e.g. '1.1'" },
                    "contextPackage": {
                        "type": "object",
                        "properties": {
                            "task": {
                                "type": "object",
                                "properties": {
                                    "title": { "type": "string" },
                                    "do": { "type": "string" },
                                    "doneWhen": { "type": "string" },
                                    "acceptance": { "type": "array", "items": { "type": "string" } }
                                },
                                "required": ["title", "do", "doneWhen"]
                            },
                            "files": { "type": "object" },
                            "design": { "type": "object" },
                            "constraints": { "type": "array", "items": { "type": "string" } },
                            "previousAttempts": { "type": "array" },
                            "workingDirectory": { "type": "string" },
                            "commitPrefix": { "type": "string" }
                        },
                        "required": ["task"]
                    },
                    "mode": {
                        "type": "string",
                        "enum": ["advisory", "implementation"],
                        "default": "implementation"
                    }
                },
                "required": ["taskId", "contextPackage"]
            }
        },
        {
            "name": "check_status",
            "description": "Check the status of a running or finished task",
            "inputSchema": task_id_schema("Task to check")
        },
        {
            "name": "get_output",
            "description": "Get the recorded output of a finished task",
            "inputSchema": task_id_schema("Task to read")
        },
        {
            "name": "cancel_task",
            "description": "Cancel a running task",
            "inputSchema": task_id_schema("Task to cancel")
        },
        {
            "name": "list_tools",
            "description": "List the available tools",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}
