//! Push messages received from the dashboard

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One live notification, as sent on `/ws`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Push {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: String,
}

impl Push {
    /// One-line rendering for the terminal
    pub fn summary(&self) -> String {
        let field = |name: &str| self.payload.get(name).and_then(Value::as_str);

        let detail = match self.kind.as_str() {
            "connected" => "observer connected".to_string(),
            "worker-start" => format!(
                "{} started task {} ({})",
                field("workerId").unwrap_or("?"),
                field("taskId").unwrap_or("?"),
                field("executor").unwrap_or("?")
            ),
            "worker-stop" => format!(
                "{} {}",
                field("workerId").unwrap_or("?"),
                field("status").unwrap_or("stopped")
            ),
            "session-stop" => {
                let swept = self
                    .payload
                    .get("sweptWorkers")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                format!("session ended, {} orphaned worker(s) failed", swept)
            }
            "spec-complete" => format!("spec {} complete", field("name").unwrap_or("?")),
            _ if self.payload.is_null() => String::new(),
            _ => self.payload.to_string(),
        };

        format!("[{}] {:<14} {}", self.timestamp, self.kind, detail)
            .trim_end()
            .to_string()
    }
}
