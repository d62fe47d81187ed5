//! Recognizers for the markers an execution backend writes into its reply

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::TASK_COMPLETE;

pub const TASK_BLOCKED: &str = "TASK_BLOCKED";

/// `### FILE: path` header followed by one fenced block
static FILE_BLOCK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)### FILE: ([^\n]+)\n```(\w+)?\n(.*?)```").unwrap());

static BLOCKED_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"TASK_BLOCKED:\s*(.+)").unwrap());

/// Final signal of a backend reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "reason")]
pub enum Signal {
    #[serde(rename = "TASK_COMPLETE")]
    Complete,
    #[serde(rename = "TASK_BLOCKED")]
    Blocked(String),
    #[serde(rename = "NO_SIGNAL")]
    None,
}

impl Signal {
    pub fn is_complete(&self) -> bool {
        matches!(self, Signal::Complete)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Signal::Complete => TASK_COMPLETE,
            Signal::Blocked(_) => TASK_BLOCKED,
            Signal::None => "NO_SIGNAL",
        }
    }
}

/// A file the backend wrote out in full
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileModification {
    pub path: String,
    pub language: String,
    pub content: String,
}

/// Everything recognized in one reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    pub signal: Signal,
    pub files: Vec<FileModification>,
}

pub fn file_modifications(text: &str) -> Vec<FileModification> {
    FILE_BLOCK_PATTERN
        .captures_iter(text)
        .map(|caps| FileModification {
            path: caps[1].trim().to_string(),
            language: caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "text".to_string()),
            content: caps[3].to_string(),
        })
        .collect()
}

pub fn has_completion(text: &str) -> bool {
    text.contains(TASK_COMPLETE)
}

/// Reason given after the first block marker, if any
pub fn block_reason(text: &str) -> Option<String> {
    BLOCKED_PATTERN
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
}

/// Run all recognizers. A block wins over a completion marker in the same text.
pub fn interpret(text: &str) -> Interpretation {
    let signal = match block_reason(text) {
        Some(reason) => Signal::Blocked(reason),
        None if has_completion(text) => Signal::Complete,
        None => Signal::None,
    };
    Interpretation {
        signal,
        files: file_modifications(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_anywhere_in_text() {
        let text = "Done with the refactor.\nTASK_COMPLETE\n";
        assert_eq!(interpret(text).signal, Signal::Complete);
        assert_eq!(interpret("ok TASK_COMPLETE.").signal, Signal::Complete);
    }

    #[test]
    fn test_block_takes_precedence() {
        let text = "TASK_BLOCKED: missing credentials for staging\nTASK_COMPLETE";
        let result = interpret(text);
        assert_eq!(
            result.signal,
            Signal::Blocked("missing credentials for staging".to_string())
        );
        assert!(!result.signal.is_complete());
    }

    #[test]
    fn test_no_signal() {
        assert_eq!(interpret("I looked at it.").signal, Signal::None);
        assert_eq!(interpret("").signal, Signal::None);
    }

    #[test]
    fn test_file_blocks() {
        let text = "Here you go.\n\n### FILE: src/lib.rs \n```rust\npub fn a() {}\n```\n\n### FILE: README\n```\nhello\n```\nTASK_COMPLETE";
        let files = file_modifications(text);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "src/lib.rs");
        assert_eq!(files[0].language, "rust");
        assert_eq!(files[0].content, "pub fn a() {}\n");
        assert_eq!(files[1].path, "README");
        assert_eq!(files[1].language, "text");
        assert_eq!(files[1].content, "hello\n");
    }

    #[test]
    fn test_unterminated_file_block_is_ignored() {
        let text = "### FILE: a.txt\n```\nnever closed";
        assert!(file_modifications(text).is_empty());
    }

    #[test]
    fn test_signal_serialization() {
        let json = serde_json::to_value(Signal::Blocked("no access".to_string())).unwrap();
        assert_eq!(json["signal"], "TASK_BLOCKED");
        assert_eq!(json["reason"], "no access");
        assert_eq!(Signal::None.label(), "NO_SIGNAL");
    }
}
