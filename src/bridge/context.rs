//! Context packages handed to a worker, and the prompts built from them

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{AppError, Result};

/// How much the backend is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Analysis and recommendations only
    Advisory,
    #[default]
    Implementation,
}

impl Mode {
    pub fn instruction(&self) -> &'static str {
        match self {
            Mode::Advisory => "You are in ADVISORY mode. Analyze and provide recommendations only. Do NOT output file modifications.",
            Mode::Implementation => "You are in IMPLEMENTATION mode. Implement the task and output the complete file contents for any files you create or modify.",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub r#do: String,
    #[serde(default)]
    pub done_when: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRange {
    pub start_line: u32,
    pub end_line: u32,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFile {
    pub path: String,
    pub content: String,
    pub language: Option<String>,
    #[serde(default)]
    pub relevant_sections: Vec<LineRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub endpoint: String,
    pub method: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Design {
    pub architecture: Option<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub apis: Vec<ApiEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousAttempt {
    pub attempt: u32,
    pub feedback: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Everything a worker needs to carry out one task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPackage {
    #[serde(default)]
    pub task: TaskDefinition,
    #[serde(default)]
    pub files: BTreeMap<String, ContextFile>,
    pub design: Option<Design>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub previous_attempts: Vec<PreviousAttempt>,
    pub working_directory: Option<String>,
    pub commit_prefix: Option<String>,
}

impl ContextPackage {
    /// Report every missing required field at once
    pub fn validate(&self, task_id: &str) -> Result<()> {
        let mut errors = Vec::new();
        if task_id.trim().is_empty() {
            errors.push("Missing taskId");
        }
        if self.task.title.trim().is_empty() {
            errors.push("Missing task.title");
        }
        if self.task.r#do.trim().is_empty() {
            errors.push("Missing task.do");
        }
        if self.task.done_when.trim().is_empty() {
            errors.push("Missing task.doneWhen");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "Invalid context package: {}",
                errors.join(", ")
            )))
        }
    }

    pub fn build_task_prompt(&self) -> String {
        let mut sections = Vec::new();

        sections.push(format!(
            "## Task: {}\n\n**What to do**: {}\n\n**Done when**: {}",
            self.task.title, self.task.r#do, self.task.done_when
        ));

        if !self.task.acceptance.is_empty() {
            sections.push(format!(
                "### Acceptance Criteria\n{}",
                numbered(&self.task.acceptance)
            ));
        }

        if !self.files.is_empty() {
            sections.push(
                "### Context Files\n\nThese files are provided for reference. Follow the patterns shown here."
                    .to_string(),
            );
            for file in self.files.values() {
                let mut section = format!("#### {}", file.path);
                if !file.relevant_sections.is_empty() {
                    section.push_str("\n_Relevant sections:_");
                    for range in &file.relevant_sections {
                        let _ = write!(
                            section,
                            "\n- Lines {}-{}: {}",
                            range.start_line, range.end_line, range.description
                        );
                    }
                }
                let _ = write!(
                    section,
                    "\n```{}\n{}\n```",
                    file.language.as_deref().unwrap_or("text"),
                    file.content
                );
                sections.push(section);
            }
        }

        if let Some(design) = &self.design {
            let mut parts = vec!["### Design Context".to_string()];
            if let Some(architecture) = &design.architecture {
                parts.push(format!("**Architecture**: {}", architecture));
            }
            if !design.patterns.is_empty() {
                parts.push(format!(
                    "**Patterns to follow**:\n{}",
                    bulleted(&design.patterns)
                ));
            }
            if !design.apis.is_empty() {
                parts.push("**API endpoints**:".to_string());
                for api in &design.apis {
                    parts.push(format!(
                        "- {} {}: {}",
                        api.method, api.endpoint, api.description
                    ));
                }
            }
            sections.push(parts.join("\n\n"));
        }

        if !self.constraints.is_empty() {
            sections.push(format!(
                "### Constraints\n\nYou MUST follow these constraints:\n{}",
                bulleted(&self.constraints)
            ));
        }

        // Only the latest attempt is shown
        if let Some(last) = self.previous_attempts.last() {
            let mut section = format!(
                "### Previous Attempt Feedback\n\nThis is attempt #{}. Previous attempt had these issues:\n\n**Feedback**: {}",
                last.attempt + 1,
                last.feedback
            );
            if !last.issues.is_empty() {
                let _ = write!(
                    section,
                    "\n\n**Specific issues to fix**:\n{}",
                    bulleted(&last.issues)
                );
            }
            section.push_str("\n\nPlease address these issues in this attempt.");
            sections.push(section);
        }

        if let Some(prefix) = &self.commit_prefix {
            sections.push(format!(
                "### Commit Message\n\nUse this prefix for your commit: `{}`",
                prefix
            ));
        }

        sections.push(
            "---\n\nImplement this task now. Output the complete file contents for any files you create or modify using the FILE format. When done, output TASK_COMPLETE on its own line."
                .to_string(),
        );

        sections.join("\n\n")
    }
}

fn numbered(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

fn bulleted(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Standing instructions for a worker: output format and completion markers
pub fn system_prompt(working_directory: &str) -> String {
    format!(
        r#"You are a skilled software developer working as part of a team. You receive specific tasks from your manager and implement them precisely.

## Your Role
- You are a WORKER, not a decision maker
- Implement exactly what is specified in the task
- Follow the patterns and constraints provided
- Signal completion clearly when done

## Working Directory
{working_directory}

## Output Format
When implementing code, use this format for each file:

### FILE: {{relative/path/to/file.ext}}
```{{language}}
{{complete file contents}}
```

## Rules
1. NEVER deviate from the task specification
2. ALWAYS follow the patterns shown in the context files
3. ALWAYS include complete file contents, not snippets
4. NEVER use placeholder comments like "// rest of the code"
5. ALWAYS signal completion with: TASK_COMPLETE

## If Blocked
If you cannot complete the task, output:
TASK_BLOCKED: {{reason}}

Do NOT output TASK_COMPLETE if you are blocked."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn package() -> ContextPackage {
        serde_json::from_value(json!({
            "task": {
                "title": "Add login form",
                "do": "Create the form component",
                "doneWhen": "Form submits credentials",
                "acceptance": ["Has email field", "Has password field"]
            },
            "files": {
                "form": {
                    "path": "src/form.tsx",
                    "content": "export {}",
                    "language": "tsx",
                    "relevantSections": [{"startLine": 1, "endLine": 4, "description": "exports"}]
                }
            },
            "design": {"architecture": "SPA", "patterns": ["hooks"]},
            "constraints": ["No new dependencies"],
            "previousAttempts": [
                {"attempt": 1, "feedback": "Too broad", "issues": ["touched unrelated files"]}
            ],
            "commitPrefix": "feat(auth):"
        }))
        .unwrap()
    }

    #[test]
    fn test_validate_accepts_complete_package() {
        assert!(package().validate("1.1").is_ok());
    }

    #[test]
    fn test_validate_reports_every_missing_field() {
        let pkg: ContextPackage = serde_json::from_value(json!({"task": {"title": "x"}})).unwrap();
        let err = pkg.validate("").unwrap_err().to_string();
        assert!(err.contains("Missing taskId"));
        assert!(err.contains("Missing task.do"));
        assert!(err.contains("Missing task.doneWhen"));
        assert!(!err.contains("Missing task.title"));

        let empty: ContextPackage = serde_json::from_value(json!({})).unwrap();
        assert!(empty.validate("1").unwrap_err().to_string().contains("Missing task.title"));
    }

    #[test]
    fn test_task_prompt_sections() {
        let prompt = package().build_task_prompt();
        assert!(prompt.starts_with("## Task: Add login form"));
        assert!(prompt.contains("1. Has email field\n2. Has password field"));
        assert!(prompt.contains("#### src/form.tsx"));
        assert!(prompt.contains("- Lines 1-4: exports"));
        assert!(prompt.contains("```tsx\nexport {}\n```"));
        assert!(prompt.contains("**Architecture**: SPA"));
        assert!(prompt.contains("- No new dependencies"));
        assert!(prompt.contains("This is attempt #2."));
        assert!(prompt.contains("- touched unrelated files"));
        assert!(prompt.contains("`feat(auth):`"));
        assert!(prompt.ends_with("output TASK_COMPLETE on its own line."));
    }

    #[test]
    fn test_minimal_prompt_omits_optional_sections() {
        let pkg: ContextPackage = serde_json::from_value(json!({
            "task": {"title": "t", "do": "d", "doneWhen": "w"}
        }))
        .unwrap();
        let prompt = pkg.build_task_prompt();
        assert!(!prompt.contains("Acceptance Criteria"));
        assert!(!prompt.contains("Design Context"));
        assert!(!prompt.contains("Commit Message"));
    }

    #[test]
    fn test_system_prompt_mentions_markers() {
        let prompt = system_prompt("/work/repo");
        assert!(prompt.contains("/work/repo"));
        assert!(prompt.contains("### FILE: {relative/path/to/file.ext}"));
        assert!(prompt.contains("TASK_BLOCKED: {reason}"));
        assert!(prompt.contains("TASK_COMPLETE"));
    }

    #[test]
    fn test_mode_defaults_to_implementation() {
        assert_eq!(Mode::default(), Mode::Implementation);
        let mode: Mode = serde_json::from_value(json!("advisory")).unwrap();
        assert_eq!(mode, Mode::Advisory);
        assert!(Mode::Advisory.instruction().contains("ADVISORY"));
    }
}
