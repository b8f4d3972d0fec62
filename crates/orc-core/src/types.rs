//! Core data types shared between the daemon and the CLI client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A lexicographically sortable identifier (UUIDv7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Closed set of task types. Selects the pattern extractor variant and the
/// domain instruction block composed into a run's system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Research,
    Writing,
    DataAnalysis,
    DocumentProcessing,
    DocumentWriting,
    DocumentAnalysis,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Research => "research",
            Self::Writing => "writing",
            Self::DataAnalysis => "data_analysis",
            Self::DocumentProcessing => "document_processing",
            Self::DocumentWriting => "document_writing",
            Self::DocumentAnalysis => "document_analysis",
        }
    }
}

impl Default for TaskType {
    fn default() -> Self {
        Self::Code
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "research" => Ok(Self::Research),
            "writing" => Ok(Self::Writing),
            "data_analysis" => Ok(Self::DataAnalysis),
            "document_processing" => Ok(Self::DocumentProcessing),
            "document_writing" => Ok(Self::DocumentWriting),
            "document_analysis" => Ok(Self::DocumentAnalysis),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Run lifecycle state. Transitions are monotone; terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// The closed error taxonomy recorded on runs and surfaced in machine summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    CodexNotInstalled,
    CodexAuthRequired,
    WorkspacePathInvalid,
    PathTraversal,
    WorkspaceMissing,
    PermissionError,
    Timeout,
    ToolFailure,
    RuntimeError,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::CodexNotInstalled => "CODEX_NOT_INSTALLED",
            Self::CodexAuthRequired => "CODEX_AUTH_REQUIRED",
            Self::WorkspacePathInvalid => "WORKSPACE_PATH_INVALID",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::WorkspaceMissing => "WORKSPACE_MISSING",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ToolFailure => "TOOL_FAILURE",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// A single structured error recorded on a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub code: ErrorCode,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl RunError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// A long-lived bucket grouping runs and accumulating patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub task_type: Option<TaskType>,
    pub created_at: DateTime<Utc>,
}

/// Role of a persisted step, mirroring the planner's tool-use turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    User,
    Assistant,
    Tool,
}

impl StepRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Structured notes attached to a step (exit codes, command echoes, stderr excerpts).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepNotes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// One tool-use turn observed from the planner or CLI tool, appended in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Id,
    pub run_id: Id,
    pub sequence: u32,
    pub role: StepRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<StepNotes>,
    pub outcome_ok: bool,
    pub timestamp: DateTime<Utc>,
}

/// A persisted byte payload tied to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Id,
    pub run_id: Id,
    pub kind: String,
    pub path: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// A variable discovered by the pattern extractor's domain pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub type_tag: String,
    pub example: String,
    pub description: String,
}

/// A reusable workflow distilled from one successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub run_id: Id,
    pub project_id: String,
    pub name: String,
    pub summary: String,
    pub steps: Vec<String>,
    pub variables: Vec<Variable>,
    pub rendered_block: String,
}

/// The deterministic, machine-readable record of a terminal run's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSummary {
    pub goal: String,
    pub primary_artifact: Option<String>,
    pub secondary_artifacts: Vec<String>,
    pub execution_attempted: bool,
    pub execution_succeeded: bool,
    pub reason_for_failure: Option<ErrorCode>,
    pub notes: Option<String>,
}

/// One execution of an instruction against a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub project_id: String,
    pub name: String,
    pub task_type: TaskType,
    pub status: RunStatus,
    pub progress: u8,
    pub instructions: String,
    pub reference_run_id: Option<Id>,
    pub source_run_id: Option<Id>,
    pub system_instructions: Option<String>,
    pub had_errors: bool,
    pub errors: Vec<RunError>,
    pub machine_summary: Option<MachineSummary>,
    pub upstream_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(project_id: String, name: String, instructions: String, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            project_id,
            name,
            task_type,
            status: RunStatus::Queued,
            progress: 0,
            instructions,
            reference_run_id: None,
            source_run_id: None,
            system_instructions: None,
            had_errors: false,
            errors: Vec::new(),
            machine_summary: None,
            upstream_session_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_unique_and_sortable() {
        let a = Id::new();
        let b = Id::new();
        assert_ne!(a, b);
        assert!(a.0 <= b.0, "uuidv7 ids should sort close to creation order");
    }

    #[test]
    fn run_status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&RunStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }

    #[test]
    fn task_type_round_trips_through_str() {
        for t in [
            TaskType::Code,
            TaskType::Research,
            TaskType::Writing,
            TaskType::DataAnalysis,
            TaskType::DocumentProcessing,
            TaskType::DocumentWriting,
            TaskType::DocumentAnalysis,
        ] {
            let parsed: TaskType = t.as_str().parse().unwrap();
            assert_eq!(parsed.as_str(), t.as_str());
        }
    }

    #[test]
    fn new_run_starts_queued_with_zero_progress() {
        let run = Run::new("demo".into(), "n".into(), "do it".into(), TaskType::Code);
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.progress, 0);
        assert!(!run.had_errors);
    }
}
