//! Broker event kinds carried from the orchestrator to live stream subscribers.
//!
//! These are distinct from the persisted `Step`/`Run` rows: an event is
//! ephemeral and exists only to drive `/runs/{id}/stream`. The discriminant
//! set matches Section 4.1 of the spec exactly.

use crate::types::{ErrorCode, RunStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub stage: String,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPayload {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub path: String,
    pub kind: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffPayload {
    pub branch: Option<String>,
    pub shortstat: String,
    pub files: Vec<DiffFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFileEntry {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspacePayload {
    pub source_run_id: Option<String>,
    pub source_found: bool,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<String>,
}

/// The discriminated events a subscriber of `/runs/{id}/stream` receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    Status { status: RunStatus },
    Progress(ProgressPayload),
    Step(StepPayload),
    Artifact(ArtifactPayload),
    Diff(DiffPayload),
    Workspace(WorkspacePayload),
    Error(ErrorPayload),
    CancellationRequested,
}

impl BrokerEvent {
    pub fn status(status: RunStatus) -> Self {
        Self::Status { status }
    }

    pub fn progress(stage: impl Into<String>, percent: u8) -> Self {
        Self::Progress(ProgressPayload {
            stage: stage.into(),
            percent,
            message: None,
            elapsed_ms: None,
        })
    }

    /// True once this event signals the end of a subscriber's stream: a
    /// terminal status. All other events keep the stream open.
    pub fn closes_stream(&self) -> bool {
        matches!(self, Self::Status { status } if status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_tags_as_snake_case_type() {
        let event = BrokerEvent::status(RunStatus::Running);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "RUNNING");
    }

    #[test]
    fn only_terminal_status_closes_stream() {
        assert!(!BrokerEvent::status(RunStatus::Running).closes_stream());
        assert!(BrokerEvent::status(RunStatus::Succeeded).closes_stream());
        assert!(BrokerEvent::status(RunStatus::Failed).closes_stream());
        assert!(BrokerEvent::status(RunStatus::Cancelled).closes_stream());
        assert!(!BrokerEvent::CancellationRequested.closes_stream());
    }

    #[test]
    fn progress_event_round_trips() {
        let event = BrokerEvent::progress("workspace_prep", 20);
        let json = serde_json::to_string(&event).unwrap();
        let back: BrokerEvent = serde_json::from_str(&json).unwrap();
        match back {
            BrokerEvent::Progress(p) => {
                assert_eq!(p.stage, "workspace_prep");
                assert_eq!(p.percent, 20);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
