//! Run Service / orchestrator (Section 4.6): the state machine. Composes
//! the broker, workspace manager, CLI tool, pattern extractor, and planner
//! client into one run lifecycle.

use crate::broker::Broker;
use crate::cli_tool::{CliTool, CliToolError, ExecContext, ProcessRegistry};
use crate::pattern;
use crate::planner::{PlannerClient, PlannerContext, PlannerMessage, PlannerRequest};
use crate::storage::Storage;
use crate::workspace::WorkspaceManager;
use orc_core::events::{ArtifactPayload, DiffPayload, ErrorPayload, WorkspacePayload};
use orc_core::{
    Artifact, BrokerEvent, ErrorCode, Id, MachineSummary, Run, RunError, RunStatus, TaskType,
};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

const BASE_PROMPT: &str = "You are operating inside a sandboxed project workspace. \
Use the exec tool to make concrete progress on the user's instruction, then stop.";

fn domain_instructions(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Code => "Prefer minimal, well-tested diffs. Run the project's own test suite when one exists.",
        TaskType::Research => "Cite sources inline. Prefer primary sources over summaries of summaries.",
        TaskType::Writing => "Match the requested tone and audience. Keep paragraphs short.",
        TaskType::DataAnalysis => "State assumptions about the dataset explicitly before drawing conclusions.",
        TaskType::DocumentProcessing => "Preserve the source document's structure unless asked to restructure it.",
        TaskType::DocumentWriting => "Produce a single primary document artifact plus any supporting files.",
        TaskType::DocumentAnalysis => "Quote the specific passages that support each conclusion.",
    }
}

/// Durable per-run cancellation flags, independent of the in-process
/// subprocess registry (Section 5's "cancel is idempotent and safe to call
/// from any state").
#[derive(Debug, Default)]
struct CancellationFlags {
    tokens: Mutex<HashMap<Id, CancellationToken>>,
}

impl CancellationFlags {
    fn token_for(&self, run_id: &Id) -> CancellationToken {
        self.tokens
            .lock()
            .expect("cancellation flags mutex poisoned")
            .entry(run_id.clone())
            .or_default()
            .clone()
    }

    fn cancel(&self, run_id: &Id) {
        if let Some(token) = self.tokens.lock().expect("cancellation flags mutex poisoned").get(run_id) {
            token.cancel();
        }
    }

    fn forget(&self, run_id: &Id) {
        self.tokens.lock().expect("cancellation flags mutex poisoned").remove(run_id);
    }
}

pub struct CreateRunInput {
    pub project_id: String,
    pub name: String,
    pub instructions: String,
    pub task_type: TaskType,
    pub reference_run_id: Option<Id>,
    pub from_run_id: Option<Id>,
}

pub struct RunService {
    storage: std::sync::Arc<Storage>,
    broker: std::sync::Arc<Broker>,
    workspace: std::sync::Arc<WorkspaceManager>,
    cli_tool: std::sync::Arc<CliTool>,
    registry: std::sync::Arc<ProcessRegistry>,
    planner: std::sync::Arc<PlannerClient>,
    cancellation: CancellationFlags,
    artifacts_root: std::path::PathBuf,
    profile: String,
    fake_codex: bool,
}

impl RunService {
    pub fn new(
        storage: std::sync::Arc<Storage>,
        broker: std::sync::Arc<Broker>,
        workspace: std::sync::Arc<WorkspaceManager>,
        cli_tool: std::sync::Arc<CliTool>,
        registry: std::sync::Arc<ProcessRegistry>,
        planner: std::sync::Arc<PlannerClient>,
        artifacts_root: std::path::PathBuf,
        fake_codex: bool,
    ) -> Self {
        Self {
            storage,
            broker,
            workspace,
            cli_tool,
            registry,
            planner,
            cancellation: CancellationFlags::default(),
            artifacts_root,
            profile: "default".to_string(),
            fake_codex,
        }
    }

    /// Validate and persist a new run, then return it. The caller is
    /// expected to hand the run id to `spawn_lifecycle` on a task of its
    /// choosing (Section 5: one task per run).
    pub async fn create_run(&self, input: CreateRunInput) -> Result<Run, RunServiceError> {
        if input.project_id.trim().is_empty() {
            return Err(RunServiceError::InvalidInput("project_id must not be empty".into()));
        }
        if input.instructions.is_empty() || input.instructions.chars().count() > 10_000 {
            return Err(RunServiceError::InvalidInput(
                "instructions must be 1..10000 characters".into(),
            ));
        }

        let mut run = Run::new(
            input.project_id,
            input.name,
            input.instructions,
            input.task_type,
        );
        run.reference_run_id = input.reference_run_id;
        run.source_run_id = input.from_run_id;
        self.storage.insert_run(&run).await?;
        Ok(run)
    }

    /// Request cancellation. Idempotent; a no-op on a run that is already
    /// terminal (Section 5).
    pub async fn cancel(&self, run_id: &Id) -> Result<bool, RunServiceError> {
        let run = self.storage.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        self.cancellation.cancel(run_id);
        self.registry.terminate(run_id).await;
        self.broker.publish(run_id, BrokerEvent::CancellationRequested);
        Ok(true)
    }

    /// Drive one run from `queued` through to a terminal status. Intended to
    /// be spawned onto its own task by the scheduler.
    pub async fn run_lifecycle(&self, run_id: Id) {
        let mut run = match self.storage.require_run(&run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run vanished before lifecycle start");
                return;
            }
        };
        let cancel = self.cancellation.token_for(&run_id);

        run.status = RunStatus::Running;
        run.started_at = Some(chrono::Utc::now());
        if let Err(e) = self.storage.update_run(&run).await {
            error!(run_id = %run_id, error = %e, "failed to persist running transition");
        }
        self.broker.publish(&run_id, BrokerEvent::status(RunStatus::Running));

        match self.drive(&mut run, &cancel).await {
            Ok(()) => {}
            Err(error) => {
                run.had_errors = true;
                run.errors.push(error);
            }
        }

        self.finalize(&mut run, &cancel).await;
        self.cancellation.forget(&run_id);
    }

    /// Persist `run.progress` and publish the staged checkpoint together, so
    /// a poller on `GET /runs/{id}` observes the same staged values
    /// (0/20/30/70/80/95/100) that the SSE stream sees.
    async fn advance_progress(&self, run: &mut Run, stage: &'static str, percent: u8) {
        run.progress = percent;
        if let Err(e) = self.storage.update_run(run).await {
            warn!(run_id = %run.id, error = %e, "failed to persist progress");
        }
        self.broker.publish(&run.id, BrokerEvent::progress(stage, percent));
    }

    /// Steps 1-4 of the lifecycle algorithm: everything that can fail the
    /// run outright. Finalization (steps 5-7) always runs regardless of the
    /// outcome here (Section 4.6's failure policy); the terminal status
    /// itself is decided by `finalize`, not here.
    async fn drive(&self, run: &mut Run, cancel: &CancellationToken) -> Result<(), RunError> {
        // Step 1: prepare (0 -> 20).
        self.advance_progress(run, "workspace_prep", 0).await;
        let outcome = self
            .workspace
            .prepare(&run.project_id, &run.id, run.source_run_id.as_ref())
            .map_err(|e| RunError::new(ErrorCode::WorkspacePathInvalid, e.to_string()))?;
        self.broker.publish(
            &run.id,
            BrokerEvent::Workspace(WorkspacePayload {
                source_run_id: run.source_run_id.as_ref().map(ToString::to_string),
                source_found: outcome.source_found,
                entries: outcome.copied_entries,
            }),
        );
        self.advance_progress(run, "workspace_ready", 20).await;

        if cancel.is_cancelled() {
            return Err(RunError::new(ErrorCode::Cancelled, "cancelled during workspace prep"));
        }

        // Step 2: compose instructions (20 -> 30).
        let pattern_block = match &run.reference_run_id {
            Some(reference_id) => self
                .storage
                .get_pattern(reference_id)
                .await
                .ok()
                .flatten()
                .map(|p| p.rendered_block)
                .unwrap_or_default(),
            None => String::new(),
        };
        let system_instructions = format!(
            "{pattern_block}\n\n{BASE_PROMPT}\n\n{}",
            domain_instructions(run.task_type)
        );
        run.system_instructions = Some(system_instructions.clone());
        self.advance_progress(run, "instructions_composed", 30).await;

        if cancel.is_cancelled() {
            return Err(RunError::new(ErrorCode::Cancelled, "cancelled before dispatch"));
        }

        // Step 3/4: dispatch (30 -> 70).
        let workspace_path = self
            .workspace
            .path(&run.project_id, &run.id)
            .map_err(|e| RunError::new(ErrorCode::WorkspacePathInvalid, e.to_string()))?;
        let ctx = ExecContext {
            workspace: workspace_path.clone(),
            run_id: run.id.clone(),
            task_type: run.task_type,
            prior_session_id: run.upstream_session_id.clone(),
            profile: self.profile.clone(),
            fake_mode: self.fake_codex,
        };
        let request = PlannerRequest {
            messages: vec![PlannerMessage { role: "user", content: run.instructions.clone() }],
            context: PlannerContext {
                workspace: workspace_path.display().to_string(),
                pattern_block,
                base_prompt: BASE_PROMPT.to_string(),
                task_type: run.task_type,
                profile: self.profile.clone(),
                prior_session_id: run.upstream_session_id.clone(),
                run_id: run.id.clone(),
            },
        };
        let outcome = self
            .planner
            .dispatch(&ctx, &run.instructions, request, &self.cli_tool, &self.registry, cancel)
            .await
            .map_err(classify_planner_error)?;

        // Data-model invariant (iv): a `succeeded` run has at least one
        // step. A dispatch that reports success but produced no steps
        // (e.g. a real planner response that didn't yet surface them) must
        // not be allowed to reach `succeeded`.
        if outcome.steps.is_empty() {
            return Err(RunError::new(ErrorCode::RuntimeError, "dispatch produced no steps"));
        }

        run.upstream_session_id = outcome.session_id.clone();
        let mut sequence = self.storage.next_sequence(&run.id).await.unwrap_or(0);
        for generated in &outcome.steps {
            let step = orc_core::Step {
                id: Id::new(),
                run_id: run.id.clone(),
                sequence,
                role: generated.role,
                content: generated.content.clone(),
                touched_files: generated.touched_files.clone(),
                notes: generated.notes.clone(),
                outcome_ok: generated.outcome_ok,
                timestamp: chrono::Utc::now(),
            };
            sequence += 1;
            if let Err(e) = self.storage.insert_step(&step).await {
                warn!(run_id = %run.id, error = %e, "failed to persist step");
            }
            self.broker.publish(
                &run.id,
                BrokerEvent::Step(orc_core::events::StepPayload {
                    role: generated.role.as_str().to_string(),
                    content: generated.content.clone(),
                    files: generated.touched_files.clone(),
                    notes: generated
                        .notes
                        .as_ref()
                        .and_then(|n| serde_json::to_value(n).ok()),
                }),
            );
        }
        if !outcome.raw_jsonl.is_empty() {
            self.persist_artifact(&run.id, "codex-jsonl", "jsonl", outcome.raw_jsonl.as_bytes())
                .await;
        }
        self.advance_progress(run, "executing_done", 70).await;

        // Step 5: diff (70 -> 80).
        if let Some(summary) = self.workspace.diff_summary(&workspace_path) {
            let bytes = serde_json::to_vec(&summary).unwrap_or_default();
            self.persist_artifact(&run.id, "diff-summary", "json", &bytes).await;
            self.broker.publish(
                &run.id,
                BrokerEvent::Diff(DiffPayload {
                    branch: summary.branch,
                    shortstat: summary.shortstat,
                    files: summary
                        .files
                        .into_iter()
                        .map(|f| orc_core::events::DiffFileEntry { path: f.path, status: f.status })
                        .collect(),
                }),
            );
        }
        self.advance_progress(run, "diff_done", 80).await;

        Ok(())
    }

    /// Steps 6-7: pattern extraction and machine-summary finalization. Runs
    /// regardless of whether `drive` succeeded, failed, or was cancelled.
    async fn finalize(&self, run: &mut Run, cancel: &CancellationToken) {
        // `drive` never mutates `run.status`; it only reports success/failure
        // via its `Result` (translated into `run.errors` by `run_lifecycle`).
        // The terminal status is decided unconditionally here, so a run that
        // fails or is cancelled before `drive` reaches its last line still
        // leaves `running` rather than being stuck there forever.
        if cancel.is_cancelled() {
            run.status = RunStatus::Cancelled;
            run.had_errors = true;
            if !run.errors.iter().any(|e| e.code == ErrorCode::Cancelled) {
                run.errors.push(RunError::new(ErrorCode::Cancelled, "run cancelled"));
            }
        } else if !run.errors.is_empty() {
            run.status = RunStatus::Failed;
        } else {
            run.status = RunStatus::Succeeded;
        }

        // Step 6: extract pattern (80 -> 95). Never extracted for cancelled runs.
        if run.status == RunStatus::Succeeded {
            match self.storage.list_steps(&run.id).await {
                Ok(steps) => {
                    if let Some(pat) = pattern::extract(
                        &run.id,
                        &run.project_id,
                        &run.instructions,
                        run.task_type,
                        &steps,
                    ) {
                        if let Err(e) = self.storage.upsert_pattern(&pat).await {
                            warn!(run_id = %run.id, error = %e, "failed to persist pattern");
                        }
                    }
                }
                Err(e) => warn!(run_id = %run.id, error = %e, "failed to load steps for extraction"),
            }
        }
        self.advance_progress(run, "pattern_extracted", 95).await;

        // Step 7: summarize and finalize (95 -> 100).
        let artifacts = self.storage.list_artifacts(&run.id).await.unwrap_or_default();
        let files = self
            .workspace
            .path(&run.project_id, &run.id)
            .ok()
            .and_then(|p| self.workspace.list_files(&p).ok())
            .unwrap_or_default();
        run.machine_summary = Some(synthesize_summary(run, &artifacts, &files));
        run.progress = 100;
        run.finished_at = Some(chrono::Utc::now());
        if let Err(e) = self.storage.update_run(run).await {
            error!(run_id = %run.id, error = %e, "failed to persist final run state");
        }
        for error in &run.errors {
            self.broker.publish(
                &run.id,
                BrokerEvent::Error(ErrorPayload {
                    code: error.code,
                    message: error.message.clone(),
                    recovery: None,
                }),
            );
        }
        self.broker.publish(&run.id, BrokerEvent::status(run.status));
        info!(run_id = %run.id, status = run.status.as_str(), "run finished");
    }

    async fn persist_artifact(&self, run_id: &Id, kind: &str, ext: &str, bytes: &[u8]) {
        let artifact_id = Id::new();
        let path = orc_core::paths::artifact_path(&self.artifacts_root, run_id, &artifact_id, ext);
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                warn!(run_id = %run_id, "failed to create artifact directory");
                return;
            }
        }
        if std::fs::write(&path, bytes).is_err() {
            warn!(run_id = %run_id, "failed to write artifact");
            return;
        }
        let artifact = Artifact {
            id: artifact_id,
            run_id: run_id.clone(),
            kind: kind.to_string(),
            path: path.display().to_string(),
            bytes: bytes.len() as u64,
            created_at: chrono::Utc::now(),
        };
        if self.storage.insert_artifact(&artifact).await.is_ok() {
            self.broker.publish(
                run_id,
                BrokerEvent::Artifact(ArtifactPayload {
                    path: artifact.path,
                    kind: artifact.kind,
                    bytes: artifact.bytes,
                }),
            );
        }
    }
}

fn classify_planner_error(err: crate::planner::PlannerError) -> RunError {
    match err {
        crate::planner::PlannerError::CliTool(CliToolError::NotInstalled) => {
            RunError::new(ErrorCode::CodexNotInstalled, "codex binary not found")
        }
        crate::planner::PlannerError::CliTool(CliToolError::AuthRequired) => {
            RunError::new(ErrorCode::CodexAuthRequired, "codex credential rejected")
        }
        crate::planner::PlannerError::CliTool(CliToolError::PermissionError) => {
            RunError::new(ErrorCode::PermissionError, "filesystem access denied in workspace")
        }
        crate::planner::PlannerError::CliTool(CliToolError::Timeout(secs)) => {
            RunError::new(ErrorCode::Timeout, format!("exceeded {secs}s wall-clock bound"))
        }
        crate::planner::PlannerError::CliTool(CliToolError::ToolFailure(code)) => {
            RunError::new(ErrorCode::ToolFailure, format!("codex exited {code}"))
        }
        crate::planner::PlannerError::CliTool(CliToolError::Cancelled) => {
            RunError::new(ErrorCode::Cancelled, "cancelled")
        }
        crate::planner::PlannerError::CliTool(CliToolError::Io(e)) => {
            RunError::new(ErrorCode::RuntimeError, e.to_string())
        }
        crate::planner::PlannerError::Request(e) => {
            RunError::new(ErrorCode::RuntimeError, e.to_string())
        }
    }
}

const TEXT_EXTENSION_ALLOWLIST: &[&str] = &["md", "txt", "csv", "json", "py", "rs", "ts", "js", "yaml", "yml"];

fn synthesize_summary(
    run: &Run,
    artifacts: &[Artifact],
    files: &[crate::workspace::FileEntry],
) -> MachineSummary {
    let execution_attempted = run.status != RunStatus::Queued;
    let execution_succeeded = run.status == RunStatus::Succeeded;
    let reason_for_failure = run.errors.first().map(|e| e.code);

    let mut candidates: Vec<&crate::workspace::FileEntry> = files
        .iter()
        .filter(|f| {
            TEXT_EXTENSION_ALLOWLIST
                .iter()
                .any(|ext| f.path.ends_with(&format!(".{ext}")))
        })
        .collect();
    candidates.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.path.cmp(&b.path)));
    let primary_artifact = candidates.first().map(|f| f.path.clone());
    let secondary_artifacts = candidates
        .iter()
        .skip(1)
        .map(|f| f.path.clone())
        .chain(artifacts.iter().map(|a| a.path.clone()))
        .collect();

    MachineSummary {
        goal: run.instructions.chars().take(500).collect(),
        primary_artifact,
        secondary_artifacts,
        execution_attempted,
        execution_succeeded,
        reason_for_failure,
        notes: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::cli_tool::{CliTool, CliToolConfig, ProcessRegistry};
    use crate::planner::PlannerClient;
    use crate::storage::Storage;
    use crate::workspace::WorkspaceManager;
    use std::sync::Arc;

    async fn service(dir: &std::path::Path) -> RunService {
        let storage = Arc::new(Storage::new(&dir.join("test.db")).await.unwrap());
        storage.migrate_embedded().await.unwrap();
        RunService::new(
            storage,
            Arc::new(Broker::new()),
            Arc::new(WorkspaceManager::new(dir.join("workspaces"))),
            Arc::new(CliTool::new(CliToolConfig::default())),
            Arc::new(ProcessRegistry::new()),
            Arc::new(PlannerClient::new("http://localhost:5055".into(), false)),
            dir.join("artifacts"),
            true,
        )
    }

    #[tokio::test]
    async fn create_run_rejects_empty_project_id() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let result = service
            .create_run(CreateRunInput {
                project_id: String::new(),
                name: "n".into(),
                instructions: "do it".into(),
                task_type: TaskType::Code,
                reference_run_id: None,
                from_run_id: None,
            })
            .await;
        assert!(matches!(result, Err(RunServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn create_run_rejects_oversized_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let result = service
            .create_run(CreateRunInput {
                project_id: "demo".into(),
                name: "n".into(),
                instructions: "x".repeat(10_001),
                task_type: TaskType::Code,
                reference_run_id: None,
                from_run_id: None,
            })
            .await;
        assert!(matches!(result, Err(RunServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_succeeded_in_fake_mode() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let run = service
            .create_run(CreateRunInput {
                project_id: "demo".into(),
                name: "n".into(),
                instructions: "do it".into(),
                task_type: TaskType::Code,
                reference_run_id: None,
                from_run_id: None,
            })
            .await
            .unwrap();

        service.run_lifecycle(run.id.clone()).await;

        let finished = service.storage.require_run(&run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.progress, 100);
        assert!(finished.machine_summary.is_some());
    }

    #[tokio::test]
    async fn cancellation_requested_before_dispatch_ends_in_cancelled_not_stuck_running() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let run = service
            .create_run(CreateRunInput {
                project_id: "demo".into(),
                name: "n".into(),
                instructions: "do it".into(),
                task_type: TaskType::Code,
                reference_run_id: None,
                from_run_id: None,
            })
            .await
            .unwrap();

        assert!(service.cancel(&run.id).await.unwrap());
        service.run_lifecycle(run.id.clone()).await;

        let finished = service.storage.require_run(&run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Cancelled);
        assert_eq!(finished.progress, 100);
        assert!(finished.had_errors);
        assert!(finished.machine_summary.is_some());
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_on_terminal_runs() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let run = service
            .create_run(CreateRunInput {
                project_id: "demo".into(),
                name: "n".into(),
                instructions: "do it".into(),
                task_type: TaskType::Code,
                reference_run_id: None,
                from_run_id: None,
            })
            .await
            .unwrap();
        service.run_lifecycle(run.id.clone()).await;
        let cancelled = service.cancel(&run.id).await.unwrap();
        assert!(!cancelled);
    }
}
