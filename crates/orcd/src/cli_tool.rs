//! The `exec` primitive (Section 4.3): the planner's only tool. Launches the
//! external code-generation CLI, streams its JSONL events into persisted
//! steps, registers the raw stream as an artifact, and honors cooperative
//! cancellation between lines.

use orc_core::{Id, StepNotes, StepRole, TaskType};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CliToolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codex CLI not found on PATH")]
    NotInstalled,
    #[error("codex CLI credential rejected after relogin")]
    AuthRequired,
    #[error("permission denied inside workspace")]
    PermissionError,
    #[error("wall-clock timeout after {0}s")]
    Timeout(u64),
    #[error("codex CLI exited {0} with no structured reason")]
    ToolFailure(i32),
    #[error("cancelled")]
    Cancelled,
}

/// Context the planner hands to every `exec` call.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub workspace: std::path::PathBuf,
    pub run_id: Id,
    pub task_type: TaskType,
    pub prior_session_id: Option<String>,
    pub profile: String,
    pub fake_mode: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratedStep {
    pub role: StepRole,
    pub content: String,
    pub touched_files: Vec<String>,
    pub notes: Option<StepNotes>,
    pub outcome_ok: bool,
}

/// What one `exec` invocation produced.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub steps: Vec<GeneratedStep>,
    pub raw_jsonl: String,
    pub exit_code: i32,
    pub touched_file_count: usize,
    pub summary: String,
    pub session_id: Option<String>,
}

/// One line of the CLI's JSONL stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexEvent {
    SessionMeta {
        session_id: String,
    },
    AssistantMessage {
        content: String,
        #[serde(default)]
        touched_files: Vec<String>,
    },
    ToolCall {
        command: String,
    },
    ToolResult {
        #[serde(default)]
        exit_code: i32,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        stdout_excerpt: String,
        #[serde(default)]
        stderr_excerpt: String,
    },
    AuthError {
        #[serde(default)]
        message: String,
    },
}

/// Process-wide registry of live CLI subprocesses, guarding cancellation
/// (Section 4.3 / 5).
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    children: Mutex<HashMap<Id, Child>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, run_id: Id, child: Child) {
        self.children.lock().expect("registry mutex poisoned").insert(run_id, child);
    }

    fn deregister(&self, run_id: &Id) -> Option<Child> {
        self.children.lock().expect("registry mutex poisoned").remove(run_id)
    }

    /// Ask the run's live subprocess, if any, to exit. Used by `cancel()`
    /// to reach a process whose task is not actively polling the
    /// cancellation token (e.g. between reads).
    pub async fn terminate(&self, run_id: &Id) {
        let mut children = self.children.lock().expect("registry mutex poisoned");
        if let Some(child) = children.get_mut(run_id) {
            let _ = child.start_kill();
        }
    }
}

/// Give the subprocess up to five seconds to exit on its own before a hard
/// kill (Section 4.3 step 4 / Section 5).
async fn terminate_gracefully(child: &mut Child) {
    let _ = child.start_kill();
    let _ = timeout(Duration::from_secs(5), child.wait()).await;
    let _ = child.kill().await;
}

#[derive(Debug, Clone)]
pub struct CliToolConfig {
    pub timeout_sec: u64,
}

impl Default for CliToolConfig {
    fn default() -> Self {
        Self { timeout_sec: 30 * 60 }
    }
}

pub struct CliTool {
    config: CliToolConfig,
}

impl CliTool {
    pub fn new(config: CliToolConfig) -> Self {
        Self { config }
    }

    /// Run the `exec` primitive: spawn the CLI (or synthesize a single step
    /// in fake mode), stream its JSONL output into generated steps, and
    /// return the captured transcript for artifact registration.
    pub async fn exec(
        &self,
        ctx: &ExecContext,
        prompt: &str,
        registry: &ProcessRegistry,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, CliToolError> {
        if ctx.fake_mode {
            return Ok(fake_outcome());
        }

        match self.exec_real(ctx, prompt, registry, cancel).await {
            Err(CliToolError::AuthRequired) => {
                info!(run_id = %ctx.run_id, "codex credential rejected, attempting one relogin");
                relogin().await?;
                self.exec_real(ctx, prompt, registry, cancel).await
            }
            other => other,
        }
    }

    async fn exec_real(
        &self,
        ctx: &ExecContext,
        prompt: &str,
        registry: &ProcessRegistry,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, CliToolError> {
        let mut command = Command::new("codex");
        command
            .arg("exec")
            .arg("--json")
            .arg("--full-auto")
            .arg("--profile")
            .arg(&ctx.profile)
            .arg(prompt)
            .current_dir(&ctx.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(session_id) = &ctx.prior_session_id {
            command.arg("--session").arg(session_id);
        }

        debug!(run_id = %ctx.run_id, profile = %ctx.profile, "spawning codex exec");
        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CliToolError::NotInstalled,
            std::io::ErrorKind::PermissionDenied => CliToolError::PermissionError,
            _ => CliToolError::Io(e),
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout).lines();
        let mut raw_jsonl = String::new();
        let mut steps = Vec::new();
        let mut touched_total: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut session_id = ctx.prior_session_id.clone();
        let mut auth_failed = false;

        registry.register(ctx.run_id.clone(), child);
        let deadline = Duration::from_secs(self.config.timeout_sec.max(1));
        let result = timeout(deadline, async {
            loop {
                if cancel.is_cancelled() {
                    return Err(CliToolError::Cancelled);
                }
                let line = tokio::select! {
                    line = reader.next_line() => line?,
                    () = cancel.cancelled() => return Err(CliToolError::Cancelled),
                };
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                raw_jsonl.push_str(&line);
                raw_jsonl.push('\n');

                let Ok(event) = serde_json::from_str::<CodexEvent>(&line) else {
                    continue;
                };
                match event {
                    CodexEvent::SessionMeta { session_id: id } => session_id = Some(id),
                    CodexEvent::AuthError { .. } => auth_failed = true,
                    CodexEvent::AssistantMessage { content, touched_files } => {
                        touched_total.extend(touched_files.iter().cloned());
                        steps.push(GeneratedStep {
                            role: StepRole::Assistant,
                            content: trim_step_content(&content),
                            touched_files,
                            notes: None,
                            outcome_ok: true,
                        });
                    }
                    CodexEvent::ToolCall { command } => {
                        steps.push(GeneratedStep {
                            role: StepRole::Tool,
                            content: trim_step_content(&command),
                            touched_files: Vec::new(),
                            notes: Some(StepNotes {
                                command: Some(command),
                                ..Default::default()
                            }),
                            outcome_ok: true,
                        });
                    }
                    CodexEvent::ToolResult { exit_code, ok, stdout_excerpt, stderr_excerpt } => {
                        steps.push(GeneratedStep {
                            role: StepRole::Tool,
                            content: trim_step_content(&stdout_excerpt),
                            touched_files: Vec::new(),
                            notes: Some(StepNotes {
                                exit_code: Some(exit_code),
                                stderr_excerpt: (!stderr_excerpt.is_empty()).then_some(stderr_excerpt),
                                ..Default::default()
                            }),
                            outcome_ok: ok,
                        });
                    }
                }
            }
            Ok(())
        })
        .await;

        let mut child = registry.deregister(&ctx.run_id);

        match result {
            Err(_) => return Err(CliToolError::Timeout(self.config.timeout_sec)),
            Ok(Err(CliToolError::Cancelled)) => {
                if let Some(child) = child.as_mut() {
                    terminate_gracefully(child).await;
                }
                return Err(CliToolError::Cancelled);
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        if auth_failed {
            return Err(CliToolError::AuthRequired);
        }

        let exit_code = match child.as_mut() {
            Some(child) => child.wait().await?.code().unwrap_or(-1),
            None => -1,
        };
        if exit_code != 0 && !auth_failed {
            return Err(CliToolError::ToolFailure(exit_code));
        }

        Ok(ExecOutcome {
            touched_file_count: touched_total.len(),
            summary: format!("codex exec exit={exit_code} files={}", touched_total.len()),
            exit_code,
            steps,
            raw_jsonl,
            session_id,
        })
    }
}

fn trim_step_content(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(160).collect()
}

fn fake_outcome() -> ExecOutcome {
    ExecOutcome {
        steps: vec![GeneratedStep {
            role: StepRole::Tool,
            content: "codex_exec(fake)".to_string(),
            touched_files: Vec::new(),
            notes: Some(StepNotes {
                tags: vec!["fake-codex-mode".to_string()],
                ..Default::default()
            }),
            outcome_ok: true,
        }],
        raw_jsonl: String::new(),
        exit_code: 0,
        touched_file_count: 0,
        summary: "codex exec exit=0 files=0 (fake mode)".to_string(),
        session_id: None,
    }
}

async fn relogin() -> Result<(), CliToolError> {
    let status = Command::new("codex")
        .arg("login")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CliToolError::NotInstalled,
            std::io::ErrorKind::PermissionDenied => CliToolError::PermissionError,
            _ => CliToolError::Io(e),
        })?;
    if status.success() {
        Ok(())
    } else {
        warn!("codex login did not succeed");
        Err(CliToolError::AuthRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_step_content_clamps_to_160_chars_and_collapses_whitespace() {
        let input = format!("a   b\n\nc{}", "x".repeat(400));
        let trimmed = trim_step_content(&input);
        assert!(trimmed.len() <= 160);
        assert!(trimmed.starts_with("a b c"));
    }

    #[tokio::test]
    async fn fake_mode_synthesizes_single_tool_step() {
        let outcome = fake_outcome();
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].role, StepRole::Tool);
        assert_eq!(outcome.steps[0].content, "codex_exec(fake)");
        let notes = outcome.steps[0].notes.as_ref().unwrap();
        assert_eq!(notes.tags, vec!["fake-codex-mode".to_string()]);
    }

    #[test]
    fn spawn_permission_denied_maps_to_permission_error() {
        let mapped = |kind: std::io::ErrorKind| -> CliToolError {
            let e = std::io::Error::from(kind);
            match e.kind() {
                std::io::ErrorKind::NotFound => CliToolError::NotInstalled,
                std::io::ErrorKind::PermissionDenied => CliToolError::PermissionError,
                _ => CliToolError::Io(e),
            }
        };
        assert!(matches!(mapped(std::io::ErrorKind::PermissionDenied), CliToolError::PermissionError));
        assert!(matches!(mapped(std::io::ErrorKind::NotFound), CliToolError::NotInstalled));
    }

    #[tokio::test]
    async fn registry_register_and_deregister_round_trip() {
        let registry = ProcessRegistry::new();
        let run_id = Id::new();
        registry.terminate(&run_id).await; // no-op when nothing registered
        assert!(registry.children.lock().unwrap().get(&run_id).is_none());
    }
}
