//! Planner Client (Section 4.5): a thin client to the upstream single-agent
//! tool-use loop. Degrades to synthetic mode — invoking the `exec` primitive
//! directly — when no planner credential is configured.

use crate::cli_tool::{CliTool, CliToolError, ExecContext, ExecOutcome, ProcessRegistry};
use orc_core::{Id, TaskType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    CliTool(#[from] CliToolError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerContext {
    pub workspace: String,
    pub pattern_block: String,
    pub base_prompt: String,
    pub task_type: TaskType,
    pub profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_session_id: Option<String>,
    pub run_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerRequest {
    pub messages: Vec<PlannerMessage>,
    pub context: PlannerContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerResponse {
    pub summary: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub struct PlannerClient {
    http: reqwest::Client,
    runner_url: String,
    credential_configured: bool,
}

impl PlannerClient {
    pub fn new(runner_url: String, credential_configured: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            runner_url,
            credential_configured,
        }
    }

    /// Invoke the planner: either a real upstream call, or a synthetic
    /// direct call to the `exec` primitive when no credential is configured.
    pub async fn dispatch(
        &self,
        ctx: &ExecContext,
        instructions: &str,
        request: PlannerRequest,
        cli_tool: &CliTool,
        registry: &ProcessRegistry,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, PlannerError> {
        if !self.credential_configured {
            return Ok(cli_tool.exec(ctx, instructions, registry, cancel).await?);
        }

        let response = self
            .http
            .post(format!("{}/v1/invoke", self.runner_url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<PlannerResponse>()
            .await?;

        Ok(ExecOutcome {
            steps: Vec::new(),
            raw_jsonl: String::new(),
            exit_code: 0,
            touched_file_count: 0,
            summary: response.summary,
            session_id: response.session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_expected_shape() {
        let request = PlannerRequest {
            messages: vec![PlannerMessage {
                role: "user",
                content: "do the thing".to_string(),
            }],
            context: PlannerContext {
                workspace: "/ws".to_string(),
                pattern_block: String::new(),
                base_prompt: "base".to_string(),
                task_type: TaskType::Code,
                profile: "default".to_string(),
                prior_session_id: None,
                run_id: Id::from_string("run-1"),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["context"]["task_type"], "code");
        assert!(json["context"].get("prior_session_id").is_none());
    }

    #[tokio::test]
    async fn synthetic_mode_invokes_exec_primitive_directly() {
        let client = PlannerClient::new("http://localhost:5055".to_string(), false);
        let cli_tool = CliTool::new(Default::default());
        let registry = ProcessRegistry::new();
        let cancel = CancellationToken::new();
        let ctx = ExecContext {
            workspace: std::env::temp_dir(),
            run_id: Id::new(),
            task_type: TaskType::Code,
            prior_session_id: None,
            profile: "default".to_string(),
            fake_mode: true,
        };
        let request = PlannerRequest {
            messages: vec![],
            context: PlannerContext {
                workspace: String::new(),
                pattern_block: String::new(),
                base_prompt: String::new(),
                task_type: TaskType::Code,
                profile: "default".to_string(),
                prior_session_id: None,
                run_id: ctx.run_id.clone(),
            },
        };
        let outcome = client
            .dispatch(&ctx, "do it", request, &cli_tool, &registry, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.steps.len(), 1);
    }
}
