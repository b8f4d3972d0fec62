//! Daemon configuration, loaded entirely from the environment.
//!
//! Field names and defaults match Section 6 of the spec's environment table.

use std::path::PathBuf;

/// Daemon and run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enables the planner and CLI credential. Absent ⇒ planner degrades to synthetic mode.
    pub openai_api_key: Option<String>,
    /// Skip the CLI subprocess; emit a stub step.
    pub fake_codex: bool,
    /// Skip the planner HTTP call; use synthetic mode.
    pub fake_planner: bool,
    /// Refuse runs whose workspace is not a git repository.
    pub require_git_repo: bool,
    /// Planner base URL.
    pub runner_url: String,
    /// Root directory under which per-run workspaces are materialized.
    pub workspace_root: PathBuf,
    /// Root directory under which artifacts are persisted.
    pub artifacts_root: PathBuf,
    /// Path to the embedded relational store.
    pub database_path: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Default per-profile wall-clock bound on the CLI subprocess, in seconds.
    pub cli_timeout_sec: u64,
    /// Maximum number of run lifecycles executing concurrently.
    pub max_concurrent_runs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            fake_codex: env_flag("FAKE_CODEX"),
            fake_planner: env_flag("FAKE_PLANNER"),
            require_git_repo: env_flag("REQUIRE_GIT_REPO"),
            runner_url: std::env::var("RUNNER_URL")
                .unwrap_or_else(|_| "http://localhost:5055".to_string()),
            workspace_root: std::env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./workspaces")),
            artifacts_root: std::env::var("ARTIFACTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/store")),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7700),
            cli_timeout_sec: 30 * 60,
            max_concurrent_runs: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn planner_credential_configured(&self) -> bool {
        self.openai_api_key.is_some()
    }
}

fn env_flag(key: &str) -> bool {
    matches!(std::env::var(key).as_deref(), Ok("1") | Ok("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        // Clear in case other tests in the same process set these vars.
        for key in ["FAKE_CODEX", "FAKE_PLANNER", "REQUIRE_GIT_REPO"] {
            std::env::remove_var(key);
        }
        let config = Config::default();
        assert!(!config.fake_codex);
        assert!(!config.fake_planner);
        assert!(!config.require_git_repo);
        assert_eq!(config.runner_url, "http://localhost:5055");
        assert_eq!(config.workspace_root, PathBuf::from("./workspaces"));
        assert_eq!(config.artifacts_root, PathBuf::from("./artifacts"));
        assert_eq!(config.database_path, PathBuf::from("./data/store"));
    }

    #[test]
    fn env_flag_accepts_one_and_true() {
        std::env::set_var("FAKE_CODEX", "1");
        assert!(env_flag("FAKE_CODEX"));
        std::env::set_var("FAKE_CODEX", "true");
        assert!(env_flag("FAKE_CODEX"));
        std::env::set_var("FAKE_CODEX", "0");
        assert!(!env_flag("FAKE_CODEX"));
        std::env::remove_var("FAKE_CODEX");
    }
}
