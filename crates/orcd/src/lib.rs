//! orcd - Pattern Learning Orchestrator Daemon
//!
//! Library components for the daemon process.

pub mod broker;
pub mod cli_tool;
pub mod http;
pub mod pattern;
pub mod planner;
pub mod run_service;
pub mod scheduler;
pub mod storage;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use broker::Broker;
use cli_tool::{CliTool, CliToolConfig, ProcessRegistry};
use http::AppState;
use orc_core::Config;
use planner::PlannerClient;
use run_service::RunService;
use scheduler::{Scheduler, SchedulerError};
use storage::{Storage, StorageError};
use workspace::WorkspaceManager;

/// Backoff after scheduler errors before retrying the claim loop.
const SCHEDULER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Poll interval when no queued runs are available.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("http server error: {0}")]
    Http(#[from] std::io::Error),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// The daemon process: owns every long-lived component and drives the
/// claim-loop that pulls queued runs and spawns their lifecycle tasks.
pub struct Daemon {
    config: Config,
    state: Arc<AppState>,
    run_service: Arc<RunService>,
    scheduler: Arc<Scheduler>,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        let storage = Arc::new(Storage::new(&config.database_path).await?);
        storage.migrate_embedded().await?;

        let broker = Arc::new(Broker::new());
        let workspace = Arc::new(WorkspaceManager::new(config.workspace_root.clone()));
        let registry = Arc::new(ProcessRegistry::new());
        let cli_tool = Arc::new(CliTool::new(CliToolConfig {
            timeout_sec: config.cli_timeout_sec,
        }));
        let planner = Arc::new(PlannerClient::new(
            config.runner_url.clone(),
            config.planner_credential_configured() && !config.fake_planner,
        ));

        let run_service = Arc::new(RunService::new(
            Arc::clone(&storage),
            Arc::clone(&broker),
            Arc::clone(&workspace),
            Arc::clone(&cli_tool),
            Arc::clone(&registry),
            Arc::clone(&planner),
            config.artifacts_root.clone(),
            config.fake_codex,
        ));

        let scheduler = Arc::new(Scheduler::new(Arc::clone(&storage), config.max_concurrent_runs));

        let state = Arc::new(AppState {
            storage,
            broker,
            workspace,
            run_service: Arc::clone(&run_service),
            scheduler: Arc::clone(&scheduler),
        });

        Ok(Self {
            config,
            state,
            run_service,
            scheduler,
        })
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Resume any runs interrupted by a previous crash, start the HTTP
    /// server, then drive the claim loop until shutdown is requested.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let resumed = self.scheduler.resume_interrupted_runs().await?;
        if !resumed.is_empty() {
            info!(count = resumed.len(), "resumed runs interrupted by a previous crash");
        }

        let http_state = Arc::clone(&self.state);
        let port = self.config.port;
        let http_handle = tokio::spawn(async move {
            if let Err(error) = http::serve(http_state, port).await {
                error!(%error, "http server exited");
            }
        });

        loop {
            match self.scheduler.claim_next_run().await {
                Ok(Some(run)) => {
                    let run_service = Arc::clone(&self.run_service);
                    let scheduler = Arc::clone(&self.scheduler);
                    let run_id = run.id.clone();
                    tokio::spawn(async move {
                        run_service.run_lifecycle(run_id).await;
                        scheduler.release_run();
                    });
                }
                Ok(None) => tokio::time::sleep(CLAIM_POLL_INTERVAL).await,
                Err(scheduler::SchedulerError::Shutdown) => break,
                Err(error) => {
                    error!(%error, "scheduler error while claiming next run");
                    tokio::time::sleep(SCHEDULER_ERROR_BACKOFF).await;
                }
            }
        }

        http_handle.abort();
        Ok(())
    }
}
