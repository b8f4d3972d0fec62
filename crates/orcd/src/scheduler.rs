//! Scheduler: concurrency-capped run claiming and startup resume.
//!
//! Everything beyond admission control and the one semaphore permit per
//! active run lifecycle belongs to the Run Service (Section 4.6); this
//! module only answers "is there capacity, and which queued run goes next."

use crate::storage::{Storage, StorageError};
use orc_core::{Run, RunStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 3;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("scheduler shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Admission control over concurrently executing run lifecycles
/// (Section 5: "multiple concurrent run lifecycles execute in parallel
/// tasks... one task per run").
pub struct Scheduler {
    storage: Arc<Storage>,
    concurrency_semaphore: Arc<Semaphore>,
    active_runs: AtomicUsize,
    max_concurrent: usize,
    claim_lock: Mutex<()>,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, max_concurrent: usize) -> Self {
        Self {
            storage,
            concurrency_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active_runs: AtomicUsize::new(0),
            max_concurrent,
            claim_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Claim the oldest queued run and transition it to `running`, blocking
    /// until a concurrency slot is available. Returns `None` once shutdown
    /// is observed, either before or while waiting for a slot.
    pub async fn claim_next_run(&self) -> Result<Option<Run>> {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }

        let permit = match self.concurrency_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tokio::select! {
                    permit = self.concurrency_semaphore.clone().acquire_owned() => {
                        permit.map_err(|_| SchedulerError::Shutdown)?
                    }
                    () = wait_for_shutdown(self) => return Err(SchedulerError::Shutdown),
                }
            }
        };

        let _lock = self.claim_lock.lock().await;
        let runs = self.storage.list_runs(None).await?;
        let Some(run) = runs.into_iter().find(|r| r.status == RunStatus::Queued) else {
            drop(permit);
            return Ok(None);
        };

        self.active_runs.fetch_add(1, Ordering::SeqCst);
        // Held for the lifetime of the run lifecycle task; released in `release_run`.
        std::mem::forget(permit);
        Ok(Some(run))
    }

    /// Release the concurrency slot claimed for `run_id`. Called once the
    /// lifecycle reaches a terminal status.
    pub fn release_run(&self) {
        self.concurrency_semaphore.add_permits(1);
        self.active_runs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Runs left `running` by a crashed prior process are requeued so the
    /// main loop picks them back up (Section 5 resume-on-restart).
    pub async fn resume_interrupted_runs(&self) -> Result<Vec<Run>> {
        let runs = self.storage.list_runs(None).await?;
        let interrupted: Vec<Run> = runs.into_iter().filter(|r| r.status == RunStatus::Running).collect();
        for run in &interrupted {
            let mut requeued = run.clone();
            requeued.status = RunStatus::Queued;
            self.storage.update_run(&requeued).await?;
            info!(run_id = %run.id, "requeued run interrupted by a previous crash");
        }
        Ok(interrupted)
    }
}

async fn wait_for_shutdown(scheduler: &Scheduler) {
    loop {
        if scheduler.is_shutdown() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::TaskType;

    async fn fresh_storage() -> (Arc<Storage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (Arc::new(storage), dir)
    }

    #[tokio::test]
    async fn claim_returns_none_when_queue_is_empty() {
        let (storage, _dir) = fresh_storage().await;
        let scheduler = Scheduler::new(storage, 2);
        assert!(scheduler.claim_next_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_transitions_nothing_but_reports_the_queued_run() {
        let (storage, _dir) = fresh_storage().await;
        let run = Run::new("demo".into(), "n".into(), "do it".into(), TaskType::Code);
        storage.insert_run(&run).await.unwrap();
        let scheduler = Scheduler::new(storage, 2);
        let claimed = scheduler.claim_next_run().await.unwrap().unwrap();
        assert_eq!(claimed.id, run.id);
        assert_eq!(scheduler.active_run_count(), 1);
        scheduler.release_run();
        assert_eq!(scheduler.active_run_count(), 0);
    }

    #[tokio::test]
    async fn resume_interrupted_runs_requeues_running_rows() {
        let (storage, _dir) = fresh_storage().await;
        let mut run = Run::new("demo".into(), "n".into(), "do it".into(), TaskType::Code);
        run.status = RunStatus::Running;
        storage.insert_run(&run).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), 2);
        let resumed = scheduler.resume_interrupted_runs().await.unwrap();
        assert_eq!(resumed.len(), 1);
        let fetched = storage.require_run(&run.id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Queued);
    }
}
