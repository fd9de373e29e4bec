//! Bounded-concurrency batch execution.
//!
//! Runs many independent jobs, each through its own [`JobExecutor`] run
//! and therefore its own workspace, with at most `max_workers` in flight.
//! Outcomes come back in submission order; one job's failure neither
//! cancels nor blocks the rest.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::info;

use crate::error::JobError;
use crate::executor::JobExecutor;
use crate::job::{AgentJob, AgentRunResult};

/// Fans a set of jobs out over a bounded pool of concurrent runs.
pub struct BatchExecutor {
    executor: Arc<JobExecutor>,
}

impl BatchExecutor {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self { executor }
    }

    /// Runs every job, at most `max_workers` concurrently (default: one
    /// worker per job).
    ///
    /// Returns each job's individually retrieved outcome in submission
    /// order: successes are `Ok` results, a failed job is the `Err` in its
    /// slot. All jobs run to completion before this returns.
    pub async fn run_batch(
        &self,
        jobs: Vec<AgentJob>,
        max_workers: Option<usize>,
    ) -> Vec<Result<AgentRunResult, JobError>> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let workers = max_workers.unwrap_or(jobs.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        info!(jobs = jobs.len(), workers, "Starting job batch");

        let futures: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let executor = Arc::clone(&self.executor);
                let semaphore = Arc::clone(&semaphore);
                async move {
                    // The semaphore is never closed, so acquisition only
                    // waits, it cannot fail.
                    let _permit = semaphore.acquire_owned().await.ok();
                    executor.run(job).await
                }
            })
            .collect();

        join_all(futures).await
    }
}
