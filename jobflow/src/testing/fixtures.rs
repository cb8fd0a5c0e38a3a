//! Polling helpers and pipeline fixtures for scheduler tests.

use std::sync::Arc;
use std::time::Duration;

use crate::core::{Job, JobId, JobStatus};
use crate::errors::JobflowError;
use crate::pipeline::{CheckpointedPipeline, PipelineBuilder, StageExecutor};
use crate::scheduler::JobScheduler;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Waits until job `id` has `status` and returns it.
///
/// # Errors
///
/// Returns `Internal` on timeout and propagates store errors.
pub async fn wait_for_status(
    scheduler: &JobScheduler,
    id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> Result<Job, JobflowError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = scheduler.get(id).await?;
        if job.status() == status {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(JobflowError::Internal(format!(
                "job {id} still {} after {timeout:?}, wanted {status}",
                job.status()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Waits until `id` holds the execution slot.
///
/// # Errors
///
/// Returns `Internal` on timeout.
pub async fn wait_for_running(
    scheduler: &JobScheduler,
    id: JobId,
    timeout: Duration,
) -> Result<(), JobflowError> {
    let deadline = tokio::time::Instant::now() + timeout;
    while scheduler.running_job() != Some(id) {
        if tokio::time::Instant::now() >= deadline {
            return Err(JobflowError::Internal(format!(
                "job {id} not running after {timeout:?}"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

/// Waits until the queue is drained: nothing runs and nothing is pending.
///
/// # Errors
///
/// Returns `Internal` on timeout and propagates store errors.
pub async fn wait_until_idle(
    scheduler: &JobScheduler,
    timeout: Duration,
) -> Result<(), JobflowError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let pending = scheduler
            .list()
            .await?
            .iter()
            .filter(|job| job.status() == JobStatus::Pending)
            .count();
        if scheduler.is_idle() && pending == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(JobflowError::Internal(format!(
                "scheduler not idle after {timeout:?} ({pending} pending)"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Builds a pipeline running `stages` in order.
///
/// # Panics
///
/// Panics if the stage names are not unique.
#[must_use]
pub fn linear_pipeline(kind: &str, stages: &[Arc<dyn StageExecutor>]) -> CheckpointedPipeline {
    stages
        .iter()
        .try_fold(PipelineBuilder::new(kind), |builder, stage| builder.stage(stage.clone()))
        .and_then(PipelineBuilder::build)
        .unwrap_or_else(|e| panic!("invalid test pipeline '{kind}': {e}"))
}
