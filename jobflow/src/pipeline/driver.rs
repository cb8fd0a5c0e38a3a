//! Drives one pipeline run to its outcome.
//!
//! The driver owns every write a run makes to its job record. Each write
//! re-reads the stored record first, so fields changed by other operations
//! while the run executes (queue position, owner) are never overwritten,
//! and a record that is gone or no longer `Running` stops the run as if it
//! had been cancelled.

use super::{CheckpointSink, CheckpointedPipeline, RunEnv};
use crate::cancellation::{CancellationToken, TaskScope};
use crate::core::{Job, JobId, JobStatus, Progress};
use crate::errors::{JobflowError, StageError};
use crate::events::{EventSink, JobEvent};
use crate::observability::RunTimer;
use crate::scheduler::SchedulerConfig;
use crate::store::DurableStore;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The result was persisted.
    Completed,
    /// The failure reason was persisted.
    Failed,
    /// The run stopped without writing a terminal status.
    Cancelled,
    /// Every terminal write attempt failed; the record is still `Running`.
    Unpersisted,
}

enum Terminal {
    Complete(Vec<u8>),
    Fail(String),
}

/// Executes pipelines against the durable store.
#[derive(Clone)]
pub struct JobDriver {
    store: Arc<dyn DurableStore>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
    record_writes: Arc<Mutex<()>>,
}

impl std::fmt::Debug for JobDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDriver").field("config", &self.config).finish_non_exhaustive()
    }
}

impl JobDriver {
    /// Creates a driver.
    ///
    /// `record_writes` serializes read-modify-write cycles on job records
    /// with the scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn DurableStore>,
        events: Arc<dyn EventSink>,
        config: SchedulerConfig,
        record_writes: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            record_writes,
        }
    }

    /// Runs `pipeline` for a job already marked `Running`.
    pub async fn drive(
        &self,
        job: Job,
        pipeline: &CheckpointedPipeline,
        token: Arc<CancellationToken>,
        tasks: TaskScope,
    ) -> RunExit {
        let timer = RunTimer::start();
        let progress = match job.progress() {
            Ok(progress) => progress,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable checkpoint; starting fresh");
                Progress::new()
            }
        };
        if !progress.is_empty() {
            info!(completed_stages = progress.len(), "Resuming from checkpoint");
        }

        let checkpoints = StoreCheckpoints {
            store: self.store.clone(),
            job_id: job.id(),
            token: token.clone(),
            record_writes: self.record_writes.clone(),
        };
        let env = RunEnv {
            token: &token,
            tasks: &tasks,
            checkpoints: &checkpoints,
            max_structural_retries: self.config.max_structural_retries,
        };

        let outcome = AssertUnwindSafe(pipeline.run(&job, progress, env))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("Stage executor panicked");
                Err(StageError::compute(pipeline.kind(), "stage executor panicked"))
            });

        let terminal = match outcome {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => Terminal::Complete(bytes),
                Err(e) => Terminal::Fail(format!("could not encode result: {e}")),
            },
            Err(StageError::Cancelled) => {
                info!(reason = ?token.reason(), "Run cancelled");
                return RunExit::Cancelled;
            }
            Err(e) => Terminal::Fail(e.to_string()),
        };

        self.finish(&job, &terminal, &token, &timer).await
    }

    async fn finish(
        &self,
        job: &Job,
        terminal: &Terminal,
        token: &CancellationToken,
        timer: &RunTimer,
    ) -> RunExit {
        let attempts = self.config.terminal_write_attempts.max(1);

        for attempt in 1..=attempts {
            if token.is_cancelled() {
                return RunExit::Cancelled;
            }
            match self.write_terminal(job.id(), terminal).await {
                Ok(Some(stored)) => {
                    self.announce(&stored, timer.elapsed_ms()).await;
                    return match stored.status() {
                        JobStatus::Completed => RunExit::Completed,
                        _ => RunExit::Failed,
                    };
                }
                Ok(None) => {
                    info!("Job record changed underneath the run; dropping its outcome");
                    return RunExit::Cancelled;
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Terminal write failed; retrying");
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return RunExit::Cancelled,
                        () = tokio::time::sleep(self.config.terminal_write_backoff()) => {}
                    }
                }
                Err(e) => {
                    error!(attempts, error = %e, "Terminal write failed; job left running on disk");
                }
            }
        }
        RunExit::Unpersisted
    }

    async fn write_terminal(
        &self,
        id: JobId,
        terminal: &Terminal,
    ) -> Result<Option<Job>, JobflowError> {
        let _guard = self.record_writes.lock().await;
        let Some(mut stored) = self.store.fetch_by_id(id).await? else {
            return Ok(None);
        };
        if stored.status() != JobStatus::Running {
            return Ok(None);
        }
        match terminal {
            Terminal::Complete(bytes) => stored.complete(bytes.clone())?,
            Terminal::Fail(reason) => stored.fail(reason.clone())?,
        }
        self.store.save(&stored).await?;
        Ok(Some(stored))
    }

    async fn announce(&self, job: &Job, duration_ms: u64) {
        match job.status() {
            JobStatus::Completed => info!(duration_ms, "Job completed"),
            status => info!(
                status = %status,
                duration_ms,
                reason = ?job.failure_reason(),
                "Job failed"
            ),
        }
        self.events
            .emit(&JobEvent::status_changed(job.id(), job.status()))
            .await;
        if job.status() == JobStatus::Completed {
            self.events
                .emit(&JobEvent::completed(job.id(), job.job_kind()))
                .await;
        }
    }
}

struct StoreCheckpoints {
    store: Arc<dyn DurableStore>,
    job_id: JobId,
    token: Arc<CancellationToken>,
    record_writes: Arc<Mutex<()>>,
}

#[async_trait]
impl CheckpointSink for StoreCheckpoints {
    async fn persist(&self, progress: &Progress) -> Result<(), StageError> {
        self.token.check()?;
        {
            let _guard = self.record_writes.lock().await;
            let mut stored = match self.store.fetch_by_id(self.job_id).await {
                Ok(Some(stored)) if stored.status() == JobStatus::Running => stored,
                Ok(_) => {
                    info!("Job record gone or no longer running; stopping run");
                    return Err(StageError::Cancelled);
                }
                Err(e) => {
                    warn!(error = %e, "Could not read job record; checkpoint kept in memory");
                    return self.token.check();
                }
            };
            if let Err(e) = stored.store_checkpoint(progress) {
                warn!(error = %e, "Could not encode checkpoint; kept in memory");
                return self.token.check();
            }
            match self.store.save(&stored).await {
                Ok(()) => debug!(stages = progress.len(), "Checkpoint persisted"),
                Err(e) => warn!(error = %e, "Checkpoint write failed; continuing in memory"),
            }
        }
        self.token.check()
    }
}
