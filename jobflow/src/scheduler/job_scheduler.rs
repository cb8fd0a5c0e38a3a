//! The single-slot FIFO job scheduler.

use super::handle::RunningHandle;
use super::SchedulerConfig;
use crate::cancellation::{CancellationToken, TaskRegistry, TaskScope};
use crate::core::{Job, JobId, JobStatus, OwnerId};
use crate::errors::JobflowError;
use crate::events::{EventSink, JobEvent, NoOpEventSink};
use crate::pipeline::{CheckpointedPipeline, JobDriver, PipelineRegistry, RunExit};
use crate::store::DurableStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Builder for [`JobScheduler`].
pub struct SchedulerBuilder {
    store: Arc<dyn DurableStore>,
    pipelines: PipelineRegistry,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    /// Creates a builder over a durable store.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            pipelines: PipelineRegistry::new(),
            events: Arc::new(NoOpEventSink),
            config: SchedulerConfig::default(),
        }
    }

    /// Registers a pipeline under its job kind.
    #[must_use]
    pub fn pipeline(mut self, pipeline: CheckpointedPipeline) -> Self {
        self.pipelines.register(pipeline);
        self
    }

    /// Replaces the pipeline registry.
    #[must_use]
    pub fn pipelines(mut self, pipelines: PipelineRegistry) -> Self {
        self.pipelines = pipelines;
        self
    }

    /// Sets the sink receiving job events.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the scheduler. Call [`JobScheduler::start`] before serving
    /// other calls.
    #[must_use]
    pub fn build(self) -> JobScheduler {
        let record_writes = Arc::new(tokio::sync::Mutex::new(()));
        let driver = JobDriver::new(
            self.store.clone(),
            self.events.clone(),
            self.config.clone(),
            record_writes.clone(),
        );
        JobScheduler {
            inner: Arc::new(Inner {
                store: self.store,
                pipelines: self.pipelines,
                events: self.events,
                tasks: Arc::new(TaskRegistry::new()),
                config: self.config,
                driver,
                running: Mutex::new(HashMap::new()),
                ops: tokio::sync::Mutex::new(()),
                stranded: Mutex::new(HashMap::new()),
                record_writes,
                next_run_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

/// Runs at most one job at a time, oldest pending job first.
///
/// Public operations are serialized; a run executes on its own task and
/// frees the slot when it ends. A run stopped by `pause`, `prioritize`,
/// `delete` or `shutdown` leaves the next scheduling step to that
/// operation.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("running", &self.running_job())
            .field("kinds", &self.inner.pipelines.kinds())
            .finish_non_exhaustive()
    }
}

enum Launch {
    Started,
    /// The job was failed instead of started.
    Rejected,
    Busy,
}

#[derive(Clone, Copy)]
enum Requeue {
    PreserveProgress,
    DiscardProgress,
}

struct Inner {
    store: Arc<dyn DurableStore>,
    pipelines: PipelineRegistry,
    events: Arc<dyn EventSink>,
    tasks: Arc<TaskRegistry>,
    config: SchedulerConfig,
    driver: JobDriver,
    /// Holds at most one entry.
    running: Mutex<HashMap<JobId, RunningHandle>>,
    /// Serializes the public operations.
    ops: tokio::sync::Mutex<()>,
    /// Stopped jobs whose reset to `Pending` could not be persisted; reset
    /// again before the next launch.
    stranded: Mutex<HashMap<JobId, Requeue>>,
    /// Serializes read-modify-write cycles with the driver.
    record_writes: Arc<tokio::sync::Mutex<()>>,
    next_run_id: AtomicU64,
    shut_down: AtomicBool,
}

impl JobScheduler {
    /// Starts building a scheduler.
    #[must_use]
    pub fn builder(store: Arc<dyn DurableStore>) -> SchedulerBuilder {
        SchedulerBuilder::new(store)
    }

    /// Recovers interrupted jobs, then launches the oldest pending one.
    ///
    /// Returns the number of recovered jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery could not read or write the store.
    pub async fn start(&self) -> Result<usize, JobflowError> {
        let recovered = self.resume_interrupted_jobs().await?;
        self.schedule_next_if_idle().await?;
        Ok(recovered)
    }

    /// Persists a new pending job and launches it if the slot is free.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the job could not be saved.
    pub async fn submit(
        &self,
        job_kind: impl Into<String>,
        input_parameters: Vec<u8>,
        owner_ref: Option<OwnerId>,
    ) -> Result<JobId, JobflowError> {
        let _ops = self.inner.ops.lock().await;
        let job = Job::new(job_kind, input_parameters, owner_ref);
        let id = job.id();

        self.inner.store.save(&job).await.map_err(|e| {
            error!(job_id = %id, error = %e, "Could not persist submitted job");
            e
        })?;
        info!(job_id = %id, job_kind = %job.job_kind(), "Job submitted");
        self.inner
            .events
            .emit(&JobEvent::status_changed(id, JobStatus::Pending))
            .await;

        self.inner.schedule_quietly().await;
        Ok(id)
    }

    /// Serializes `input` as JSON and submits it.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the input cannot be serialized.
    pub async fn submit_json<T: Serialize + Sync>(
        &self,
        job_kind: impl Into<String>,
        input: &T,
        owner_ref: Option<OwnerId>,
    ) -> Result<JobId, JobflowError> {
        let bytes =
            serde_json::to_vec(input).map_err(|e| JobflowError::Serialization(e.to_string()))?;
        self.submit(job_kind, bytes, owner_ref).await
    }

    /// Launches the oldest pending job unless one is running.
    ///
    /// Returns the launched job, if any.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the queue could not be read or the job
    /// could not be marked running.
    pub async fn schedule_next_if_idle(&self) -> Result<Option<JobId>, JobflowError> {
        self.inner.schedule_next_if_idle().await
    }

    /// Returns every job ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store could not be read.
    pub async fn list(&self) -> Result<Vec<Job>, JobflowError> {
        Ok(self.inner.store.fetch_all_sorted_by_creation().await?)
    }

    /// Returns one job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub async fn get(&self, id: JobId) -> Result<Job, JobflowError> {
        self.inner.fetch(id).await
    }

    /// Returns the job currently holding the slot.
    #[must_use]
    pub fn running_job(&self) -> Option<JobId> {
        self.inner.running_job()
    }

    /// Returns true if no job is running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.running_job().is_none()
    }

    /// Returns the registry tracking fan-out sub-tasks.
    #[must_use]
    pub fn task_registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.tasks
    }

    /// Runs `id` now, preempting the running job.
    ///
    /// The preempted job goes back to `Pending` with its progress intact.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `InvalidState` for jobs that
    /// already completed or failed. Returns `Persistence` without launching
    /// `id` if the preempted job could not be requeued.
    pub async fn prioritize(&self, id: JobId) -> Result<(), JobflowError> {
        let _ops = self.inner.ops.lock().await;
        let target = self.inner.fetch(id).await?;
        if target.status().is_terminal() {
            return Err(JobflowError::invalid_state(id, target.status(), "prioritize"));
        }

        let current = self.inner.running_job();
        if current == Some(id) {
            debug!(job_id = %id, "Prioritized job is already running");
            return Ok(());
        }
        if let Some(current) = current {
            info!(job_id = %current, preempted_by = %id, "Preempting running job");
            self.inner.force_stop(current, "preempted").await;
            // The target is not launched while the preempted job is still
            // marked running on disk.
            self.inner
                .requeue_stopped(current, Requeue::PreserveProgress)
                .await?;
        }
        self.inner.recover_stranded().await?;

        let mut target = self.inner.fetch(id).await?;
        if target.status() == JobStatus::Running {
            // Orphaned by a crash and not recovered yet.
            target.reset_preserving_progress()?;
        }
        match self.inner.launch(target).await {
            Ok(Launch::Started | Launch::Busy) => Ok(()),
            Ok(Launch::Rejected) => {
                self.inner.schedule_quietly().await;
                Ok(())
            }
            Err(e) => {
                self.inner.schedule_quietly().await;
                Err(e)
            }
        }
    }

    /// Stops `id` if it is running, discards its progress and moves it to
    /// the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `InvalidState` for jobs that
    /// already completed or failed.
    pub async fn pause(&self, id: JobId) -> Result<(), JobflowError> {
        let _ops = self.inner.ops.lock().await;
        let job = self.inner.fetch(id).await?;
        if job.status().is_terminal() {
            return Err(JobflowError::invalid_state(id, job.status(), "pause"));
        }

        let requeued = if self.inner.force_stop(id, "paused").await {
            self.inner.requeue_stopped(id, Requeue::DiscardProgress).await
        } else {
            self.inner.requeue(id, Requeue::DiscardProgress).await
        };
        let outcome = match requeued {
            Ok(Some(status)) if status.is_terminal() => {
                Err(JobflowError::invalid_state(id, status, "pause"))
            }
            Ok(Some(_)) => {
                info!(job_id = %id, "Job paused");
                Ok(())
            }
            Ok(None) => Err(JobflowError::NotFound(id)),
            Err(e) => Err(e),
        };

        self.inner.schedule_quietly().await;
        outcome
    }

    /// Stops `id` if it is running and removes it from the store.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `Persistence` if the store
    /// refused the delete.
    pub async fn delete(&self, id: JobId) -> Result<(), JobflowError> {
        let _ops = self.inner.ops.lock().await;
        self.inner.fetch(id).await?;

        let stopped = self.inner.force_stop(id, "deleted").await;
        let removed = self.inner.store.delete(id).await;
        self.inner.tasks.cancel_all(id);
        if removed.is_err() && stopped {
            // Still marked running on disk; queue it again until a delete succeeds.
            self.inner.stranded.lock().insert(id, Requeue::PreserveProgress);
        }
        self.inner.schedule_quietly().await;

        removed?;
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Resets every job left `Running` by a previous process to `Pending`,
    /// keeping its progress.
    ///
    /// Called once at startup, before the first scheduling step.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store could not be read or written.
    pub async fn resume_interrupted_jobs(&self) -> Result<usize, JobflowError> {
        let _ops = self.inner.ops.lock().await;
        let jobs = self.inner.store.fetch_all_sorted_by_creation().await?;
        let mut recovered = 0;

        for mut job in jobs.into_iter().filter(|job| job.status() == JobStatus::Running) {
            if self.inner.running.lock().contains_key(&job.id()) {
                continue;
            }
            job.reset_preserving_progress()?;
            self.inner.store.save(&job).await?;
            info!(
                job_id = %job.id(),
                has_checkpoint = job.progress_checkpoint().is_some(),
                "Recovered interrupted job"
            );
            self.inner
                .events
                .emit(&JobEvent::status_changed(job.id(), JobStatus::Pending))
                .await;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Nulls the owner reference of every job owned by `owner`.
    ///
    /// Jobs are never deleted with their owner. Returns the number of
    /// detached jobs.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store could not be read or written.
    pub async fn detach_owner(&self, owner: &OwnerId) -> Result<usize, JobflowError> {
        let _ops = self.inner.ops.lock().await;
        let owned: Vec<JobId> = self
            .inner
            .store
            .fetch_all_sorted_by_creation()
            .await?
            .iter()
            .filter(|job| job.is_owned_by(owner))
            .map(Job::id)
            .collect();

        let mut detached = 0;
        for id in owned {
            let _writes = self.inner.record_writes.lock().await;
            let Some(mut job) = self.inner.store.fetch_by_id(id).await? else {
                continue;
            };
            if !job.is_owned_by(owner) {
                continue;
            }
            job.detach_owner();
            self.inner.store.save(&job).await?;
            detached += 1;
        }
        info!(owner = %owner, detached, "Detached jobs from deleted owner");
        Ok(detached)
    }

    /// Stops the running job without writing any status and refuses to
    /// launch further jobs.
    ///
    /// The stopped job stays `Running` on disk and is recovered by
    /// [`resume_interrupted_jobs`](Self::resume_interrupted_jobs) at the
    /// next start.
    pub async fn shutdown(&self) {
        let _ops = self.inner.ops.lock().await;
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let running: Vec<JobId> = self.inner.running.lock().values().map(|h| h.job_id).collect();
        for id in running {
            self.inner.force_stop(id, "shutdown").await;
        }
        info!("Scheduler shut down");
    }
}

impl Inner {
    fn running_job(&self) -> Option<JobId> {
        self.running.lock().keys().next().copied()
    }

    async fn fetch(&self, id: JobId) -> Result<Job, JobflowError> {
        self.store
            .fetch_by_id(id)
            .await?
            .ok_or(JobflowError::NotFound(id))
    }

    async fn schedule_next_if_idle(self: &Arc<Self>) -> Result<Option<JobId>, JobflowError> {
        let _ops = self.ops.lock().await;
        self.schedule_next().await
    }

    /// Schedules the next job, logging instead of returning failures.
    async fn schedule_quietly(self: &Arc<Self>) {
        if let Err(e) = self.schedule_next().await {
            warn!(error = %e, "Could not schedule next job");
        }
    }

    /// Requires the ops lock.
    async fn schedule_next(self: &Arc<Self>) -> Result<Option<JobId>, JobflowError> {
        if self.shut_down.load(Ordering::SeqCst) || !self.running.lock().is_empty() {
            return Ok(None);
        }

        self.recover_stranded().await?;

        let jobs = self.store.fetch_all_sorted_by_creation().await?;
        for job in jobs.into_iter().filter(|job| job.status() == JobStatus::Pending) {
            let id = job.id();
            match self.launch(job).await? {
                Launch::Started => return Ok(Some(id)),
                Launch::Rejected => continue,
                Launch::Busy => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Requires the ops lock.
    async fn launch(self: &Arc<Self>, mut job: Job) -> Result<Launch, JobflowError> {
        if self.shut_down.load(Ordering::SeqCst) || !self.running.lock().is_empty() {
            return Ok(Launch::Busy);
        }
        let id = job.id();

        let Some(pipeline) = self.pipelines.get(job.job_kind()) else {
            self.reject_unknown_kind(job).await?;
            return Ok(Launch::Rejected);
        };

        job.mark_running()?;
        self.store.save(&job).await.map_err(|e| {
            error!(job_id = %id, error = %e, "Could not mark job running");
            e
        })?;
        self.events
            .emit(&JobEvent::status_changed(id, JobStatus::Running))
            .await;

        let token = Arc::new(CancellationToken::new());
        let scope = TaskScope::new(self.tasks.clone(), id, token.clone());
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("job_run", job_id = %id, job_kind = %job.job_kind());
        let run = Arc::clone(self)
            .run(job, pipeline, token.clone(), scope, run_id)
            .instrument(span);

        {
            // Inserted under the lock so the run cannot release its slot first.
            let mut running = self.running.lock();
            let join = tokio::spawn(run);
            running.insert(id, RunningHandle::new(id, run_id, token, join));
        }
        Ok(Launch::Started)
    }

    fn run(
        self: Arc<Self>,
        job: Job,
        pipeline: Arc<CheckpointedPipeline>,
        token: Arc<CancellationToken>,
        scope: TaskScope,
        run_id: u64,
    ) -> BoxFuture<'static, ()> {
        async move {
            let id = job.id();
            info!("Job started");
            let exit = self.driver.drive(job, &pipeline, token, scope).await;
            self.tasks.cancel_all(id);

            if !self.release_unless_stopping(id, run_id) {
                // The operation stopping the run owns the next step.
                return;
            }
            if exit == RunExit::Cancelled {
                // No status was written; a record still marked running is
                // recovered by `resume_interrupted_jobs`.
                warn!("Run ended as cancelled without a stop request");
            }

            // Detached: the ops lock may be held by a caller awaiting this task.
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = inner.schedule_next_if_idle().await {
                    warn!(error = %e, "Could not schedule next job");
                }
            });
        }
        .boxed()
    }

    /// Frees the slot of `run_id` unless an operation is stopping it.
    ///
    /// Returns false when that operation owns the release.
    fn release_unless_stopping(&self, id: JobId, run_id: u64) -> bool {
        let mut running = self.running.lock();
        match running.get(&id) {
            Some(handle) if handle.run_id == run_id => {
                if handle.is_stopping() {
                    return false;
                }
                running.remove(&id);
                true
            }
            _ => true,
        }
    }

    fn release(&self, id: JobId, run_id: u64) {
        let mut running = self.running.lock();
        if running.get(&id).is_some_and(|handle| handle.run_id == run_id) {
            running.remove(&id);
        }
    }

    /// Cancels the run of `id` and its sub-tasks and waits for it to exit.
    ///
    /// Returns false if `id` was not running. Requires the ops lock.
    async fn force_stop(&self, id: JobId, reason: &str) -> bool {
        let stopping = self
            .running
            .lock()
            .get_mut(&id)
            .map(|handle| (handle.run_id, handle.begin_stop(reason)));
        let Some((run_id, join)) = stopping else {
            self.tasks.cancel_all(id);
            return false;
        };
        self.tasks.cancel_all(id);

        if let Some(mut join) = join {
            let grace = self.config.cancel_grace_period();
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!(
                    job_id = %id,
                    grace_ms = self.config.cancel_grace_period_ms,
                    "Run ignored cancellation; aborting it"
                );
                join.abort();
                if let Err(e) = join.await {
                    debug!(job_id = %id, error = %e, "Aborted run");
                }
            }
        }

        // Sub-tasks spawned while the run was winding down.
        self.tasks.cancel_all(id);
        self.release(id, run_id);
        info!(job_id = %id, reason, "Stopped running job");
        true
    }

    /// Moves a stopped job back to `Pending`.
    ///
    /// Returns the stored status afterwards, or `None` if the job is gone.
    /// Jobs that reached a terminal status while stopping are left as they
    /// are. Requires the ops lock.
    async fn requeue(&self, id: JobId, mode: Requeue) -> Result<Option<JobStatus>, JobflowError> {
        let Some(mut job) = self.store.fetch_by_id(id).await? else {
            return Ok(None);
        };
        if job.status().is_terminal() {
            return Ok(Some(job.status()));
        }

        match mode {
            Requeue::PreserveProgress => job.reset_preserving_progress()?,
            Requeue::DiscardProgress => job.reset_discarding_progress()?,
        }
        self.store.save(&job).await?;
        self.events
            .emit(&JobEvent::status_changed(id, JobStatus::Pending))
            .await;
        Ok(Some(job.status()))
    }

    /// Requeues a job this scheduler just stopped, retrying failed writes.
    ///
    /// A job that still cannot be written is remembered as stranded, and
    /// no job is launched until its reset is persisted. Requires the ops
    /// lock.
    async fn requeue_stopped(
        &self,
        id: JobId,
        mode: Requeue,
    ) -> Result<Option<JobStatus>, JobflowError> {
        let attempts = self.config.terminal_write_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.requeue(id, mode).await {
                Ok(status) => {
                    self.stranded.lock().remove(&id);
                    return Ok(status);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        job_id = %id,
                        attempt,
                        error = %e,
                        "Could not requeue stopped job; retrying"
                    );
                    tokio::time::sleep(self.config.terminal_write_backoff()).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        job_id = %id,
                        attempts,
                        error = %e,
                        "Could not requeue stopped job; holding launches until it is reset"
                    );
                    self.stranded.lock().insert(id, mode);
                    return Err(e);
                }
            }
        }
    }

    /// Resets every stranded job. Requires the ops lock.
    async fn recover_stranded(&self) -> Result<(), JobflowError> {
        let stranded: Vec<(JobId, Requeue)> = self
            .stranded
            .lock()
            .iter()
            .map(|(id, mode)| (*id, *mode))
            .collect();
        for (id, mode) in stranded {
            self.requeue(id, mode).await?;
            self.stranded.lock().remove(&id);
            info!(job_id = %id, "Requeued stranded job");
        }
        Ok(())
    }

    async fn reject_unknown_kind(&self, mut job: Job) -> Result<(), JobflowError> {
        let reason = format!("No pipeline registered for job kind '{}'", job.job_kind());
        warn!(job_id = %job.id(), job_kind = %job.job_kind(), "Failing job with unknown kind");
        job.mark_running()?;
        job.fail(reason)?;
        self.store.save(&job).await?;
        self.events
            .emit(&JobEvent::status_changed(job.id(), JobStatus::Failed))
            .await;
        Ok(())
    }
}
