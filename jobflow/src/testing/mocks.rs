//! Mock collaborators and stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::core::{Job, JobId};
use crate::errors::{GenerationError, StageError, StoreError};
use crate::generation::{GenerationRequest, GenerationService};
use crate::pipeline::{StageContext, StageExecutor};
use crate::store::DurableStore;

/// A generation service that replays scripted replies and records calls.
///
/// Once the script is exhausted every call succeeds with
/// `{"stage": <stage>, "call": <n>}`.
#[derive(Debug, Default)]
pub struct ScriptedGenerationService {
    replies: Mutex<VecDeque<Result<serde_json::Value, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerationService {
    /// Creates a service with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful reply.
    pub fn push_reply(&self, value: serde_json::Value) {
        self.replies.lock().push_back(Ok(value));
    }

    /// Queues a failure.
    pub fn push_failure(&self, error: GenerationError) {
        self.replies.lock().push_back(Err(error));
    }

    /// Returns the number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns the number of calls issued by `stage`.
    #[must_use]
    pub fn calls_for(&self, stage: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.stage == stage).count()
    }

    /// Returns every request received.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerationService {
    async fn invoke(
        &self,
        request: &GenerationRequest,
    ) -> Result<serde_json::Value, GenerationError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!({ "stage": request.stage, "call": call })))
    }
}

/// Holds gated stages open until released.
#[derive(Debug, Default)]
pub struct StageGate {
    open: AtomicBool,
    opened: Notify,
    entered: AtomicUsize,
    arrivals: Notify,
}

impl StageGate {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Releases every waiting and future execution.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.opened.notify_waiters();
    }

    /// Closes the gate again for later executions.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Returns how many executions reached the gate.
    #[must_use]
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` executions reached the gate.
    pub async fn wait_entered(&self, count: usize) {
        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();
            if self.entered() >= count {
                return;
            }
            arrival.await;
        }
    }

    async fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.arrivals.notify_waiters();
        loop {
            let opened = self.opened.notified();
            tokio::pin!(opened);
            opened.as_mut().enable();
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            opened.await;
        }
    }
}

/// A recorded stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExecution {
    /// The job the stage ran for.
    pub job_id: JobId,
    /// The structural retry attempt.
    pub attempt: usize,
}

/// A stage that records its executions and can be held open by a gate.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    output: Mutex<Option<serde_json::Value>>,
    gate: Option<Arc<StageGate>>,
    executions: Mutex<Vec<RecordedExecution>>,
}

impl RecordingStage {
    /// Creates a stage that outputs `{"stage": <name>, "job": <job id>}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name, None))
    }

    /// Creates a stage that waits at `gate` before returning.
    ///
    /// A gated execution returns `StageError::Cancelled` if the run is
    /// cancelled while it waits.
    #[must_use]
    pub fn gated(name: impl Into<String>, gate: Arc<StageGate>) -> Arc<Self> {
        Arc::new(Self::build(name, Some(gate)))
    }

    fn build(name: impl Into<String>, gate: Option<Arc<StageGate>>) -> Self {
        Self {
            name: name.into(),
            output: Mutex::new(None),
            gate,
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Sets a fixed output.
    pub fn set_output(&self, output: serde_json::Value) {
        *self.output.lock() = Some(output);
    }

    /// Returns all recorded executions.
    #[must_use]
    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().clone()
    }

    /// Returns the number of executions.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// Returns the number of executions for `job_id`.
    #[must_use]
    pub fn executions_for(&self, job_id: JobId) -> usize {
        self.executions.lock().iter().filter(|e| e.job_id == job_id).count()
    }
}

#[async_trait]
impl StageExecutor for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        ctx.check_cancelled()?;
        self.executions.lock().push(RecordedExecution {
            job_id: ctx.job_id(),
            attempt: ctx.attempt(),
        });

        if let Some(gate) = &self.gate {
            tokio::select! {
                biased;
                () = ctx.token().cancelled() => return Err(StageError::Cancelled),
                () = gate.pass() => {}
            }
        }
        ctx.check_cancelled()?;

        let fixed = self.output.lock().clone();
        Ok(fixed.unwrap_or_else(|| {
            serde_json::json!({ "stage": self.name, "job": ctx.job_id().to_string() })
        }))
    }
}

/// A store wrapper whose saves can be made to fail.
pub struct FlakyStore {
    inner: Arc<dyn DurableStore>,
    failing_saves: AtomicUsize,
    fail_all: AtomicBool,
    fail_deletes: AtomicBool,
    failures: AtomicUsize,
}

impl std::fmt::Debug for FlakyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStore")
            .field("failing_saves", &self.failing_saves)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl FlakyStore {
    /// Wraps a store.
    #[must_use]
    pub fn new(inner: Arc<dyn DurableStore>) -> Self {
        Self {
            inner,
            failing_saves: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` saves fail.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Makes every save fail until turned off.
    pub fn fail_all_saves(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Makes every delete fail until turned off.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of saves that failed.
    #[must_use]
    pub fn save_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn fetch_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.fetch_by_id(id).await
    }

    async fn fetch_all_sorted_by_creation(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.fetch_all_sorted_by_creation().await
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        if self.should_fail() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Backend("injected save failure".to_string()));
        }
        self.inner.save(job).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected delete failure".to_string()));
        }
        self.inner.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::{CancellationToken, TaskRegistry, TaskScope};
    use crate::core::Progress;
    use crate::store::InMemoryJobStore;
    use std::time::Duration;

    fn context(job_id: JobId) -> StageContext {
        let token = Arc::new(CancellationToken::new());
        let tasks = TaskScope::new(Arc::new(TaskRegistry::new()), job_id, token.clone());
        let input = Arc::from(b"{}".as_slice());
        StageContext::new("s", job_id, "k", input, Progress::new(), token, tasks)
    }

    #[tokio::test]
    async fn test_scripted_service() {
        let service = ScriptedGenerationService::new();
        service.push_failure(GenerationError::transient("busy"));
        let request = GenerationRequest::new("outline", serde_json::json!({}));

        assert!(service.invoke(&request).await.is_err());
        let value = service.invoke(&request).await.unwrap();
        assert_eq!(value["call"], 2);
        assert_eq!(service.calls_for("outline"), 2);
    }

    #[tokio::test]
    async fn test_recording_stage() {
        let stage = RecordingStage::new("record");
        let job_id = JobId::new();

        let output = stage.execute(&context(job_id)).await.unwrap();
        assert_eq!(output["stage"], "record");
        assert_eq!(stage.executions_for(job_id), 1);

        stage.set_output(serde_json::json!(42));
        assert_eq!(stage.execute(&context(job_id)).await.unwrap(), serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_gated_stage_waits_and_cancels() {
        let gate = StageGate::new();
        let stage = RecordingStage::gated("held", gate.clone());
        let ctx = context(JobId::new());

        let running = {
            let stage = stage.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { stage.execute(&ctx).await })
        };
        tokio::time::timeout(Duration::from_secs(1), gate.wait_entered(1))
            .await
            .unwrap();
        assert!(!running.is_finished());

        ctx.token().cancel("paused");
        let result = tokio::time::timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
        assert_eq!(result, Err(StageError::Cancelled));

        gate.open();
        let passed = stage.execute(&context(JobId::new())).await;
        assert!(passed.is_ok());
    }

    #[tokio::test]
    async fn test_flaky_store() {
        let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
        let job = Job::new("k", Vec::new(), None);
        store.fail_next_saves(1);

        assert!(store.save(&job).await.is_err());
        assert!(store.save(&job).await.is_ok());
        assert_eq!(store.save_failures(), 1);
        assert!(store.fetch_by_id(job.id()).await.unwrap().is_some());

        store.fail_all_saves(true);
        assert!(store.save(&job).await.is_err());
        assert_eq!(store.save_failures(), 2);

        store.fail_deletes(true);
        assert!(store.delete(job.id()).await.is_err());
        store.fail_deletes(false);
        assert!(store.delete(job.id()).await.unwrap());
    }
}
