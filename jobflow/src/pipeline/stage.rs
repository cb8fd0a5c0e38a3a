//! Stage executors and the context they run in.
//!
//! A stage turns the job input and the outputs of earlier stages into one
//! output value. Executors are registered per job kind through a
//! [`PipelineBuilder`](super::PipelineBuilder).

use crate::cancellation::{CancellationToken, TaskScope};
use crate::core::{JobId, Progress};
use crate::errors::StageError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;

/// Trait for pipeline stages.
#[async_trait]
pub trait StageExecutor: Send + Sync + Debug {
    /// Returns the name of the stage, unique within its pipeline.
    fn name(&self) -> &str;

    /// Computes the stage output.
    ///
    /// Implementations call `ctx.check_cancelled()` around every external
    /// call and return `StageError::Cancelled` as soon as it fires.
    async fn execute(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError>;

    /// Validates the shape of a computed output.
    ///
    /// A failed check recomputes the stage a bounded number of times before
    /// the output is accepted as it is.
    fn check_shape(
        &self,
        _ctx: &StageContext,
        _output: &serde_json::Value,
    ) -> Result<(), StageError> {
        Ok(())
    }
}

/// Execution context handed to a stage executor.
#[derive(Debug, Clone)]
pub struct StageContext {
    stage: String,
    job_id: JobId,
    job_kind: String,
    input: Arc<[u8]>,
    prior: Progress,
    token: Arc<CancellationToken>,
    tasks: TaskScope,
    attempt: usize,
}

impl StageContext {
    /// Creates a new stage context.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        job_id: JobId,
        job_kind: impl Into<String>,
        input: Arc<[u8]>,
        prior: Progress,
        token: Arc<CancellationToken>,
        tasks: TaskScope,
    ) -> Self {
        Self {
            stage: stage.into(),
            job_id,
            job_kind: job_kind.into(),
            input,
            prior,
            token,
            tasks,
            attempt: 0,
        }
    }

    /// Sets the structural retry attempt.
    #[must_use]
    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    /// Returns the name of the running stage.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the job id.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Returns the job kind.
    #[must_use]
    pub fn job_kind(&self) -> &str {
        &self.job_kind
    }

    /// Returns the raw input parameters of the job.
    #[must_use]
    pub fn input_bytes(&self) -> &[u8] {
        &self.input
    }

    /// Decodes the job input parameters.
    ///
    /// # Errors
    ///
    /// Returns a compute failure if the input is not valid JSON for `T`.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, StageError> {
        serde_json::from_slice(&self.input)
            .map_err(|e| StageError::compute(&self.stage, format!("invalid job input: {e}")))
    }

    /// Returns the outputs of the stages completed before this one.
    #[must_use]
    pub fn progress(&self) -> &Progress {
        &self.prior
    }

    /// Decodes the output of an earlier stage.
    ///
    /// # Errors
    ///
    /// Returns a compute failure if the stage has not completed or its
    /// output does not decode into `T`.
    pub fn prior<T: DeserializeOwned>(&self, stage: &str) -> Result<T, StageError> {
        self.prior
            .get_typed(stage)
            .map_err(|e| StageError::compute(&self.stage, e.to_string()))?
            .ok_or_else(|| {
                StageError::compute(&self.stage, format!("missing output of stage '{stage}'"))
            })
    }

    /// Returns the run's cancellation token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Returns `Err(Cancelled)` once the run was cancelled.
    pub fn check_cancelled(&self) -> Result<(), StageError> {
        self.token.check()
    }

    /// Returns the scope for spawning registered sub-tasks.
    #[must_use]
    pub fn tasks(&self) -> &TaskScope {
        &self.tasks
    }

    /// Returns how many times this stage was already recomputed after a
    /// failed shape check.
    #[must_use]
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> StageExecutor for FnStage<F>
where
    F: Fn(&StageContext) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        (self.func)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::TaskRegistry;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Request {
        days: u32,
    }

    fn context(input: &[u8], prior: Progress) -> StageContext {
        let token = Arc::new(CancellationToken::new());
        let job_id = JobId::new();
        let tasks = TaskScope::new(Arc::new(TaskRegistry::new()), job_id, token.clone());
        StageContext::new("plan", job_id, "meal_plan", Arc::from(input), prior, token, tasks)
    }

    #[test]
    fn test_input_decoding() {
        let ctx = context(br#"{"days":5}"#, Progress::new());
        assert_eq!(ctx.input::<Request>().unwrap(), Request { days: 5 });

        let bad = context(b"oops", Progress::new());
        assert!(matches!(bad.input::<Request>(), Err(StageError::Compute { .. })));
    }

    #[test]
    fn test_prior_outputs() {
        let mut progress = Progress::new();
        progress.record("outline", serde_json::json!(["mon", "tue"])).unwrap();
        let ctx = context(b"{}", progress);

        assert_eq!(ctx.prior::<Vec<String>>("outline").unwrap(), vec!["mon", "tue"]);
        let err = ctx.prior::<Vec<String>>("details").unwrap_err();
        assert_eq!(err, StageError::compute("plan", "missing output of stage 'details'"));
    }

    #[test]
    fn test_check_cancelled() {
        let ctx = context(b"{}", Progress::new());
        assert!(ctx.check_cancelled().is_ok());
        ctx.token().cancel("paused");
        assert_eq!(ctx.check_cancelled(), Err(StageError::Cancelled));
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("echo", |ctx: &StageContext| Ok(serde_json::json!(ctx.attempt())));
        let ctx = context(b"{}", Progress::new()).with_attempt(2);

        assert_eq!(stage.name(), "echo");
        assert_eq!(stage.execute(&ctx).await.unwrap(), serde_json::json!(2));
        assert!(stage.check_shape(&ctx, &serde_json::json!(null)).is_ok());
    }
}
