//! Checkpointed multi-stage execution.
//!
//! Stages run in order against a [`Progress`] record. A stage whose output
//! is already recorded is reused without being executed, and every newly
//! completed stage is persisted through a [`CheckpointSink`] before the
//! next one starts. That write is the only durability boundary: work done
//! inside a stage that has not returned is recomputed after a resume.

use super::{StageContext, StageSpec};
use crate::cancellation::{CancellationToken, TaskScope};
use crate::core::{Job, Progress};
use crate::errors::StageError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Destination of per-stage checkpoints.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Persists the progress after a completed stage.
    ///
    /// Returns `Err(StageError::Cancelled)` when the run must stop, e.g.
    /// because its job record is gone. Write failures are not errors: the
    /// run continues in memory and the next checkpoint retries.
    async fn persist(&self, progress: &Progress) -> Result<(), StageError>;
}

/// Everything a pipeline run needs besides the job itself.
#[derive(Clone, Copy)]
pub struct RunEnv<'a> {
    /// The run's cancellation token.
    pub token: &'a Arc<CancellationToken>,
    /// Scope for fan-out sub-tasks.
    pub tasks: &'a TaskScope,
    /// Where completed stages are checkpointed.
    pub checkpoints: &'a dyn CheckpointSink,
    /// Default structural retry bound for stages without their own.
    pub max_structural_retries: usize,
}

/// An ordered list of named stages for one job kind.
#[derive(Debug, Clone)]
pub struct CheckpointedPipeline {
    kind: String,
    stages: Vec<StageSpec>,
}

impl CheckpointedPipeline {
    pub(crate) fn new(kind: String, stages: Vec<StageSpec>) -> Self {
        Self { kind, stages }
    }

    /// Returns the job kind this pipeline serves.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage not yet present in `progress` and returns the output
    /// of the last stage.
    ///
    /// # Errors
    ///
    /// Returns `StageError::Cancelled` as soon as cancellation is observed,
    /// leaving the persisted progress untouched, or the first compute
    /// failure of a stage.
    pub async fn run(
        &self,
        job: &Job,
        mut progress: Progress,
        env: RunEnv<'_>,
    ) -> Result<serde_json::Value, StageError> {
        let input: Arc<[u8]> = Arc::from(job.input_parameters());
        let mut last = None;

        for spec in &self.stages {
            if let Some(output) = progress.get(&spec.name) {
                debug!(stage = %spec.name, "Reusing checkpointed stage output");
                last = Some(output.clone());
                continue;
            }

            env.token.check()?;
            let output = self.compute(spec, job, &input, &progress, env).await?;
            env.token.check()?;

            progress
                .record(&spec.name, output.clone())
                .map_err(|e| StageError::compute(&spec.name, e.to_string()))?;
            env.checkpoints.persist(&progress).await?;
            debug!(stage = %spec.name, completed = progress.len(), "Stage checkpointed");
            last = Some(output);
        }

        last.ok_or_else(|| StageError::compute(&self.kind, "pipeline has no stages"))
    }

    async fn compute(
        &self,
        spec: &StageSpec,
        job: &Job,
        input: &Arc<[u8]>,
        progress: &Progress,
        env: RunEnv<'_>,
    ) -> Result<serde_json::Value, StageError> {
        let max_retries = spec.max_structural_retries.unwrap_or(env.max_structural_retries);
        let mut attempt = 0;

        loop {
            let ctx = StageContext::new(
                &spec.name,
                job.id(),
                &self.kind,
                input.clone(),
                progress.clone(),
                env.token.clone(),
                env.tasks.clone(),
            )
            .with_attempt(attempt);

            let output = spec.executor.execute(&ctx).await?;
            env.token.check()?;

            let mismatch = match spec.executor.check_shape(&ctx, &output) {
                Ok(()) => return Ok(output),
                Err(StageError::Cancelled) => return Err(StageError::Cancelled),
                Err(mismatch) => mismatch,
            };

            if attempt >= max_retries {
                warn!(
                    stage = %spec.name,
                    attempts = attempt + 1,
                    error = %mismatch,
                    "Accepting malformed stage output after exhausting retries"
                );
                return Ok(output);
            }

            attempt += 1;
            debug!(
                stage = %spec.name,
                attempt,
                error = %mismatch,
                "Recomputing malformed stage output"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::TaskRegistry;
    use crate::pipeline::{FnStage, PipelineBuilder, StageExecutor};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemorySink {
        writes: Mutex<Vec<Progress>>,
        vanish_after: Option<usize>,
    }

    #[async_trait]
    impl CheckpointSink for MemorySink {
        async fn persist(&self, progress: &Progress) -> Result<(), StageError> {
            let mut writes = self.writes.lock();
            if self.vanish_after == Some(writes.len()) {
                return Err(StageError::Cancelled);
            }
            writes.push(progress.clone());
            Ok(())
        }
    }

    /// Emits a list whose length grows with each attempt.
    #[derive(Debug)]
    struct GrowingStage {
        wanted: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StageExecutor for GrowingStage {
        fn name(&self) -> &str {
            "days"
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<serde_json::Value, StageError> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(serde_json::json!(vec![0; calls]))
        }

        fn check_shape(
            &self,
            _ctx: &StageContext,
            output: &serde_json::Value,
        ) -> Result<(), StageError> {
            let len = output.as_array().map_or(0, Vec::len);
            if len == self.wanted {
                Ok(())
            } else {
                let message = format!("expected {} days, got {len}", self.wanted);
                Err(StageError::structural("days", message))
            }
        }
    }

    struct Harness {
        token: Arc<CancellationToken>,
        tasks: TaskScope,
        sink: MemorySink,
        job: Job,
    }

    impl Harness {
        fn new() -> Self {
            let job = Job::new("meal_plan", b"{}".to_vec(), None);
            let token = Arc::new(CancellationToken::new());
            let tasks = TaskScope::new(Arc::new(TaskRegistry::new()), job.id(), token.clone());
            Self {
                token,
                tasks,
                sink: MemorySink::default(),
                job,
            }
        }

        fn env(&self, retries: usize) -> RunEnv<'_> {
            RunEnv {
                token: &self.token,
                tasks: &self.tasks,
                checkpoints: &self.sink,
                max_structural_retries: retries,
            }
        }
    }

    fn counting(name: &'static str, counter: Arc<AtomicUsize>) -> Arc<dyn StageExecutor> {
        Arc::new(FnStage::new(name, move |_: &StageContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(name))
        }))
    }

    #[tokio::test]
    async fn test_runs_all_stages_and_checkpoints_each() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage(counting("a", calls.clone()))
            .unwrap()
            .stage(counting("b", calls.clone()))
            .unwrap()
            .build()
            .unwrap();
        let harness = Harness::new();

        let result = pipeline.run(&harness.job, Progress::new(), harness.env(2)).await.unwrap();

        assert_eq!(result, serde_json::json!("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let writes = harness.sink.writes.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].completed_stages().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(writes[1].completed_stages().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_skips_completed_stages() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let c = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage(counting("a", a.clone()))
            .unwrap()
            .stage(counting("b", b.clone()))
            .unwrap()
            .stage(counting("c", c.clone()))
            .unwrap()
            .build()
            .unwrap();
        let mut progress = Progress::new();
        progress.record("a", serde_json::json!("cached-a")).unwrap();
        progress.record("b", serde_json::json!("cached-b")).unwrap();
        let harness = Harness::new();

        pipeline.run(&harness.job, progress, harness.env(2)).await.unwrap();

        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 0);
        assert_eq!(c.load(Ordering::SeqCst), 1);
        let writes = harness.sink.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].get("a"), Some(&serde_json::json!("cached-a")));
    }

    #[tokio::test]
    async fn test_cancel_after_stage_stops_before_next() {
        let harness = Harness::new();
        let token = harness.token.clone();
        let b = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage(Arc::new(FnStage::new("a", move |_: &StageContext| {
                token.cancel("paused");
                Ok(serde_json::json!(1))
            })))
            .unwrap()
            .stage(counting("b", b.clone()))
            .unwrap()
            .build()
            .unwrap();

        let err = pipeline.run(&harness.job, Progress::new(), harness.env(2)).await.unwrap_err();

        assert_eq!(err, StageError::Cancelled);
        assert_eq!(b.load(Ordering::SeqCst), 0);
        // The output computed before the cancel was observed is not persisted.
        assert!(harness.sink.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_structural_retry_then_success() {
        let stage = Arc::new(GrowingStage {
            wanted: 2,
            calls: AtomicUsize::new(0),
        });
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage(stage.clone())
            .unwrap()
            .build()
            .unwrap();
        let harness = Harness::new();

        let output = pipeline.run(&harness.job, Progress::new(), harness.env(2)).await.unwrap();

        assert_eq!(output, serde_json::json!([0, 0]));
        assert_eq!(stage.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_structural_retry_exhausted_accepts_best_effort() {
        let stage = Arc::new(GrowingStage {
            wanted: 10,
            calls: AtomicUsize::new(0),
        });
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage(stage.clone())
            .unwrap()
            .build()
            .unwrap();
        let harness = Harness::new();

        let output = pipeline.run(&harness.job, Progress::new(), harness.env(2)).await.unwrap();

        // One initial computation plus two retries.
        assert_eq!(stage.calls.load(Ordering::SeqCst), 3);
        assert_eq!(output, serde_json::json!([0, 0, 0]));
        assert_eq!(harness.sink.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stage_override_of_structural_retries() {
        let stage = Arc::new(GrowingStage {
            wanted: 10,
            calls: AtomicUsize::new(0),
        });
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage_spec(StageSpec::new(stage.clone()).with_max_structural_retries(0))
            .unwrap()
            .build()
            .unwrap();
        let harness = Harness::new();

        pipeline.run(&harness.job, Progress::new(), harness.env(5)).await.unwrap();
        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compute_failure_propagates() {
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage(Arc::new(FnStage::new("a", |_: &StageContext| {
                Err(StageError::compute("a", "model refused"))
            })))
            .unwrap()
            .build()
            .unwrap();
        let harness = Harness::new();

        let err = pipeline.run(&harness.job, Progress::new(), harness.env(2)).await.unwrap_err();
        assert_eq!(err, StageError::compute("a", "model refused"));
    }

    #[tokio::test]
    async fn test_vanished_record_stops_run() {
        let b = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::new("meal_plan")
            .stage(counting("a", Arc::new(AtomicUsize::new(0))))
            .unwrap()
            .stage(counting("b", b.clone()))
            .unwrap()
            .build()
            .unwrap();
        let mut harness = Harness::new();
        harness.sink.vanish_after = Some(0);

        let err = pipeline.run(&harness.job, Progress::new(), harness.env(2)).await.unwrap_err();
        assert_eq!(err, StageError::Cancelled);
        assert_eq!(b.load(Ordering::SeqCst), 0);
    }
}
