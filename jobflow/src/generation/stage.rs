//! A stage executor backed by the generation service.

use super::{invoke_with_retry, GenerationRequest, GenerationService, RetryConfig};
use crate::errors::StageError;
use crate::pipeline::{StageContext, StageExecutor};
use async_trait::async_trait;
use std::sync::Arc;

/// Validates the shape of a generated output.
pub type ShapeCheck = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

/// Sends the job input and every prior stage output to the generation
/// service and returns its answer as the stage output.
///
/// The request payload is `{"input": <job input>, "prior": {<stage>: <output>}}`.
#[derive(Clone)]
pub struct GenerationStage {
    name: String,
    service: Arc<dyn GenerationService>,
    retry: RetryConfig,
    shape: Option<ShapeCheck>,
}

impl std::fmt::Debug for GenerationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStage")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("has_shape_check", &self.shape.is_some())
            .finish_non_exhaustive()
    }
}

impl GenerationStage {
    /// Creates a generation stage.
    #[must_use]
    pub fn new(name: impl Into<String>, service: Arc<dyn GenerationService>) -> Self {
        Self {
            name: name.into(),
            service,
            retry: RetryConfig::default(),
            shape: None,
        }
    }

    /// Sets the retry policy for service calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the shape check applied to every output.
    #[must_use]
    pub fn with_shape_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.shape = Some(Arc::new(check));
        self
    }

    fn payload(ctx: &StageContext) -> serde_json::Value {
        let input = serde_json::from_slice::<serde_json::Value>(ctx.input_bytes())
            .unwrap_or(serde_json::Value::Null);
        let prior: serde_json::Map<String, serde_json::Value> = ctx
            .progress()
            .completed_stages()
            .filter_map(|stage| {
                ctx.progress()
                    .get(stage)
                    .map(|output| (stage.to_string(), output.clone()))
            })
            .collect();
        serde_json::json!({ "input": input, "prior": prior })
    }
}

#[async_trait]
impl StageExecutor for GenerationStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        let request = GenerationRequest::new(&self.name, Self::payload(ctx));
        invoke_with_retry(self.service.as_ref(), &request, &self.retry, ctx.token()).await
    }

    fn check_shape(
        &self,
        _ctx: &StageContext,
        output: &serde_json::Value,
    ) -> Result<(), StageError> {
        match &self.shape {
            Some(check) => {
                check(output).map_err(|message| StageError::structural(&self.name, message))
            }
            None => Ok(()),
        }
    }
}
