//! The opaque generation service consumed by stage executors.
//!
//! Prompt construction, schema binding and the model call itself live
//! behind [`GenerationService`]. Stage executors own their retry policy and
//! usually go through [`invoke_with_retry`], which also makes every call a
//! cancellation point.

mod retry;
mod stage;

pub use retry::{invoke_with_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
pub use stage::{GenerationStage, ShapeCheck};

use crate::errors::GenerationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Input for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The stage issuing the call.
    pub stage: String,
    /// Stage-specific request payload.
    pub payload: serde_json::Value,
}

impl GenerationRequest {
    /// Creates a new request.
    #[must_use]
    pub fn new(stage: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            stage: stage.into(),
            payload,
        }
    }
}

/// Turns a stage input into a stage output, or fails.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Performs one generation call.
    async fn invoke(
        &self,
        request: &GenerationRequest,
    ) -> Result<serde_json::Value, GenerationError>;
}
