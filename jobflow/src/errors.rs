//! Error types for the jobflow scheduler.
//!
//! The taxonomy separates what callers see (`JobflowError`) from what
//! stays inside a pipeline run (`StageError`). Cancellation only exists in
//! the latter: the driver swallows it, so it never reaches the scheduler
//! as an error and is never written to a job's failure reason.

use crate::core::{JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for scheduler operations.
#[derive(Debug, Error)]
pub enum JobflowError {
    /// The job id is unknown to the store.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The requested operation is not legal in the job's current status.
    #[error("Cannot {operation} job {id} while it is {status}")]
    InvalidState {
        /// The job id.
        id: JobId,
        /// The status the job was in.
        status: JobStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The durable store rejected a read or write.
    #[error("{0}")]
    Persistence(#[from] StoreError),

    /// A pipeline definition is malformed.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobflowError {
    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(id: JobId, status: JobStatus, operation: &'static str) -> Self {
        Self::InvalidState {
            id,
            status,
            operation,
        }
    }
}

/// Errors raised by a stage executor while computing its output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// The run was cancelled at a suspension point.
    #[error("Stage cancelled")]
    Cancelled,

    /// The generation service or domain validation failed unrecoverably.
    #[error("Stage '{stage}' failed: {message}")]
    Compute {
        /// The stage name.
        stage: String,
        /// The failure message.
        message: String,
    },

    /// The stage output did not have its required shape.
    #[error("Stage '{stage}' produced a malformed output: {message}")]
    StructuralMismatch {
        /// The stage name.
        stage: String,
        /// What was wrong with the output.
        message: String,
    },
}

impl StageError {
    /// Creates a compute failure.
    #[must_use]
    pub fn compute(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compute {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates a structural mismatch.
    #[must_use]
    pub fn structural(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StructuralMismatch {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Returns true if this is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors raised by a `DurableStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised while encoding, decoding or appending to a progress record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProgressError {
    /// The checkpoint bytes could not be decoded.
    #[error("Invalid progress checkpoint: {0}")]
    Decode(String),

    /// The checkpoint uses a schema this build does not understand.
    #[error("Unsupported progress schema: {0}")]
    UnsupportedSchema(String),

    /// A stage output could not be encoded.
    #[error("Could not encode output of stage '{stage}': {message}")]
    Encode {
        /// The stage name.
        stage: String,
        /// The encoder message.
        message: String,
    },

    /// A stage output was already recorded for this run.
    #[error("{0}")]
    Conflict(#[from] OutputConflictError),
}

/// Error returned by a generation service call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Generation failed: {message}")]
pub struct GenerationError {
    /// The failure message.
    pub message: String,
    /// Whether a retry may succeed.
    pub retryable: bool,
}

impl GenerationError {
    /// Creates a permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-DUPLICATE-STAGE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a pipeline definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a stage output is written twice within one run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Output conflict for stage '{stage}': {message}")]
pub struct OutputConflictError {
    /// The stage name.
    pub stage: String,
    /// Additional message.
    pub message: String,
}

impl OutputConflictError {
    /// Creates a new output conflict error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_pipeline_validation_error_code() {
        let err = PipelineValidationError::new("Duplicate stage")
            .with_stages(vec!["a".to_string()])
            .with_error_info(ContractErrorInfo::new("PIPELINE-DUPLICATE-STAGE", "dup"));

        assert_eq!(err.code(), Some("PIPELINE-DUPLICATE-STAGE"));
        assert_eq!(err.to_string(), "Duplicate stage");
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::compute("plan", "model refused");
        assert_eq!(err.to_string(), "Stage 'plan' failed: model refused");
        assert!(!err.is_cancelled());
        assert!(StageError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_invalid_state_display() {
        let id = JobId::new();
        let err = JobflowError::invalid_state(id, JobStatus::Completed, "pause");
        assert_eq!(
            err.to_string(),
            format!("Cannot pause job {id} while it is completed")
        );
    }

    #[test]
    fn test_store_error_from_serde() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let store_err: StoreError = err.into();
        assert!(matches!(store_err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_generation_error_constructors() {
        assert!(GenerationError::transient("rate limited").retryable);
        assert!(!GenerationError::permanent("bad schema").retryable);
    }
}
