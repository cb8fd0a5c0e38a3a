//! Stage specifications.

use super::StageExecutor;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use std::sync::Arc;

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub executor: Arc<dyn StageExecutor>,
    /// Recomputations allowed after a failed shape check. `None` uses the
    /// scheduler default.
    pub max_structural_retries: Option<usize>,
}

impl StageSpec {
    /// Creates a stage specification named after its executor.
    #[must_use]
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        Self {
            name: executor.name().to_string(),
            executor,
            max_structural_retries: None,
        }
    }

    /// Overrides the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the structural retry bound for this stage.
    #[must_use]
    pub fn with_max_structural_retries(mut self, retries: usize) -> Self {
        self.max_structural_retries = Some(retries);
        self
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage name is blank.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be blank")
                .with_stages(vec![self.name.clone()])
                .with_error_info(
                    ContractErrorInfo::new("PIPELINE-BLANK-STAGE", "Stage has no name")
                        .with_fix_hint(
                            "Give every stage a non-empty name; it keys the stored progress.",
                        ),
                ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FnStage, StageContext};

    fn stage(name: &str) -> Arc<dyn StageExecutor> {
        Arc::new(FnStage::new(name, |_: &StageContext| Ok(serde_json::Value::Null)))
    }

    #[test]
    fn test_spec_takes_executor_name() {
        let spec = StageSpec::new(stage("outline")).with_max_structural_retries(4);
        assert_eq!(spec.name, "outline");
        assert_eq!(spec.max_structural_retries, Some(4));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_blank_name_rejected() {
        let err = StageSpec::new(stage("x")).with_name("  ").validate().unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-BLANK-STAGE"));
    }
}
