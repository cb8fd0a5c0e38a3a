//! Pipeline builder with validation.

use super::{CheckpointedPipeline, StageExecutor, StageSpec};
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated checkpointed pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The job kind this pipeline serves.
    kind: String,
    /// The stage specifications, in execution order.
    stages: Vec<StageSpec>,
    /// Names already in use.
    names: HashSet<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder for a job kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            stages: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage name is blank or already used.
    pub fn stage(self, executor: Arc<dyn StageExecutor>) -> Result<Self, PipelineValidationError> {
        self.stage_spec(StageSpec::new(executor))
    }

    /// Appends a stage with a full specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage name is blank or already used.
    pub fn stage_spec(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        spec.validate()?;

        if self.names.contains(&spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is defined twice in pipeline '{}'",
                spec.name, self.kind
            ))
            .with_stages(vec![spec.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(
                    "PIPELINE-DUPLICATE-STAGE",
                    format!("Duplicate stage '{}'", spec.name),
                )
                .with_fix_hint("Stage names key the stored progress and must be unique.")
                .with_context_entry("kind", &self.kind),
            ));
        }

        self.names.insert(spec.name.clone());
        self.stages.push(spec);
        Ok(self)
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is blank or there are no stages.
    pub fn build(self) -> Result<CheckpointedPipeline, PipelineValidationError> {
        if self.kind.trim().is_empty() {
            return Err(PipelineValidationError::new("Pipeline kind cannot be blank")
                .with_error_info(
                    ContractErrorInfo::new("PIPELINE-BLANK-KIND", "Pipeline has no job kind")
                        .with_fix_hint(
                            "Pass the job kind this pipeline serves to PipelineBuilder::new.",
                        ),
                ));
        }
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has no stages",
                self.kind
            ))
            .with_error_info(
                ContractErrorInfo::new("PIPELINE-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline before building."),
            ));
        }

        Ok(CheckpointedPipeline::new(self.kind, self.stages))
    }

    /// Returns the job kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}
