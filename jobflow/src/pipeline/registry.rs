//! Pipelines registered per job kind.

use super::CheckpointedPipeline;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Maps a job kind to the pipeline that runs it.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<CheckpointedPipeline>>,
}

impl PipelineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline under its kind, replacing any previous one.
    pub fn register(&mut self, pipeline: CheckpointedPipeline) {
        let kind = pipeline.kind().to_string();
        if self.pipelines.insert(kind.clone(), Arc::new(pipeline)).is_some() {
            warn!(kind = %kind, "Replaced previously registered pipeline");
        }
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(mut self, pipeline: CheckpointedPipeline) -> Self {
        self.register(pipeline);
        self
    }

    /// Returns the pipeline for `kind`.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<CheckpointedPipeline>> {
        self.pipelines.get(kind).cloned()
    }

    /// Returns true if `kind` has a pipeline.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.pipelines.contains_key(kind)
    }

    /// Returns the registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Returns the number of registered pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
