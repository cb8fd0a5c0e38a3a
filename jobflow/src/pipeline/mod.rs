//! Checkpointed pipeline execution.
//!
//! This module provides:
//! - The `StageExecutor` trait and the context stages run in
//! - `PipelineBuilder` for validated, ordered stage lists per job kind
//! - `CheckpointedPipeline`, which skips stages already in the progress
//!   record and checkpoints each newly completed one
//! - `JobDriver`, which turns a run into its persisted outcome
//! - Fan-out sub-resolution with sequential creation of unresolved items

mod builder;
mod checkpointed;
mod driver;
mod fanout;
mod registry;
mod spec;
mod stage;

pub use builder::PipelineBuilder;
pub use checkpointed::{CheckpointSink, CheckpointedPipeline, RunEnv};
pub use driver::{JobDriver, RunExit};
pub use fanout::{resolve_all, FanOutOutcome, ItemResolver};
pub use registry::PipelineRegistry;
pub use spec::StageSpec;
pub use stage::{FnStage, StageContext, StageExecutor};
