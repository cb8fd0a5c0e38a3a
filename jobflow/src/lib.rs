//! # Jobflow
//!
//! Background orchestration for long-running, multi-stage generation jobs.
//!
//! Jobflow runs one job at a time from a durable FIFO queue and drives it
//! through a pipeline of stages, persisting each stage output as it
//! completes. It provides:
//!
//! - **Single-slot scheduling**: submit, prioritize, pause and delete jobs
//!   with at most one running at any moment
//! - **Checkpointed pipelines**: interrupted runs resume from the first
//!   stage without a stored output
//! - **Structural retry**: malformed stage outputs are recomputed a bounded
//!   number of times, then accepted
//! - **Two-tier cancellation**: a cooperative token per run plus a registry
//!   that force-aborts fan-out sub-tasks
//! - **Events**: status changes and completions through an [`EventSink`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jobflow::prelude::*;
//!
//! let pipeline = PipelineBuilder::new("meal_plan")
//!     .stage(Arc::new(GenerationStage::new("outline", service.clone())))?
//!     .stage(Arc::new(GenerationStage::new("recipes", service)))?
//!     .build()?;
//!
//! let scheduler = JobScheduler::builder(Arc::new(JsonFileStore::open("data/jobs").await?))
//!     .pipeline(pipeline)
//!     .event_sink(Arc::new(LoggingEventSink::new(tracing::Level::INFO)))
//!     .build();
//!
//! scheduler.start().await?;
//! let id = scheduler.submit_json("meal_plan", &request, None).await?;
//! ```
//!
//! [`EventSink`]: events::EventSink

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod core;
pub mod errors;
pub mod events;
pub mod generation;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod utils;

pub use crate::core::{Job, JobId, JobStatus, OwnerId, Progress};
pub use crate::errors::{JobflowError, StageError, StoreError};
pub use crate::scheduler::{JobScheduler, SchedulerConfig};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, TaskRegistry, TaskScope};
    pub use crate::core::{Job, JobId, JobStatus, OwnerId, Progress};
    pub use crate::errors::{
        GenerationError, JobflowError, PipelineValidationError, ProgressError, StageError,
        StoreError,
    };
    pub use crate::events::{
        CollectingEventSink, EventSink, JobEvent, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::generation::{
        GenerationRequest, GenerationService, GenerationStage, RetryConfig,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        resolve_all, CheckpointedPipeline, FnStage, ItemResolver, PipelineBuilder,
        PipelineRegistry, StageContext, StageExecutor, StageSpec,
    };
    pub use crate::scheduler::{JobScheduler, SchedulerBuilder, SchedulerConfig};
    pub use crate::store::{DurableStore, InMemoryJobStore, JsonFileStore};
    pub use std::sync::Arc;
}
