//! Core domain model types for jobflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Job and owner identifiers
//! - The job status state machine
//! - The persisted job record
//! - The per-run progress checkpoint

mod ids;
mod job;
mod progress;
mod status;

pub use ids::{JobId, OwnerId};
pub use job::Job;
pub use progress::{Progress, StageRecord, PROGRESS_SCHEMA};
pub use status::JobStatus;
