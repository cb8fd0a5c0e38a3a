//! Two-tier cancellation for job runs.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation checked at suspension points
//! - TaskRegistry for force-cancelling detached fan-out sub-tasks
//! - TaskScope, the job-bound registry view handed to stage executors

mod registry;
mod token;

pub use registry::{TaskRegistry, TaskScope};
pub use token::CancellationToken;
