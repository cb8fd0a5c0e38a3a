//! Job scheduling.
//!
//! [`JobScheduler`] owns the run queue and the single execution slot. The
//! slot is a map of at most one [`RunningHandle`](handle::RunningHandle);
//! its presence is what makes a job "currently executing".

mod config;
mod handle;
mod job_scheduler;


pub use config::SchedulerConfig;
pub use job_scheduler::{JobScheduler, SchedulerBuilder};
