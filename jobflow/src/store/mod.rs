//! Durable job storage.
//!
//! The scheduler treats the store as the only shared mutable resource and
//! assumes it serializes concurrent writes to the same record.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::InMemoryJobStore;

use crate::core::{Job, JobId};
use crate::errors::StoreError;
use async_trait::async_trait;

/// Persistence backend for job records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetches one job.
    async fn fetch_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Fetches every job ordered by `created_at` ascending.
    ///
    /// Ties keep an order that is stable within one call.
    async fn fetch_all_sorted_by_creation(&self) -> Result<Vec<Job>, StoreError>;

    /// Inserts or replaces a job.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Removes a job. Returns false if it did not exist.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;
}
