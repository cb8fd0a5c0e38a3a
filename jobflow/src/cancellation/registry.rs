//! Registry of detached fan-out sub-tasks.
//!
//! Cooperative cancellation only reaches code that checks the run's token.
//! Sub-tasks spawned by a stage run detached from that call chain, so each
//! one is registered here under its job id and can be aborted in one sweep
//! when the job is force-stopped.

use super::CancellationToken;
use crate::core::JobId;
use crate::errors::StageError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// Tracks the abort handles of every live sub-task, grouped by job.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    /// `None` marks a slot reserved for a task that is being spawned.
    tasks: DashMap<JobId, HashMap<u64, Option<AbortHandle>>>,
    next_key: AtomicU64,
}

impl TaskRegistry {
    /// Creates a new registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `future` as a sub-task of `job_id`.
    ///
    /// The task removes its own entry when it finishes or is aborted.
    pub fn spawn<F>(self: &Arc<Self>, job_id: JobId, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.tasks.entry(job_id).or_default().insert(key, None);

        let guard = Deregister {
            registry: Arc::clone(self),
            job_id,
            key,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await
        });

        let filled = match self.tasks.get_mut(&job_id) {
            Some(mut slots) => match slots.get_mut(&key) {
                Some(slot) => {
                    *slot = Some(handle.abort_handle());
                    true
                }
                None => false,
            },
            None => false,
        };
        if !filled {
            // Either the task already finished or the job was swept while it
            // was being spawned; aborting a finished task is a no-op.
            handle.abort();
        }
        handle
    }

    /// Aborts every registered sub-task of `job_id` and forgets them.
    ///
    /// Returns the number of tasks that were aborted.
    pub fn cancel_all(&self, job_id: JobId) -> usize {
        let Some((_, slots)) = self.tasks.remove(&job_id) else {
            return 0;
        };
        let count = slots.len();
        for handle in slots.into_values().flatten() {
            handle.abort();
        }
        if count > 0 {
            debug!(job_id = %job_id, aborted = count, "Force-cancelled sub-tasks");
        }
        count
    }

    /// Returns the number of live sub-tasks of `job_id`.
    #[must_use]
    pub fn active_count(&self, job_id: JobId) -> usize {
        self.tasks.get(&job_id).map_or(0, |slots| slots.len())
    }

    /// Returns the number of live sub-tasks across all jobs.
    #[must_use]
    pub fn total_active(&self) -> usize {
        self.tasks.iter().map(|entry| entry.value().len()).sum()
    }

    fn deregister(&self, job_id: JobId, key: u64) {
        let now_empty = match self.tasks.get_mut(&job_id) {
            Some(mut slots) => {
                slots.remove(&key);
                slots.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.tasks.remove_if(&job_id, |_, slots| slots.is_empty());
        }
    }
}

struct Deregister {
    registry: Arc<TaskRegistry>,
    job_id: JobId,
    key: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.deregister(self.job_id, self.key);
    }
}

/// A job-bound view of the registry handed to stage executors.
#[derive(Debug, Clone)]
pub struct TaskScope {
    registry: Arc<TaskRegistry>,
    job_id: JobId,
    token: Arc<CancellationToken>,
}

impl TaskScope {
    /// Creates a scope for one job run.
    #[must_use]
    pub fn new(registry: Arc<TaskRegistry>, job_id: JobId, token: Arc<CancellationToken>) -> Self {
        Self {
            registry,
            job_id,
            token,
        }
    }

    /// Returns the job this scope belongs to.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Spawns a registered sub-task, unless the run is already cancelled.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, StageError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.token.check()?;
        Ok(self.registry.spawn(self.job_id, future))
    }

    /// Returns the number of live sub-tasks of this job.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registry.active_count(self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_finished_task_deregisters() {
        let registry = Arc::new(TaskRegistry::new());
        let job = JobId::new();

        let handle = registry.spawn(job, async { 7 });
        assert_eq!(handle.await.unwrap(), 7);

        tokio::task::yield_now().await;
        assert_eq!(registry.active_count(job), 0);
        assert_eq!(registry.total_active(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_only_that_job() {
        let registry = Arc::new(TaskRegistry::new());
        let job_a = JobId::new();
        let job_b = JobId::new();

        let a1 = registry.spawn(job_a, tokio::time::sleep(Duration::from_secs(60)));
        let a2 = registry.spawn(job_a, tokio::time::sleep(Duration::from_secs(60)));
        let b1 = registry.spawn(job_b, tokio::time::sleep(Duration::from_secs(60)));

        assert_eq!(registry.active_count(job_a), 2);
        assert_eq!(registry.cancel_all(job_a), 2);
        assert_eq!(registry.active_count(job_a), 0);

        assert!(a1.await.unwrap_err().is_cancelled());
        assert!(a2.await.unwrap_err().is_cancelled());
        assert_eq!(registry.active_count(job_b), 1);

        registry.cancel_all(job_b);
        assert!(b1.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_all_on_unknown_job() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.cancel_all(JobId::new()), 0);
    }

    #[tokio::test]
    async fn test_scope_refuses_spawn_after_cancel() {
        let registry = Arc::new(TaskRegistry::new());
        let token = Arc::new(CancellationToken::new());
        let scope = TaskScope::new(registry.clone(), JobId::new(), token.clone());

        let ok = scope.spawn(async { 1 }).unwrap();
        assert_eq!(ok.await.unwrap(), 1);

        token.cancel("stop");
        assert!(matches!(scope.spawn(async { 2 }), Err(StageError::Cancelled)));
        assert_eq!(scope.active_count(), 0);
    }
}
