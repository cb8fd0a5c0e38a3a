//! In-memory handle of the executing job.

use crate::cancellation::CancellationToken;
use crate::core::JobId;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Cancellable execution handle of the one running job. Never persisted.
#[derive(Debug)]
pub(crate) struct RunningHandle {
    pub(crate) job_id: JobId,
    /// Distinguishes successive runs of the same job.
    pub(crate) run_id: u64,
    pub(crate) token: Arc<CancellationToken>,
    /// Taken by the operation that stops the run.
    pub(crate) join: Option<JoinHandle<()>>,
    /// Set once an operation has begun stopping the run; that operation
    /// then releases the slot.
    stopping: bool,
}

impl RunningHandle {
    pub(crate) fn new(
        job_id: JobId,
        run_id: u64,
        token: Arc<CancellationToken>,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            job_id,
            run_id,
            token,
            join: Some(join),
            stopping: false,
        }
    }

    /// Returns true if an operation has taken over stopping this run.
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Cancels the run and takes its join handle, if nobody else has.
    pub(crate) fn begin_stop(&mut self, reason: &str) -> Option<JoinHandle<()>> {
        self.stopping = true;
        self.token.cancel(reason);
        self.join.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_stop_cancels_once() {
        let token = Arc::new(CancellationToken::new());
        let join = tokio::spawn(async {});
        let mut handle = RunningHandle::new(JobId::new(), 7, token.clone(), join);
        assert!(!handle.is_stopping());

        assert!(handle.begin_stop("paused").is_some());
        assert!(handle.is_stopping());
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("paused"));
        assert!(handle.begin_stop("deleted").is_none());
        assert_eq!(token.reason().as_deref(), Some("paused"));
        assert_eq!(handle.run_id, 7);
    }

    #[tokio::test]
    async fn test_token_cancelled_elsewhere_is_not_a_stop() {
        let token = Arc::new(CancellationToken::new());
        let join = tokio::spawn(async {});
        let handle = RunningHandle::new(JobId::new(), 1, token.clone(), join);

        token.cancel("stage gave up");
        assert!(!handle.is_stopping());
    }
}
