//! Job status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the FIFO queue.
    #[default]
    Pending,
    /// Owned by the scheduler's single run slot (or orphaned by a crash).
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with a failure reason.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    ///
    /// `Pending -> Pending` is legal: a pause rewrites the queue position of
    /// a job that never started.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending | Self::Running)
                | (Self::Running, Self::Pending | Self::Completed | Self::Failed)
        )
    }
}
