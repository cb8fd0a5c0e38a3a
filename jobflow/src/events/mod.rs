//! Job lifecycle events.
//!
//! The scheduler reports what happened to jobs through an [`EventSink`].
//! Delivery is fire-and-forget: sinks never fail the operation that emitted
//! the event, and nothing is retried.

mod sink;

pub use sink::{ChannelEventSink, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::{JobId, JobStatus};
use serde::{Deserialize, Serialize};

/// An event emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job's persisted status changed (or it was re-queued in place).
    StatusChanged {
        /// The job id.
        job_id: JobId,
        /// The status after the change.
        status: JobStatus,
    },
    /// A job finished successfully.
    Completed {
        /// The job id.
        job_id: JobId,
        /// The job kind, so consumers can route the notification.
        job_kind: String,
    },
}

impl JobEvent {
    /// Creates a status change event.
    #[must_use]
    pub fn status_changed(job_id: JobId, status: JobStatus) -> Self {
        Self::StatusChanged { job_id, status }
    }

    /// Creates a completion event.
    #[must_use]
    pub fn completed(job_id: JobId, job_kind: impl Into<String>) -> Self {
        Self::Completed {
            job_id,
            job_kind: job_kind.into(),
        }
    }

    /// Returns the dotted event type name.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "job.status_changed",
            Self::Completed { .. } => "job.completed",
        }
    }

    /// Returns the job the event is about.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        match self {
            Self::StatusChanged { job_id, .. } | Self::Completed { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let id = JobId::new();
        assert_eq!(
            JobEvent::status_changed(id, JobStatus::Running).event_type(),
            "job.status_changed"
        );
        assert_eq!(JobEvent::completed(id, "meal_plan").event_type(), "job.completed");
    }

    #[test]
    fn test_event_serialization() {
        let id = JobId::new();
        let json = serde_json::to_value(JobEvent::completed(id, "workout_plan")).unwrap();
        assert_eq!(json["type"], "completed");
        assert_eq!(json["job_kind"], "workout_plan");
        assert_eq!(json["job_id"], id.to_string());
    }
}
