//! Event sink trait and implementations.

use super::JobEvent;
use crate::core::{JobId, JobStatus};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, Level};

/// Trait for sinks that receive job events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &JobEvent);

    /// Tries to emit an event without blocking.
    ///
    /// This method must never panic or fail the caller. Errors are logged
    /// but suppressed.
    fn try_emit(&self, event: &JobEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &JobEvent) {}

    fn try_emit(&self, _event: &JobEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &JobEvent) {
        let job_id = event.job_id();
        if self.level == Level::DEBUG {
            debug!(event_type = event.event_type(), job_id = %job_id, event = ?event, "Job event");
        } else {
            info!(event_type = event.event_type(), job_id = %job_id, event = ?event, "Job event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &JobEvent) {
        self.log_event(event);
    }
}

/// Fans events out to any number of in-process subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than blocking
/// the scheduler.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: broadcast::Sender<JobEvent>,
}

impl ChannelEventSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.try_emit(event);
    }

    fn try_emit(&self, event: &JobEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!(event_type = event.event_type(), "No event subscribers");
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<JobEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns the ids of completed jobs, in completion order.
    #[must_use]
    pub fn completed_jobs(&self) -> Vec<JobId> {
        self.events
            .read()
            .iter()
            .filter_map(|event| match event {
                JobEvent::Completed { job_id, .. } => Some(*job_id),
                JobEvent::StatusChanged { .. } => None,
            })
            .collect()
    }

    /// Returns the ids of jobs that entered `Running`, in launch order.
    #[must_use]
    pub fn launched_jobs(&self) -> Vec<JobId> {
        self.statuses_matching(JobStatus::Running)
    }

    /// Returns the ids of jobs that changed to `status`, in order.
    #[must_use]
    pub fn statuses_matching(&self, status: JobStatus) -> Vec<JobId> {
        self.events
            .read()
            .iter()
            .filter_map(|event| match event {
                JobEvent::StatusChanged { job_id, status: s } if *s == status => Some(*job_id),
                _ => None,
            })
            .collect()
    }

    /// Returns every status reported for `job_id`, in order.
    #[must_use]
    pub fn status_history(&self, job_id: JobId) -> Vec<JobStatus> {
        self.events
            .read()
            .iter()
            .filter_map(|event| match event {
                JobEvent::StatusChanged { job_id: id, status } if *id == job_id => Some(*status),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &JobEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        let event = JobEvent::status_changed(JobId::new(), JobStatus::Pending);
        NoOpEventSink.emit(&event).await;
        NoOpEventSink.try_emit(&event);
        LoggingEventSink::default().emit(&event).await;
        LoggingEventSink::debug().try_emit(&event);
    }

    #[tokio::test]
    async fn test_collecting_sink_queries() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        let a = JobId::new();
        let b = JobId::new();
        sink.emit(&JobEvent::status_changed(a, JobStatus::Running)).await;
        sink.try_emit(&JobEvent::status_changed(a, JobStatus::Completed));
        sink.try_emit(&JobEvent::completed(a, "meal_plan"));
        sink.try_emit(&JobEvent::status_changed(b, JobStatus::Running));

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.launched_jobs(), vec![a, b]);
        assert_eq!(sink.completed_jobs(), vec![a]);
        assert_eq!(
            sink.status_history(a),
            vec![JobStatus::Running, JobStatus::Completed]
        );

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_to_subscribers() {
        let sink = ChannelEventSink::new(8);
        let mut rx = sink.subscribe();
        let id = JobId::new();

        sink.try_emit(&JobEvent::completed(id, "meal_plan"));
        assert_eq!(rx.recv().await.unwrap(), JobEvent::completed(id, "meal_plan"));
    }

    #[test]
    fn test_channel_sink_without_subscribers_does_not_fail() {
        let sink = ChannelEventSink::default();
        sink.try_emit(&JobEvent::status_changed(JobId::new(), JobStatus::Failed));
    }
}
