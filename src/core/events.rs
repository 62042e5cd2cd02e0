//! Lifecycle callback points.
//!
//! The worker pool reports task and pool transitions to an [`EventSink`].
//! This is where a notification fan-out (for example a websocket broadcaster)
//! attaches; the scheduler itself defines no wire format.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::metadata::{PoolId, TaskId, TaskResult};
use crate::util::clock::now_ms;

/// Transition being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task was placed on the queue or the retry buffer.
    TaskQueued,
    /// A worker began executing a task.
    TaskStarted,
    /// A task exited; the payload is its final report.
    TaskComplete,
    /// The reaper expired a task's deadline.
    TaskTimedOut,
    /// A pool reached completion and was removed from the live index.
    PoolComplete,
    /// A pool was cancelled.
    PoolCancelled,
}

/// One reported transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened.
    pub kind: EventKind,
    /// Task involved, if any.
    pub task_id: Option<TaskId>,
    /// Job name of the task involved, if any.
    pub job_name: Option<String>,
    /// Pool involved.
    pub pool_id: PoolId,
    /// Timestamp in milliseconds since the Unix epoch.
    pub created_at_ms: u128,
    /// Result snapshot for task events.
    pub payload: Option<TaskResult>,
}

/// Receiver of lifecycle events.
///
/// Called synchronously from worker, reaper, and dispatching threads, so
/// implementations should hand the event off quickly.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: LifecycleEvent);
}

/// Bounded in-memory sink for tests and local inspection.
///
/// Keeps the most recent `max_events` events.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<LifecycleEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events of one kind, oldest first.
    #[must_use]
    pub fn events_of(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }
}

impl fmt::Debug for InMemoryEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventSink")
            .field("len", &self.events.lock().len())
            .field("max_events", &self.max_events)
            .finish()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: LifecycleEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build a lifecycle event stamped with the current time.
pub fn build_event(
    kind: EventKind,
    pool_id: impl Into<PoolId>,
    task: Option<(&str, &str)>,
    payload: Option<TaskResult>,
) -> LifecycleEvent {
    LifecycleEvent {
        kind,
        task_id: task.map(|(id, _)| id.to_string()),
        job_name: task.map(|(_, job)| job.to_string()),
        pool_id: pool_id.into(),
        created_at_ms: now_ms(),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryEventSink::new(2);
        for i in 0..3 {
            let id = format!("t{i}");
            sink.record(build_event(
                EventKind::TaskQueued,
                "GLOBAL",
                Some((id.as_str(), "echo")),
                None,
            ));
        }

        let ids: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| e.task_id)
            .collect();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn test_events_of_filters_by_kind() {
        let sink = InMemoryEventSink::new(8);
        sink.record(build_event(EventKind::PoolComplete, "p1", None, None));
        sink.record(build_event(EventKind::PoolCancelled, "p2", None, None));

        let complete = sink.events_of(EventKind::PoolComplete);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].pool_id, "p1");
        assert!(complete[0].task_id.is_none());
    }

    #[test]
    fn test_event_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::TaskTimedOut).unwrap();
        assert_eq!(json, "\"task_timed_out\"");
    }
}
