//! Task lifecycle audit trail.
//!
//! The scheduler records one event per lifecycle edge (submit, start,
//! complete, fail, cancel). Status reporting reads the in-memory sink.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::now_ms;
use crate::util::{TaskId, TaskKind};

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related task.
    pub task_id: TaskId,
    /// Kind of the related task.
    pub kind: TaskKind,
    /// Action taken (submit, start, complete, fail, cancel).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context, such as a failure reason.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// Bounded in-memory audit sink. Clones share the same buffer, so a test or
/// a status endpoint can keep a handle after boxing one into the scheduler.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events: max_events.max(1),
        }
    }

    /// Retrieve a snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events recorded for one task, oldest first.
    #[must_use]
    pub fn events_for(&self, task_id: TaskId) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    task_id: TaskId,
    kind: TaskKind,
    action: impl Into<String>,
    detail: Option<String>,
) -> AuditEvent {
    let action = action.into();
    let created_at_ms = now_ms();
    AuditEvent {
        event_id: format!("{task_id}-{action}-{created_at_ms}"),
        task_id,
        kind,
        action,
        created_at_ms,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_bounded_and_shared() {
        let sink = InMemoryAuditSink::new(2);
        let mut boxed: Box<dyn AuditSink> = Box::new(sink.clone());
        let id = TaskId::new();
        for action in ["submit", "start", "complete"] {
            boxed.record(build_audit_event(id, TaskKind::Mastering, action, None));
        }
        let actions: Vec<_> = sink.events().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["start", "complete"]);
        assert_eq!(sink.events_for(id).len(), 2);
        assert!(sink.events_for(TaskId::new()).is_empty());
    }
}
