//! Queue and snapshot abstractions shared by the scheduler and its backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{SchedulerError, Task};
use crate::util::TaskId;

/// Abstraction for pending-task queue backends.
///
/// Implementations keep tasks ordered by [`Task::order_key`]: priority tier
/// first, submission order within a tier.
pub trait TaskQueue: Send {
    /// Insert a task at its ordered position.
    fn enqueue(&mut self, task: Task);
    /// Remove a task by id, wherever it sits.
    fn remove(&mut self, id: TaskId) -> Option<Task>;
    /// Queued tasks in scheduling order.
    fn tasks(&self) -> &[Task];
    /// Current depth.
    fn len(&self) -> usize {
        self.tasks().len()
    }
    /// Whether nothing is queued.
    fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }
    /// Whether a task with this id is queued.
    fn contains(&self, id: TaskId) -> bool {
        self.tasks().iter().any(|t| t.id == id)
    }
}

/// Durable view of the scheduler queue, written after every queue mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Tasks not yet finished, in scheduling order. Tasks that were running
    /// when the snapshot was taken are recorded as queued.
    pub pending_tasks: Vec<Task>,
    /// Number of tasks completed so far.
    pub completed_count: u64,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
}

/// Persistence for queue snapshots.
pub trait QueueStore: Send + Sync {
    /// Replace the stored snapshot.
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), SchedulerError>;
    /// Last stored snapshot, if any.
    fn load(&self) -> Result<Option<QueueSnapshot>, SchedulerError>;
}
