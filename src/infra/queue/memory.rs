//! In-memory queue and snapshot store.

use parking_lot::Mutex;

use crate::core::{QueueSnapshot, QueueStore, SchedulerError, Task, TaskQueue};
use crate::util::TaskId;

/// Queue kept as a vector sorted by priority tier, then submission order.
///
/// Insertion is a binary search plus shift; removal by id is a linear scan.
/// Scans in scheduling order are a plain slice walk.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    tasks: Vec<Task>,
}

impl InMemoryQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for InMemoryQueue {
    fn enqueue(&mut self, task: Task) {
        let key = task.order_key();
        let at = self.tasks.partition_point(|queued| queued.order_key() <= key);
        self.tasks.insert(at, task);
    }

    fn remove(&mut self, id: TaskId) -> Option<Task> {
        let at = self.tasks.iter().position(|t| t.id == id)?;
        Some(self.tasks.remove(at))
    }

    fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

/// Snapshot store that keeps the last snapshot in memory.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    last: Mutex<Option<QueueSnapshot>>,
    writes: Mutex<u64>,
}

impl InMemoryQueueStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots written so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        *self.writes.lock()
    }
}

impl QueueStore for InMemoryQueueStore {
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), SchedulerError> {
        *self.last.lock() = Some(snapshot.clone());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<QueueSnapshot>, SchedulerError> {
        Ok(self.last.lock().clone())
    }
}
