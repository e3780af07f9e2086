//! Error types for scheduler operations and task handlers.

use thiserror::Error;

use crate::util::{TaskId, TaskKind};

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Durable state could not be written or read. Fatal to the run loop.
    #[error("persistence failure: {0}")]
    Persistence(String),
    /// No task with this id is known to the scheduler.
    #[error("unknown task {0}")]
    TaskNotFound(TaskId),
    /// A task state change that the lifecycle does not allow.
    #[error("task {task}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Task being mutated.
        task: TaskId,
        /// State before the attempted change.
        from: String,
        /// Requested state.
        to: String,
    },
    /// The scheduler dropped the task outcome before delivering it.
    #[error("scheduler stopped before task {0} finished")]
    Stopped(TaskId),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Typed failure raised by a task handler. Always absorbed into the task's
/// `Failed` state; never crosses the scheduler boundary.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran and reported a failure.
    #[error("{0}")]
    Failed(String),
    /// The handler exceeded the per-task timeout.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// No handler is registered for the task kind.
    #[error("no handler registered for kind `{0}`")]
    NoHandler(TaskKind),
    /// Filesystem failure while producing the artifact.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    /// Convenience constructor for a plain failure message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
