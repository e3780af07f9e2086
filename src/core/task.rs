//! Task model and its lifecycle.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;
use crate::util::{Priority, TaskId, TaskKind};

/// Default duration estimate when the submitter gives none.
pub const DEFAULT_ESTIMATE_MINUTES: f64 = 30.0;

/// Lifecycle state shared by tasks and job steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet in a queue.
    #[default]
    Pending,
    /// Waiting in the scheduler queue.
    Queued,
    /// Executing on the device.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Removed from the queue before it started.
    Cancelled,
}

impl TaskState {
    /// Whether the state can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal lifecycle edge.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Queued | Self::Cancelled)
                | (Self::Queued, Self::Running | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Inputs handed to a handler: an opaque map plus the artifact location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Opaque handler inputs.
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Where the handler must write its artifact.
    pub output_path: PathBuf,
}

impl TaskPayload {
    /// Payload with no inputs.
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            inputs: BTreeMap::new(),
            output_path: output_path.into(),
        }
    }

    /// Add one input value.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }
}

/// What a caller hands to [`crate::core::ResourceScheduler::submit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Work category.
    pub kind: TaskKind,
    /// Scheduling tier.
    pub priority: Priority,
    /// Handler inputs and output location.
    pub payload: TaskPayload,
    /// Expected wall-clock duration, used for completion estimates.
    pub estimated_minutes: f64,
}

impl TaskRequest {
    /// Request with the default duration estimate.
    #[must_use]
    pub const fn new(kind: TaskKind, priority: Priority, payload: TaskPayload) -> Self {
        Self {
            kind,
            priority,
            payload,
            estimated_minutes: DEFAULT_ESTIMATE_MINUTES,
        }
    }

    /// Override the duration estimate.
    #[must_use]
    pub const fn with_estimate(mut self, minutes: f64) -> Self {
        self.estimated_minutes = minutes;
        self
    }
}

/// An atomic unit of scheduled device work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Work category.
    pub kind: TaskKind,
    /// Scheduling tier.
    pub priority: Priority,
    /// Handler inputs and output location.
    pub payload: TaskPayload,
    /// Expected wall-clock duration in minutes.
    pub estimated_minutes: f64,
    /// Device memory the task is assumed to need, in GB.
    pub memory_gb: f64,
    /// Submission order; breaks ties within a priority tier.
    pub seq: u64,
    /// Lifecycle state.
    pub state: TaskState,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    /// Last failure reason.
    pub error: Option<String>,
    /// Duration of produced media reported by the handler, in seconds.
    #[serde(default)]
    pub produced_seconds: Option<f64>,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a pending task from a request.
    #[must_use]
    pub fn from_request(request: TaskRequest, memory_gb: f64, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            kind: request.kind,
            priority: request.priority,
            payload: request.payload,
            estimated_minutes: request.estimated_minutes.max(0.0),
            memory_gb,
            seq,
            state: TaskState::Pending,
            progress: 0.0,
            error: None,
            produced_seconds: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Queue ordering key: priority tier, then submission order.
    #[must_use]
    pub const fn order_key(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskState, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                task: self.id,
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            TaskState::Running => self.started_at = Some(now),
            TaskState::Completed => {
                self.progress = 1.0;
                self.completed_at = Some(now);
            }
            TaskState::Failed | TaskState::Cancelled => self.completed_at = Some(now),
            TaskState::Pending | TaskState::Queued => {}
        }
        self.state = next;
        Ok(())
    }

    /// Outcome view of a terminal task.
    #[must_use]
    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            task_id: self.id,
            state: self.state,
            error: self.error.clone(),
            produced_seconds: self.produced_seconds,
        }
    }

    /// Minutes of estimated work left.
    #[must_use]
    pub fn remaining_minutes(&self) -> f64 {
        match self.state {
            TaskState::Pending | TaskState::Queued => self.estimated_minutes,
            TaskState::Running => self.estimated_minutes * (1.0 - self.progress.clamp(0.0, 1.0)),
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => 0.0,
        }
    }
}

/// Terminal result of a task, as delivered to waiters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task the outcome belongs to.
    pub task_id: TaskId,
    /// Terminal state reached.
    pub state: TaskState,
    /// Failure reason, when not completed.
    pub error: Option<String>,
    /// Duration of produced media reported by the handler, in seconds.
    pub produced_seconds: Option<f64>,
}

impl TaskOutcome {
    /// Whether the task completed successfully.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Completed
    }
}
