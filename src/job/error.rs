//! Job controller errors.

use thiserror::Error;

use crate::core::SchedulerError;
use crate::job::JobId;

/// Errors surfaced by the job controller.
///
/// Unit failures are not errors: they are retried and, once exhausted, turn
/// into a failed [`JobOutcome`](crate::job::JobOutcome).
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The scheduler rejected an operation or stopped.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// Job state could not be written or read. Fatal to the run.
    #[error("job store failure: {0}")]
    Store(String),
    /// No persisted job with this id.
    #[error("unknown job {0}")]
    JobNotFound(JobId),
    /// A phase change the job lifecycle does not allow.
    #[error("job {job}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Job being mutated.
        job: JobId,
        /// Phase before the attempted change.
        from: String,
        /// Requested phase.
        to: String,
    },
    /// Resume was requested for a job in a terminal phase.
    #[error("job {job} cannot be resumed from phase {phase}")]
    NotResumable {
        /// Job requested.
        job: JobId,
        /// Its current phase.
        phase: String,
    },
    /// The job description is unusable.
    #[error("invalid job: {0}")]
    InvalidJob(String),
    /// Another call on this controller is already driving the job.
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
}
