//! Job persistence contract.

use crate::job::{ControllerError, Job, JobId};

/// Durable storage for jobs plus an index of non-terminal job ids.
///
/// `save` writes the full job and keeps the index in step: non-terminal jobs
/// are listed, terminal ones are dropped from it. Terminal job files are kept
/// so failed jobs stay inspectable.
pub trait JobStore: Send + Sync {
    /// Persist the full job and update the active index.
    fn save(&self, job: &Job) -> Result<(), ControllerError>;
    /// Load one job.
    fn load(&self, id: &JobId) -> Result<Option<Job>, ControllerError>;
    /// Every stored job, oldest first.
    fn list(&self) -> Result<Vec<Job>, ControllerError>;
    /// Ids of non-terminal jobs, from the index.
    fn active_ids(&self) -> Result<Vec<JobId>, ControllerError>;
}
