//! In-memory job store.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::job::{ControllerError, Job, JobId, JobStore};

#[derive(Debug, Default)]
struct Jobs {
    by_id: HashMap<JobId, Job>,
    active: Vec<JobId>,
}

/// Job store kept in process memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<Jobs>,
}

impl InMemoryJobStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn save(&self, job: &Job) -> Result<(), ControllerError> {
        let mut jobs = self.jobs.lock();
        let listed = jobs.active.iter().position(|id| *id == job.id);
        match (job.phase.is_terminal(), listed) {
            (true, Some(at)) => {
                jobs.active.remove(at);
            }
            (false, None) => jobs.active.push(job.id.clone()),
            _ => {}
        }
        jobs.by_id.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn load(&self, id: &JobId) -> Result<Option<Job>, ControllerError> {
        Ok(self.jobs.lock().by_id.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Job>, ControllerError> {
        let mut all: Vec<Job> = self.jobs.lock().by_id.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn active_ids(&self) -> Result<Vec<JobId>, ControllerError> {
        Ok(self.jobs.lock().active.clone())
    }
}
