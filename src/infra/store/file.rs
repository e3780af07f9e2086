//! File-backed job store.
//!
//! Layout inside the data directory:
//!
//! ```text
//! active_jobs.json        index of non-terminal job ids
//! job_<id>.json           full job state, one file per job
//! ```
//!
//! Both files are rewritten whole through a temp file and a rename.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::infra::fs::{read_json, write_json_atomic};
use crate::job::{ControllerError, Job, JobId, JobStore};

/// Index file name.
pub const INDEX_FILE: &str = "active_jobs.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ActiveIndex {
    active_jobs: Vec<JobId>,
    updated_at: Option<DateTime<Utc>>,
}

/// Jobs persisted as JSON files in one directory.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
    index_lock: Mutex<()>,
}

impl FileJobStore {
    /// Store rooted at `dir`, created if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ControllerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| store_err("create", &dir, &e))?;
        Ok(Self {
            dir,
            index_lock: Mutex::new(()),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of one job's file.
    #[must_use]
    pub fn job_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("job_{id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn read_index(&self) -> Result<ActiveIndex, ControllerError> {
        let path = self.index_path();
        Ok(read_json(&path)
            .map_err(|e| store_err("read", &path, &e))?
            .unwrap_or_default())
    }
}

impl JobStore for FileJobStore {
    fn save(&self, job: &Job) -> Result<(), ControllerError> {
        let path = self.job_path(&job.id);
        write_json_atomic(&path, job).map_err(|e| store_err("write", &path, &e))?;

        let _guard = self.index_lock.lock();
        let mut index = self.read_index()?;
        let listed = index.active_jobs.iter().position(|id| *id == job.id);
        let changed = match (job.phase.is_terminal(), listed) {
            (true, Some(at)) => {
                index.active_jobs.remove(at);
                true
            }
            (false, None) => {
                index.active_jobs.push(job.id.clone());
                true
            }
            _ => false,
        };
        if changed {
            index.updated_at = Some(job.updated_at);
            let index_path = self.index_path();
            write_json_atomic(&index_path, &index)
                .map_err(|e| store_err("write", &index_path, &e))?;
        }
        Ok(())
    }

    fn load(&self, id: &JobId) -> Result<Option<Job>, ControllerError> {
        let path = self.job_path(id);
        read_json(&path).map_err(|e| store_err("read", &path, &e))
    }

    fn list(&self) -> Result<Vec<Job>, ControllerError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| store_err("list", &self.dir, &e))?;
        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| store_err("list", &self.dir, &e))?.path();
            let is_job_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("job_") && n.ends_with(".json"));
            if !is_job_file {
                continue;
            }
            if let Some(job) = read_json::<Job>(&path).map_err(|e| store_err("read", &path, &e))? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn active_ids(&self) -> Result<Vec<JobId>, ControllerError> {
        Ok(self.read_index()?.active_jobs)
    }
}

fn store_err(action: &str, path: &Path, err: &std::io::Error) -> ControllerError {
    ControllerError::Store(format!("{action} {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobConfig, JobPhase, UnitSpec};

    fn job(key: &str) -> Job {
        Job::new(
            key,
            vec![UnitSpec::new("Chapter 1", 1200), UnitSpec::new("Chapter 2", 900)],
            JobConfig::new("/tmp/out").overnight(),
            Utc::now(),
        )
    }

    #[test]
    fn saves_job_file_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        let job = job("dracula");
        store.save(&job).unwrap();

        assert!(store.job_path(&job.id).exists());
        assert!(dir.path().join(INDEX_FILE).exists());
        assert_eq!(store.active_ids().unwrap(), vec![job.id.clone()]);

        let loaded = store.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn terminal_jobs_leave_index_but_stay_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        let mut first = job("emma");
        let second = job("persuasion");
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        let now = Utc::now();
        for phase in [JobPhase::Queued, JobPhase::Produce, JobPhase::Failed] {
            first.transition(phase, now).unwrap();
        }
        store.save(&first).unwrap();

        assert_eq!(store.active_ids().unwrap(), vec![second.id.clone()]);
        let listed: Vec<JobId> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first.id));
    }

    #[test]
    fn missing_job_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        assert!(store.load(&JobId::from("nope")).unwrap().is_none());
        assert!(store.active_ids().unwrap().is_empty());
        assert!(store.list().unwrap().is_empty());
    }
}
