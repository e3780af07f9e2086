//! File-backed queue snapshot store.
//!
//! The whole snapshot is rewritten on every save. Writes go through a temp
//! file and a rename so a crash never leaves a truncated snapshot behind.

use std::path::{Path, PathBuf};

use crate::core::{QueueSnapshot, QueueStore, SchedulerError};
use crate::infra::fs::{read_json, write_json_atomic};

/// Default snapshot file name inside the data directory.
pub const QUEUE_FILE: &str = "queue.json";

/// Queue snapshot persisted as one JSON document.
#[derive(Debug, Clone)]
pub struct JsonFileQueueStore {
    path: PathBuf,
}

impl JsonFileQueueStore {
    /// Store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store writing [`QUEUE_FILE`] inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(QUEUE_FILE))
    }

    /// Snapshot file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueStore for JsonFileQueueStore {
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), SchedulerError> {
        write_json_atomic(&self.path, snapshot).map_err(|e| {
            SchedulerError::Persistence(format!("write {}: {e}", self.path.display()))
        })
    }

    fn load(&self) -> Result<Option<QueueSnapshot>, SchedulerError> {
        read_json(&self.path)
            .map_err(|e| SchedulerError::Persistence(format!("read {}: {e}", self.path.display())))
    }
}
