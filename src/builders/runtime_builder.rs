//! Wire the file-backed runtime from an [`AppConfig`].
//!
//! Layout under `data_dir`:
//!
//! ```text
//! gpu_tasks/queue.json    scheduler queue snapshot
//! jobs/                   job files and the active index
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{
    AppResult, DeviceProbe, HandlerRegistry, NvidiaSmiProbe, ResourceScheduler, SchedulerError,
};
use crate::infra::{FileJobStore, InMemoryQueue, JsonFileQueueStore};
use crate::job::JobController;
use crate::util::{Clock, SystemClock};

/// A scheduler and the controller submitting to it.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Shared scheduler.
    pub scheduler: ResourceScheduler,
    /// Job controller bound to `scheduler`.
    pub controller: JobController,
}

impl Runtime {
    /// Run the scheduler loop on the current tokio runtime until
    /// [`ResourceScheduler::stop`] is called.
    #[must_use]
    pub fn spawn_scheduler(&self) -> JoinHandle<Result<(), SchedulerError>> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run_loop().await })
    }
}

/// Build the production runtime: `nvidia-smi` telemetry, the system clock and
/// JSON files under `cfg.data_dir`.
pub fn build_runtime(cfg: &AppConfig, handlers: HandlerRegistry) -> AppResult<Runtime> {
    let probe = NvidiaSmiProbe::new(cfg.scheduler.fallback_memory_gb);
    build_runtime_with(cfg, handlers, Arc::new(probe), Arc::new(SystemClock))
}

/// Build the file-backed runtime with a caller-supplied probe and clock.
pub fn build_runtime_with(
    cfg: &AppConfig,
    handlers: HandlerRegistry,
    probe: Arc<dyn DeviceProbe>,
    clock: Arc<dyn Clock>,
) -> AppResult<Runtime> {
    cfg.validate().map_err(|e| anyhow!("config invalid: {e}"))?;

    let queue_dir = cfg.data_dir.join("gpu_tasks");
    std::fs::create_dir_all(&queue_dir)
        .with_context(|| format!("creating queue directory {}", queue_dir.display()))?;
    let queue_store = Arc::new(JsonFileQueueStore::in_dir(&queue_dir));

    let scheduler = ResourceScheduler::new(
        cfg.scheduler.clone(),
        InMemoryQueue::new(),
        queue_store,
        probe,
        clock,
        handlers,
    )
    .context("building scheduler")?;

    let jobs_dir = cfg.data_dir.join("jobs");
    let job_store = FileJobStore::new(&jobs_dir)
        .with_context(|| format!("opening job store in {}", jobs_dir.display()))?;
    let controller = JobController::new(scheduler.clone(), Arc::new(job_store), cfg.controller.clone());

    tracing::info!(
        data_dir = %cfg.data_dir.display(),
        max_concurrent = cfg.scheduler.max_concurrent,
        restore_pending = cfg.scheduler.restore_pending,
        "runtime built"
    );
    Ok(Runtime {
        scheduler,
        controller,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceStats, StaticProbe};
    use crate::util::ManualClock;

    fn config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            data_dir: dir.to_path_buf(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn builds_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(StaticProbe::new(DeviceStats::idle("test", 16.0)));
        let runtime = build_runtime_with(
            &config(dir.path()),
            HandlerRegistry::new(),
            probe,
            Arc::new(ManualClock::at_hour(12)),
        )
        .unwrap();

        assert!(dir.path().join("gpu_tasks").is_dir());
        assert!(dir.path().join("jobs").is_dir());
        assert!(runtime.controller.list_jobs().unwrap().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.scheduler.max_concurrent = 0;
        let err = build_runtime(&cfg, HandlerRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }
}
