//! Root configuration: data directory plus scheduler and controller policy.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ControllerConfig, SchedulerConfig};

/// Root configuration for a scheduler + controller pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding queue snapshots, job files and the active-job index.
    pub data_dir: PathBuf,
    /// Resource scheduler policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Job controller retry policy.
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("batch_jobs"),
            scheduler: SchedulerConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        if self.data_dir.as_os_str().is_empty() {
            return Err("data_dir must not be empty".into());
        }
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler invalid: {e}"))?;
        self.controller
            .validate()
            .map_err(|e| format!("controller invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Build configuration from the environment.
    ///
    /// Loads a `.env` file when present, then applies `NIGHTSHIFT_*`
    /// variables on top of the defaults. `NIGHTSHIFT_CONFIG` names a JSON file
    /// used as the base instead of the defaults.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = match std::env::var("NIGHTSHIFT_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from a key lookup. Split out from [`Self::from_env`]
    /// so the mapping can be exercised without touching process state.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("NIGHTSHIFT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        let s = &mut self.scheduler;
        override_from(&lookup, "NIGHTSHIFT_MAX_CONCURRENT", &mut s.max_concurrent)?;
        override_from(&lookup, "NIGHTSHIFT_TEMPERATURE_CEILING_C", &mut s.temperature_ceiling_c)?;
        override_from(&lookup, "NIGHTSHIFT_OVERNIGHT_START_HOUR", &mut s.overnight_start_hour)?;
        override_from(&lookup, "NIGHTSHIFT_OVERNIGHT_END_HOUR", &mut s.overnight_end_hour)?;
        override_from(&lookup, "NIGHTSHIFT_POLL_BACKOFF_MS", &mut s.poll_backoff_ms)?;
        override_from(&lookup, "NIGHTSHIFT_TASK_TIMEOUT_SECS", &mut s.task_timeout_secs)?;
        override_from(&lookup, "NIGHTSHIFT_FALLBACK_MEMORY_GB", &mut s.fallback_memory_gb)?;
        override_from(&lookup, "NIGHTSHIFT_RESTORE_PENDING", &mut s.restore_pending)?;
        override_from(&lookup, "NIGHTSHIFT_FINISHED_RETENTION", &mut s.finished_retention)?;
        let c = &mut self.controller;
        override_from(&lookup, "NIGHTSHIFT_MAX_RETRIES", &mut c.max_retries)?;
        override_from(&lookup, "NIGHTSHIFT_RETRY_BACKOFF_MS", &mut c.retry_backoff_ms)?;
        Ok(())
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| format!("{key}={raw:?} is invalid: {e}"))?;
    }
    Ok(())
}
