//! Scheduler and controller configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::TaskKind;

/// Admission and run-loop policy for the resource scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrently running tasks. The device is not time-sliceable,
    /// so this is normally 1.
    pub max_concurrent: u32,
    /// Tasks are refused while the device is hotter than this (Celsius).
    pub temperature_ceiling_c: f64,
    /// Hour (0-23, local time) at which the overnight window opens.
    pub overnight_start_hour: u32,
    /// Hour (0-23, local time) at which the overnight window closes.
    pub overnight_end_hour: u32,
    /// Sleep between admission attempts when nothing can run.
    pub poll_backoff_ms: u64,
    /// Per-task execution timeout in seconds.
    pub task_timeout_secs: u64,
    /// Device memory assumed free when telemetry is unavailable.
    pub fallback_memory_gb: f64,
    /// Per-kind memory estimate overrides in GB.
    pub memory_costs_gb: HashMap<TaskKind, f64>,
    /// Re-queue pending tasks from the last queue snapshot on startup.
    pub restore_pending: bool,
    /// Finished tasks kept for `wait` and `task` lookups. Older ones are
    /// evicted and report as unknown.
    pub finished_retention: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            temperature_ceiling_c: 80.0,
            overnight_start_hour: 23,
            overnight_end_hour: 6,
            poll_backoff_ms: 60_000,
            task_timeout_secs: 2 * 60 * 60,
            fallback_memory_gb: 16.0,
            memory_costs_gb: HashMap::new(),
            restore_pending: false,
            finished_retention: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".into());
        }
        if self.overnight_start_hour > 23 || self.overnight_end_hour > 23 {
            return Err("overnight hours must be within 0..=23".into());
        }
        if self.poll_backoff_ms == 0 {
            return Err("poll_backoff_ms must be greater than 0".into());
        }
        if self.finished_retention == 0 {
            return Err("finished_retention must be greater than 0".into());
        }
        if self.task_timeout_secs == 0 {
            return Err("task_timeout_secs must be greater than 0".into());
        }
        if !self.temperature_ceiling_c.is_finite() || self.temperature_ceiling_c <= 0.0 {
            return Err("temperature_ceiling_c must be a positive number".into());
        }
        if let Some((kind, cost)) = self
            .memory_costs_gb
            .iter()
            .find(|(_, cost)| !cost.is_finite() || **cost < 0.0)
        {
            return Err(format!("memory cost for `{kind}` is invalid: {cost}"));
        }
        Ok(())
    }

    /// Estimated device memory for a task kind, honoring overrides.
    #[must_use]
    pub fn memory_cost_gb(&self, kind: TaskKind) -> f64 {
        self.memory_costs_gb
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_memory_gb())
    }

    /// Backoff between idle admission scans.
    #[must_use]
    pub const fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }

    /// Per-task execution timeout.
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Builder-style override of the concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Builder-style override of the idle backoff.
    #[must_use]
    pub const fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Builder-style override of the overnight window.
    #[must_use]
    pub const fn with_overnight_window(mut self, start_hour: u32, end_hour: u32) -> Self {
        self.overnight_start_hour = start_hour;
        self.overnight_end_hour = end_hour;
        self
    }

    /// Builder-style override of the finished-task retention.
    #[must_use]
    pub const fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    /// Builder-style override of the task timeout.
    #[must_use]
    pub const fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_secs = timeout.as_secs();
        self
    }
}

/// Retry policy for the job controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Failures tolerated per step before it is terminally failed. A step
    /// fails permanently on failure number `max_retries + 1`.
    pub max_retries: u32,
    /// Pause before resubmitting a failed step.
    pub retry_backoff_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 5_000,
        }
    }
}

impl ControllerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > 100 {
            return Err("max_retries must not exceed 100".into());
        }
        Ok(())
    }

    /// Pause before resubmitting a failed step.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Builder-style override of the retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder-style override of the retry backoff.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = SchedulerConfig::default().with_max_concurrent(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_hours_are_rejected() {
        let cfg = SchedulerConfig::default().with_overnight_window(24, 6);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_cost_override_is_rejected() {
        let mut cfg = SchedulerConfig::default();
        cfg.memory_costs_gb.insert(TaskKind::Synthesis, -1.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn memory_cost_prefers_override() {
        let mut cfg = SchedulerConfig::default();
        assert_eq!(cfg.memory_cost_gb(TaskKind::Synthesis), 6.0);
        cfg.memory_costs_gb.insert(TaskKind::Synthesis, 4.5);
        assert_eq!(cfg.memory_cost_gb(TaskKind::Synthesis), 4.5);
    }
}
