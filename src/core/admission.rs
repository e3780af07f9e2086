//! Admission control: may this task start right now?
//!
//! Checks run in a fixed order and the first failing one short-circuits:
//! free memory, temperature, overnight window, concurrency limit. A refusal is
//! not an error; the task simply stays queued.

use std::fmt;

use chrono::{DateTime, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::core::{DeviceStats, Task};

/// Why a task was not admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Refusal {
    /// Not enough free device memory for the task's kind.
    InsufficientMemory {
        /// Free memory reported by the probe (GB).
        free_gb: f64,
        /// Estimated requirement (GB).
        required_gb: f64,
    },
    /// Device is above the temperature ceiling.
    TooHot {
        /// Reported temperature (Celsius).
        temperature_c: f64,
        /// Configured ceiling (Celsius).
        ceiling_c: f64,
    },
    /// Overnight-only task outside the overnight window.
    OutsideOvernightWindow {
        /// Local hour when checked.
        hour: u32,
    },
    /// All concurrency slots are taken.
    ConcurrencyLimit {
        /// Configured limit.
        limit: u32,
    },
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientMemory { free_gb, required_gb } => write!(
                f,
                "insufficient device memory: {free_gb:.1}GB free, {required_gb:.1}GB needed"
            ),
            Self::TooHot { temperature_c, ceiling_c } => {
                write!(f, "device too hot: {temperature_c:.0}C (ceiling {ceiling_c:.0}C)")
            }
            Self::OutsideOvernightWindow { hour } => {
                write!(f, "task scheduled for overnight only (local hour {hour})")
            }
            Self::ConcurrencyLimit { limit } => write!(f, "max concurrent tasks ({limit}) reached"),
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    /// The task may start now.
    Allowed,
    /// The task must wait.
    Refused(Refusal),
}

impl Admission {
    /// Whether the task may start.
    #[must_use]
    pub const fn allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Human-readable reason, `"OK"` when allowed.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Allowed => "OK".to_string(),
            Self::Refused(refusal) => refusal.to_string(),
        }
    }
}

/// Whether `hour` falls inside `[start, end)`, wrapping past midnight when
/// `start > end`. An empty window (`start == end`) never matches.
#[must_use]
pub const fn in_overnight_window(hour: u32, start: u32, end: u32) -> bool {
    if start > end {
        hour >= start || hour < end
    } else {
        hour >= start && hour < end
    }
}

/// Evaluate every admission rule for `task`.
#[must_use]
pub fn evaluate(
    task: &Task,
    stats: &DeviceStats,
    now: DateTime<FixedOffset>,
    running: u32,
    cfg: &SchedulerConfig,
) -> Admission {
    if stats.memory_free_gb < task.memory_gb {
        return Admission::Refused(Refusal::InsufficientMemory {
            free_gb: stats.memory_free_gb,
            required_gb: task.memory_gb,
        });
    }
    if stats.temperature_c > cfg.temperature_ceiling_c {
        return Admission::Refused(Refusal::TooHot {
            temperature_c: stats.temperature_c,
            ceiling_c: cfg.temperature_ceiling_c,
        });
    }
    let hour = now.hour();
    if task.priority.is_overnight_only()
        && !in_overnight_window(hour, cfg.overnight_start_hour, cfg.overnight_end_hour)
    {
        return Admission::Refused(Refusal::OutsideOvernightWindow { hour });
    }
    if running >= cfg.max_concurrent {
        return Admission::Refused(Refusal::ConcurrencyLimit {
            limit: cfg.max_concurrent,
        });
    }
    Admission::Allowed
}
