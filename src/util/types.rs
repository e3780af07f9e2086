//! Identifiers, priority tiers and task kinds shared by the scheduler and the
//! job controller.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Scheduling tier. Lower numeric value is scheduled first.
///
/// [`Priority::Overnight`] is only admissible inside the configured
/// overnight window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Must complete as soon as possible.
    Critical = 1,
    /// Important, run soon.
    High = 2,
    /// Standard processing.
    Normal = 3,
    /// Background work, run when idle.
    Low = 4,
    /// Batch work admitted only inside the overnight window.
    Overnight = 5,
}

impl Priority {
    /// Numeric tier value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Whether this tier is restricted to the overnight window.
    #[must_use]
    pub const fn is_overnight_only(self) -> bool {
        matches!(self, Self::Overnight)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Overnight => "overnight",
        };
        f.write_str(name)
    }
}

/// Category of device work. Used to look up the task's estimated memory cost
/// and to route it to a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Speech synthesis of one chapter.
    Synthesis,
    /// Local language model inference.
    LlmInference,
    /// Image generation (cover art).
    ImageGeneration,
    /// Audio post-processing and mastering.
    Mastering,
    /// Video generation.
    VideoGeneration,
    /// Mixed batch work.
    Batch,
    /// Final assembly and packaging of produced artifacts.
    Packaging,
}

impl TaskKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Synthesis,
        Self::LlmInference,
        Self::ImageGeneration,
        Self::Mastering,
        Self::VideoGeneration,
        Self::Batch,
        Self::Packaging,
    ];

    /// Conservative device memory estimate in GB.
    ///
    /// These are deliberately pessimistic: telemetry is sampled before the task
    /// starts and the estimate has to absorb whatever changes in between.
    #[must_use]
    pub const fn default_memory_gb(self) -> f64 {
        match self {
            Self::Synthesis => 6.0,
            Self::LlmInference | Self::Batch => 8.0,
            Self::ImageGeneration => 10.0,
            Self::Mastering => 2.0,
            Self::VideoGeneration => 12.0,
            Self::Packaging => 0.0,
        }
    }

    /// Short name used in logs and persisted payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synthesis => "synthesis",
            Self::LlmInference => "llm_inference",
            Self::ImageGeneration => "image_generation",
            Self::Mastering => "mastering",
            Self::VideoGeneration => "video_generation",
            Self::Batch => "batch",
            Self::Packaging => "packaging",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_value_sorts_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Normal < Priority::Overnight);
        assert_eq!(Priority::Overnight.value(), 5);
        assert!(Priority::Overnight.is_overnight_only());
        assert!(!Priority::Low.is_overnight_only());
    }

    #[test]
    fn task_ids_are_unique_and_prefixed() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("task-"));
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&TaskKind::ImageGeneration).unwrap();
        assert_eq!(json, "\"image_generation\"");
        assert_eq!(TaskKind::Mastering.default_memory_gb(), 2.0);
    }
}
