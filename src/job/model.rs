//! Job, unit and phase model.
//!
//! A job moves through `Created -> Queued -> Produce -> PostProcess ->
//! Assemble -> Completed`. `Failed` is reachable from the three active phases
//! and `Paused` remembers which active phase to resume into. Every legal edge
//! is listed in [`JobPhase::can_transition_to`]; anything else is rejected.
//!
//! Units track the produce and post-process steps separately so a resume never
//! redoes a step whose artifact already exists.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::TaskState;
use crate::job::ControllerError;
use crate::util::{Priority, TaskId};

/// Speech rate used to estimate produced duration when a handler reports none.
pub const WORDS_PER_MINUTE: f64 = 150.0;
/// Estimated minutes to post-process one unit.
pub const POST_PROCESS_MINUTES: f64 = 2.0;
/// Estimated minutes to assemble the final artifact.
pub const ASSEMBLE_MINUTES: f64 = 5.0;

/// Job identifier: `{logical_key}_{YYYYmmdd_HHMMSS}_{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh id for `logical_key` created at `now`. The random suffix keeps
    /// ids unique when the same key is submitted twice within a second.
    #[must_use]
    pub fn generate(logical_key: &str, now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{logical_key}_{}_{}",
            now.format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        ))
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phases in which work is being done and from which a job can fail or pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivePhase {
    /// Producing the raw artifact of every unit.
    Produce,
    /// Post-processing every produced artifact.
    PostProcess,
    /// Assembling all post-processed artifacts into the final one.
    Assemble,
}

impl From<ActivePhase> for JobPhase {
    fn from(phase: ActivePhase) -> Self {
        match phase {
            ActivePhase::Produce => Self::Produce,
            ActivePhase::PostProcess => Self::PostProcess,
            ActivePhase::Assemble => Self::Assemble,
        }
    }
}

/// Position of a job in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum JobPhase {
    /// Built and persisted; nothing submitted.
    Created,
    /// Waiting to be driven; produce tasks may already be queued.
    Queued,
    /// Producing units.
    Produce,
    /// Post-processing units.
    PostProcess,
    /// Assembling the final artifact.
    Assemble,
    /// Every phase finished.
    Completed,
    /// A step exhausted its retries.
    Failed,
    /// Stopped by request; resumes into `resume_to`.
    Paused {
        /// Phase to re-enter on resume.
        resume_to: ActivePhase,
    },
}

impl JobPhase {
    /// The active phase this value represents, if any.
    #[must_use]
    pub const fn active(self) -> Option<ActivePhase> {
        match self {
            Self::Produce => Some(ActivePhase::Produce),
            Self::PostProcess => Some(ActivePhase::PostProcess),
            Self::Assemble => Some(ActivePhase::Assemble),
            Self::Created
            | Self::Queued
            | Self::Completed
            | Self::Failed
            | Self::Paused { .. } => None,
        }
    }

    /// `Completed` or `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal edge.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Created, Self::Queued)
            | (Self::Queued, Self::Produce)
            | (Self::Produce, Self::PostProcess)
            | (Self::PostProcess, Self::Assemble)
            | (Self::Assemble, Self::Completed)
            // Manual reset of a failed job.
            | (Self::Failed, Self::Queued) => true,
            (from, Self::Failed) => from.active().is_some(),
            (from, Self::Paused { resume_to }) => from.active() == Some(resume_to),
            (Self::Paused { resume_to }, to) => JobPhase::from(resume_to) == to,
            _ => false,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Queued => f.write_str("queued"),
            Self::Produce => f.write_str("produce"),
            Self::PostProcess => f.write_str("post_process"),
            Self::Assemble => f.write_str("assemble"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Paused { resume_to } => {
                write!(f, "paused({})", JobPhase::from(*resume_to))
            }
        }
    }
}

/// What happened to a step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Under the bound; the step is pending again.
    Retry,
    /// Bound exhausted; the step is terminally failed.
    Exhausted,
}

/// Progress of one step (produce, post-process or assemble).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Lifecycle state, mirroring the task that executes the step.
    pub state: TaskState,
    /// Failed attempts that were retried.
    pub retries: u32,
    /// Last failure reason.
    pub error: Option<String>,
    /// Scheduler task currently executing the step.
    pub task_id: Option<TaskId>,
    /// First time the step was waited on.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepProgress {
    /// Whether the step finished successfully.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == TaskState::Completed
    }

    /// Record that `task_id` was submitted for this step.
    pub fn submitted(&mut self, task_id: TaskId) {
        self.state = TaskState::Queued;
        self.task_id = Some(task_id);
    }

    /// Record that the controller is now waiting on the step's task.
    pub fn running(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Running;
        self.started_at.get_or_insert(now);
    }

    /// Forget the outstanding task without consuming a retry.
    pub fn requeue(&mut self) {
        self.state = TaskState::Pending;
        self.task_id = None;
    }

    /// Record success.
    pub fn succeeded(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.error = None;
        self.task_id = None;
        self.completed_at = Some(now);
    }

    /// Record a failed attempt against a budget of `max_retries`, of which
    /// `spent` is already used. Steps of one unit share a budget, so `spent`
    /// counts the retries of every step charged to it, this one included.
    /// The attempt after the budget is used up is terminal.
    pub fn failed(
        &mut self,
        error: String,
        spent: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> RetryVerdict {
        self.error = Some(error);
        self.task_id = None;
        if spent < max_retries {
            self.retries += 1;
            self.state = TaskState::Pending;
            RetryVerdict::Retry
        } else {
            self.state = TaskState::Failed;
            self.completed_at = Some(now);
            RetryVerdict::Exhausted
        }
    }

    /// Clear a failed or unfinished step for another run. Completed steps are
    /// left untouched.
    pub fn reset(&mut self) {
        if self.is_done() {
            return;
        }
        *self = Self::default();
    }
}

/// One ordered sub-item of a job, such as a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Caller-supplied or generated id.
    pub id: String,
    /// 1-based position within the job.
    pub ordinal: u32,
    /// Display title.
    pub title: String,
    /// Size metric.
    pub word_count: u64,
    /// Raw artifact production.
    pub produce: StepProgress,
    /// Post-processing of the raw artifact.
    pub post_process: StepProgress,
    /// Produced raw artifact.
    pub audio_path: Option<PathBuf>,
    /// Post-processed artifact.
    pub mastered_path: Option<PathBuf>,
    /// Duration of the produced media in seconds.
    pub duration_seconds: Option<f64>,
}

impl Unit {
    /// Aggregate state across both steps.
    #[must_use]
    pub fn state(&self) -> TaskState {
        let (p, m) = (self.produce.state, self.post_process.state);
        if m == TaskState::Completed {
            TaskState::Completed
        } else if p == TaskState::Failed || m == TaskState::Failed {
            TaskState::Failed
        } else if p == TaskState::Running || m == TaskState::Running {
            TaskState::Running
        } else if p == TaskState::Queued || m == TaskState::Queued {
            TaskState::Queued
        } else if p == TaskState::Completed {
            // Produced, waiting for post-processing.
            TaskState::Running
        } else {
            TaskState::Pending
        }
    }

    /// Retries consumed across both steps. Both steps draw on this one
    /// counter, so it never exceeds the configured bound.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.produce.retries + self.post_process.retries
    }

    /// Clear unfinished steps and give the unit a fresh retry budget.
    /// A completed step keeps its state and artifact.
    pub fn reset(&mut self) {
        if self.state() == TaskState::Completed {
            return;
        }
        self.produce.reset();
        self.post_process.reset();
        self.produce.retries = 0;
        self.post_process.retries = 0;
    }

    /// Most recent failure reason.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.post_process
            .error
            .as_deref()
            .or(self.produce.error.as_deref())
    }

    /// Estimated production time: one minute per thousand words plus five.
    #[must_use]
    pub fn produce_estimate_minutes(&self) -> f64 {
        word_count_f64(self.word_count) / 1000.0 + 5.0
    }

    /// Duration estimated from the word count.
    #[must_use]
    pub fn estimated_duration_seconds(&self) -> f64 {
        word_count_f64(self.word_count) / WORDS_PER_MINUTE * 60.0
    }

    /// Minutes of estimated work left for this unit.
    #[must_use]
    pub fn remaining_minutes(&self) -> f64 {
        let mut minutes = 0.0;
        if !self.produce.is_done() {
            minutes += self.produce_estimate_minutes();
        }
        if !self.post_process.is_done() {
            minutes += POST_PROCESS_MINUTES;
        }
        minutes
    }
}

#[allow(clippy::cast_precision_loss)]
const fn word_count_f64(words: u64) -> f64 {
    words as f64
}

/// Caller-supplied description of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Optional stable id; generated from the ordinal when absent.
    pub id: Option<String>,
    /// Display title.
    pub title: String,
    /// Size metric.
    pub word_count: u64,
}

impl UnitSpec {
    /// Unit spec without an explicit id.
    pub fn new(title: impl Into<String>, word_count: u64) -> Self {
        Self {
            id: None,
            title: title.into(),
            word_count,
        }
    }
}

/// Per-job settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Priority given to every task of the job, usually normal or overnight.
    pub priority: Priority,
    /// Root of the job's `raw/`, `mastered/` and `final/` directories.
    pub output_dir: PathBuf,
    /// Opaque parameters forwarded to every handler (voice profile, format).
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl JobConfig {
    /// Normal-priority config writing under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            priority: Priority::Normal,
            output_dir: output_dir.into(),
            params: BTreeMap::new(),
        }
    }

    /// Only run inside the overnight window.
    #[must_use]
    pub const fn overnight(mut self) -> Self {
        self.priority = Priority::Overnight;
        self
    }

    /// Use an explicit priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add one handler parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A multi-phase production run for one logical work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: JobId,
    /// Logical work item, such as a book id.
    pub logical_key: String,
    /// Lifecycle position.
    pub phase: JobPhase,
    /// Ordered units.
    pub units: Vec<Unit>,
    /// Settings.
    pub config: JobConfig,
    /// Sum of unit word counts.
    pub total_word_count: u64,
    /// Sum of unit durations, set on completion.
    pub total_duration_seconds: f64,
    /// Top-level failure message.
    pub error: Option<String>,
    /// Final assembly step.
    pub assemble: StepProgress,
    /// Final artifact.
    pub final_path: Option<PathBuf>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Last persisted change.
    pub updated_at: DateTime<Utc>,
    /// First time the job was driven.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job in `Created` from unit specs.
    #[must_use]
    pub fn new(
        logical_key: impl Into<String>,
        units: Vec<UnitSpec>,
        config: JobConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let logical_key = logical_key.into();
        let units: Vec<Unit> = units
            .into_iter()
            .zip(1_u32..)
            .map(|(spec, ordinal)| Unit {
                id: spec.id.unwrap_or_else(|| format!("unit_{ordinal:02}")),
                ordinal,
                title: spec.title,
                word_count: spec.word_count,
                produce: StepProgress::default(),
                post_process: StepProgress::default(),
                audio_path: None,
                mastered_path: None,
                duration_seconds: None,
            })
            .collect();
        Self {
            id: JobId::generate(&logical_key, now),
            total_word_count: units.iter().map(|u| u.word_count).sum(),
            logical_key,
            phase: JobPhase::Created,
            units,
            config,
            total_duration_seconds: 0.0,
            error: None,
            assemble: StepProgress::default(),
            final_path: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, rejecting illegal edges.
    pub fn transition(&mut self, next: JobPhase, now: DateTime<Utc>) -> Result<(), ControllerError> {
        if !self.phase.can_transition_to(next) {
            return Err(ControllerError::InvalidTransition {
                job: self.id.clone(),
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            JobPhase::Produce => {
                self.started_at.get_or_insert(now);
            }
            JobPhase::Completed | JobPhase::Failed => self.completed_at = Some(now),
            JobPhase::Queued => self.completed_at = None,
            JobPhase::Created
            | JobPhase::PostProcess
            | JobPhase::Assemble
            | JobPhase::Paused { .. } => {}
        }
        tracing::info!(job = %self.id, from = %self.phase, to = %next, "job phase changed");
        self.phase = next;
        self.updated_at = now;
        Ok(())
    }

    /// Fraction of steps finished: two per unit plus assembly.
    #[must_use]
    pub fn progress(&self) -> f64 {
        let done: u32 = self
            .units
            .iter()
            .map(|u| u32::from(u.produce.is_done()) + u32::from(u.post_process.is_done()))
            .sum::<u32>()
            + u32::from(self.assemble.is_done());
        let total = self.step_count();
        f64::from(done) / f64::from(total)
    }

    fn step_count(&self) -> u32 {
        u32::try_from(self.units.len())
            .unwrap_or(u32::MAX / 2)
            .saturating_mul(2)
            .saturating_add(1)
    }

    /// Minutes of estimated work left.
    #[must_use]
    pub fn remaining_minutes(&self) -> f64 {
        if self.phase.is_terminal() {
            return 0.0;
        }
        let units: f64 = self.units.iter().map(Unit::remaining_minutes).sum();
        if self.assemble.is_done() {
            units
        } else {
            units + ASSEMBLE_MINUTES
        }
    }

    /// Raw artifact path for a unit.
    #[must_use]
    pub fn raw_path(&self, unit: &Unit) -> PathBuf {
        unit_artifact(&self.config.output_dir, "raw", unit.ordinal)
    }

    /// Post-processed artifact path for a unit.
    #[must_use]
    pub fn mastered_path(&self, unit: &Unit) -> PathBuf {
        unit_artifact(&self.config.output_dir, "mastered", unit.ordinal)
    }

    /// Final artifact path.
    #[must_use]
    pub fn assembled_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join("final")
            .join(format!("{}.m4b", self.logical_key))
    }

    /// Units that exhausted their retries.
    pub fn failed_units(&self) -> impl Iterator<Item = &Unit> {
        self.units.iter().filter(|u| u.state() == TaskState::Failed)
    }
}

fn unit_artifact(root: &Path, dir: &str, ordinal: u32) -> PathBuf {
    root.join(dir).join(format!("chapter_{ordinal:02}.wav"))
}
