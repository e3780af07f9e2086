//! Job controller: drives jobs through their phases on top of the scheduler.
//!
//! Each step of a job (a unit's produce or post-process, or the final
//! assembly) runs as one scheduler task. Failed steps are resubmitted in place
//! until they succeed or exhaust `max_retries`; the first exhausted step fails
//! the job. The full job is persisted after every step and phase change, so a
//! restart resumes at the first unfinished step.
//!
//! Pause is cooperative. It is honored at step boundaries, or earlier when the
//! awaited task is still queued and can be withdrawn. A running task is never
//! interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::core::{
    ResourceScheduler, SchedulerError, TaskOutcome, TaskPayload, TaskRequest, TaskState,
};
use crate::job::model::{ASSEMBLE_MINUTES, POST_PROCESS_MINUTES};
use crate::job::{
    ControllerError, Job, JobConfig, JobId, JobPhase, JobStore, RetryVerdict, StepProgress,
    UnitSpec,
};
use crate::util::clock::add_minutes;
use crate::util::{Clock, TaskId, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepRef {
    Produce(usize),
    PostProcess(usize),
    Assemble,
}

enum StepRun {
    Completed,
    Failed(String),
    Paused,
}

enum Waited {
    Outcome(TaskOutcome),
    /// Pause withdrew the task before it started.
    Withdrawn,
    /// The scheduler does not know the task, typically after a restart.
    Lost,
}

/// A unit that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// Unit position.
    pub ordinal: u32,
    /// Unit title.
    pub title: String,
    /// Last failure reason.
    pub error: String,
}

/// Structured result of driving a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job driven.
    pub job_id: JobId,
    /// Whether the job reached `Completed`.
    pub success: bool,
    /// Phase the job ended in.
    pub phase: JobPhase,
    /// Failure or pause description.
    pub message: Option<String>,
    /// Units that exhausted their retries.
    pub failed_units: Vec<UnitFailure>,
}

impl JobOutcome {
    fn from_job(job: &Job) -> Self {
        let message = match job.phase {
            JobPhase::Paused { resume_to } => {
                Some(format!("paused during {}", JobPhase::from(resume_to)))
            }
            _ => job.error.clone(),
        };
        Self {
            job_id: job.id.clone(),
            success: job.phase == JobPhase::Completed,
            phase: job.phase,
            message,
            failed_units: job
                .failed_units()
                .map(|u| UnitFailure {
                    ordinal: u.ordinal,
                    title: u.title.clone(),
                    error: u.error().unwrap_or("unknown error").to_string(),
                })
                .collect(),
        }
    }
}

/// Per-unit line of a [`JobStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Unit position.
    pub ordinal: u32,
    /// Unit id.
    pub id: String,
    /// Unit title.
    pub title: String,
    /// Aggregate state.
    pub state: TaskState,
    /// Retries consumed.
    pub retries: u32,
    /// Last failure reason.
    pub error: Option<String>,
}

/// Progress report for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job id.
    pub job_id: JobId,
    /// Logical work item.
    pub logical_key: String,
    /// Current phase.
    pub phase: JobPhase,
    /// Fraction of steps finished.
    pub progress: f64,
    /// Per-unit breakdown.
    pub units: Vec<UnitStatus>,
    /// Estimated minutes of work left.
    pub remaining_minutes: f64,
    /// Estimated completion time; `None` once terminal.
    pub eta: Option<DateTime<FixedOffset>>,
    /// Top-level failure message.
    pub error: Option<String>,
}

/// One line of [`JobController::list_jobs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job id.
    pub job_id: JobId,
    /// Logical work item.
    pub logical_key: String,
    /// Current phase.
    pub phase: JobPhase,
    /// Number of units.
    pub units: usize,
    /// Fraction of steps finished.
    pub progress: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Results of a multi-job run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// One outcome per job, in run order.
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    /// Whether every job completed. True for an empty run.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    /// Outcomes of jobs that did not complete.
    pub fn failed(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Removes the job's pause token when the run ends.
struct RunClaim<'a> {
    registry: &'a Mutex<HashMap<JobId, CancellationToken>>,
    id: JobId,
    token: CancellationToken,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

struct ControllerInner {
    scheduler: ResourceScheduler,
    store: Arc<dyn JobStore>,
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

/// Owns jobs and drives them through the scheduler.
///
/// Clones share state, so one clone may [`pause`](Self::pause) a job another
/// clone is driving.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl JobController {
    /// Controller submitting to `scheduler` and persisting to `store`.
    #[must_use]
    pub fn new(
        scheduler: ResourceScheduler,
        store: Arc<dyn JobStore>,
        config: ControllerConfig,
    ) -> Self {
        let clock = scheduler.clock();
        Self {
            inner: Arc::new(ControllerInner {
                scheduler,
                store,
                config,
                clock,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Scheduler this controller submits to.
    #[must_use]
    pub fn scheduler(&self) -> &ResourceScheduler {
        &self.inner.scheduler
    }

    /// Build a job in `Created`, create its output directories and persist it.
    pub fn create_job(
        &self,
        logical_key: &str,
        units: Vec<UnitSpec>,
        config: JobConfig,
    ) -> Result<Job, ControllerError> {
        if logical_key.trim().is_empty() {
            return Err(ControllerError::InvalidJob("logical key must not be empty".into()));
        }
        if logical_key.contains(['/', '\\']) {
            return Err(ControllerError::InvalidJob(format!(
                "logical key `{logical_key}` must not contain path separators"
            )));
        }
        if units.is_empty() {
            return Err(ControllerError::InvalidJob(format!("job `{logical_key}` has no units")));
        }

        let mut job = Job::new(logical_key, units, config, self.inner.clock.now_utc());
        for dir in ["raw", "mastered", "final"] {
            let path = job.config.output_dir.join(dir);
            std::fs::create_dir_all(&path)
                .map_err(|e| ControllerError::Store(format!("create {}: {e}", path.display())))?;
        }
        self.persist(&mut job)?;
        tracing::info!(
            job = %job.id,
            units = job.units.len(),
            words = job.total_word_count,
            "job created"
        );
        Ok(job)
    }

    /// Load a persisted job.
    pub fn job(&self, id: &JobId) -> Result<Job, ControllerError> {
        self.inner
            .store
            .load(id)?
            .ok_or_else(|| ControllerError::JobNotFound(id.clone()))
    }

    /// Move a created job to `Queued` and submit one produce task per pending
    /// unit at the job's priority.
    pub fn enqueue(&self, id: &JobId) -> Result<Job, ControllerError> {
        let mut job = self.job(id)?;
        self.enqueue_job(&mut job)?;
        Ok(job)
    }

    /// Drive a job until it completes, fails or is paused.
    ///
    /// Created jobs are enqueued first; paused jobs re-enter the phase they
    /// were paused in; terminal jobs are reported without running anything.
    /// Returns `Err` only for persistence and scheduler failures.
    pub async fn run_to_completion(&self, id: &JobId) -> Result<JobOutcome, ControllerError> {
        let mut job = self.job(id)?;
        if job.phase.is_terminal() {
            return Ok(JobOutcome::from_job(&job));
        }
        let claim = self.claim(id)?;
        if job.phase == JobPhase::Created {
            self.enqueue_job(&mut job)?;
        }
        let result = self.drive(&mut job, &claim.token).await;
        if let Err(err) = &result {
            tracing::error!(job = %id, "job run aborted: {err}");
        }
        result
    }

    /// Continue a job loaded from storage at its first unfinished step.
    /// Completed jobs are a successful no-op; failed jobs need
    /// [`reset_failed`](Self::reset_failed) first.
    pub async fn resume(&self, id: &JobId) -> Result<JobOutcome, ControllerError> {
        let job = self.job(id)?;
        match job.phase {
            JobPhase::Completed => {
                tracing::info!(job = %id, "job already completed, nothing to resume");
                Ok(JobOutcome::from_job(&job))
            }
            JobPhase::Failed => Err(ControllerError::NotResumable {
                job: id.clone(),
                phase: job.phase.to_string(),
            }),
            phase => {
                tracing::info!(job = %id, %phase, "resuming job");
                self.run_to_completion(id).await
            }
        }
    }

    /// Request a pause. A job being driven stops at its next step boundary;
    /// an idle job in an active phase is paused immediately.
    pub fn pause(&self, id: &JobId) -> Result<(), ControllerError> {
        if let Some(token) = self.inner.running.lock().get(id) {
            tracing::info!(job = %id, "pause requested");
            token.cancel();
            return Ok(());
        }
        let mut job = self.job(id)?;
        self.pause_job(&mut job).map(|_| ())
    }

    /// Move a failed job back to `Queued`, clearing retries and errors of its
    /// unfinished steps. Completed steps are kept.
    pub fn reset_failed(&self, id: &JobId) -> Result<Job, ControllerError> {
        let mut job = self.job(id)?;
        if job.phase != JobPhase::Failed {
            return Err(ControllerError::InvalidTransition {
                job: id.clone(),
                from: job.phase.to_string(),
                to: JobPhase::Queued.to_string(),
            });
        }
        for unit in &mut job.units {
            unit.reset();
        }
        job.assemble.reset();
        job.error = None;
        job.transition(JobPhase::Queued, self.inner.clock.now_utc())?;
        self.persist(&mut job)?;
        tracing::info!(job = %id, "failed job reset for another run");
        Ok(job)
    }

    /// Progress, phase, per-unit breakdown and ETA.
    pub fn status(&self, id: &JobId) -> Result<JobStatus, ControllerError> {
        let job = self.job(id)?;
        let remaining_minutes = job.remaining_minutes();
        let eta = (!job.phase.is_terminal())
            .then(|| add_minutes(self.inner.clock.now(), remaining_minutes));
        Ok(JobStatus {
            progress: job.progress(),
            units: job
                .units
                .iter()
                .map(|u| UnitStatus {
                    ordinal: u.ordinal,
                    id: u.id.clone(),
                    title: u.title.clone(),
                    state: u.state(),
                    retries: u.retries(),
                    error: u.error().map(str::to_string),
                })
                .collect(),
            remaining_minutes,
            eta,
            job_id: job.id,
            logical_key: job.logical_key,
            phase: job.phase,
            error: job.error,
        })
    }

    /// Every stored job.
    pub fn list_jobs(&self) -> Result<Vec<JobSummary>, ControllerError> {
        Ok(self
            .inner
            .store
            .list()?
            .into_iter()
            .map(|job| JobSummary {
                progress: job.progress(),
                units: job.units.len(),
                job_id: job.id,
                logical_key: job.logical_key,
                phase: job.phase,
                created_at: job.created_at,
            })
            .collect())
    }

    /// Ids of non-terminal jobs.
    pub fn list_active(&self) -> Result<Vec<JobId>, ControllerError> {
        self.inner.store.active_ids()
    }

    /// Drive every job in `Created` or `Queued`, one after another.
    pub async fn run_all_queued(&self) -> Result<RunSummary, ControllerError> {
        let ids: Vec<JobId> = self
            .inner
            .store
            .list()?
            .into_iter()
            .filter(|job| matches!(job.phase, JobPhase::Created | JobPhase::Queued))
            .map(|job| job.id)
            .collect();
        tracing::info!(jobs = ids.len(), "running queued jobs");
        let mut summary = RunSummary::default();
        for id in ids {
            summary.outcomes.push(self.run_to_completion(&id).await?);
        }
        Ok(summary)
    }

    /// Resume every non-terminal job from the active index.
    pub async fn resume_all(&self) -> Result<RunSummary, ControllerError> {
        let ids = self.inner.store.active_ids()?;
        tracing::info!(jobs = ids.len(), "resuming incomplete jobs");
        let mut summary = RunSummary::default();
        for id in ids {
            let job = self.job(&id)?;
            if job.phase.is_terminal() {
                continue;
            }
            summary.outcomes.push(self.resume(&id).await?);
        }
        Ok(summary)
    }

    fn claim(&self, id: &JobId) -> Result<RunClaim<'_>, ControllerError> {
        let mut running = self.inner.running.lock();
        if running.contains_key(id) {
            return Err(ControllerError::AlreadyRunning(id.clone()));
        }
        let token = CancellationToken::new();
        running.insert(id.clone(), token.clone());
        Ok(RunClaim {
            registry: &self.inner.running,
            id: id.clone(),
            token,
        })
    }

    fn persist(&self, job: &mut Job) -> Result<(), ControllerError> {
        job.updated_at = self.inner.clock.now_utc();
        self.inner.store.save(job).map_err(|e| {
            tracing::error!(job = %job.id, "job state write failed: {e}");
            e
        })
    }

    fn enqueue_job(&self, job: &mut Job) -> Result<(), ControllerError> {
        job.transition(JobPhase::Queued, self.inner.clock.now_utc())?;
        let pending: Vec<usize> = job
            .units
            .iter()
            .enumerate()
            .filter(|(_, unit)| unit.produce.state == TaskState::Pending)
            .map(|(idx, _)| idx)
            .collect();
        let requests: Vec<TaskRequest> = pending
            .iter()
            .map(|&idx| request_for(job, StepRef::Produce(idx)))
            .collect();
        let task_ids = self.inner.scheduler.submit_batch(requests)?;
        for (idx, task_id) in pending.iter().zip(task_ids) {
            job.units[*idx].produce.submitted(task_id);
        }
        self.persist(job)?;
        tracing::info!(
            job = %job.id,
            tasks = pending.len(),
            priority = %job.config.priority,
            "job queued"
        );
        Ok(())
    }

    async fn drive(
        &self,
        job: &mut Job,
        token: &CancellationToken,
    ) -> Result<JobOutcome, ControllerError> {
        loop {
            match job.phase {
                JobPhase::Created => self.enqueue_job(job)?,
                JobPhase::Queued => {
                    job.transition(JobPhase::Produce, self.inner.clock.now_utc())?;
                    self.persist(job)?;
                }
                JobPhase::Paused { resume_to } => {
                    job.transition(resume_to.into(), self.inner.clock.now_utc())?;
                    self.persist(job)?;
                }
                JobPhase::Produce | JobPhase::PostProcess => {
                    let producing = job.phase == JobPhase::Produce;
                    match self.run_units(job, producing, token).await? {
                        StepRun::Completed => {
                            let next = if producing {
                                JobPhase::PostProcess
                            } else {
                                JobPhase::Assemble
                            };
                            job.transition(next, self.inner.clock.now_utc())?;
                            self.persist(job)?;
                        }
                        StepRun::Failed(message) => return self.fail(job, message),
                        StepRun::Paused => return self.pause_job(job),
                    }
                }
                JobPhase::Assemble => match self.run_step(job, StepRef::Assemble, token).await? {
                    StepRun::Completed => {
                        job.total_duration_seconds =
                            job.units.iter().filter_map(|u| u.duration_seconds).sum();
                        job.transition(JobPhase::Completed, self.inner.clock.now_utc())?;
                        self.persist(job)?;
                        tracing::info!(
                            job = %job.id,
                            hours = job.total_duration_seconds / 3600.0,
                            "job completed"
                        );
                    }
                    StepRun::Failed(message) => return self.fail(job, message),
                    StepRun::Paused => return self.pause_job(job),
                },
                JobPhase::Completed | JobPhase::Failed => return Ok(JobOutcome::from_job(job)),
            }
        }
    }

    async fn run_units(
        &self,
        job: &mut Job,
        producing: bool,
        token: &CancellationToken,
    ) -> Result<StepRun, ControllerError> {
        for idx in 0..job.units.len() {
            let step = if producing {
                StepRef::Produce(idx)
            } else {
                StepRef::PostProcess(idx)
            };
            match self.run_step(job, step, token).await? {
                StepRun::Completed => {}
                other => return Ok(other),
            }
        }
        Ok(StepRun::Completed)
    }

    /// Run one step to success, exhaustion or pause, retrying in place.
    async fn run_step(
        &self,
        job: &mut Job,
        step: StepRef,
        token: &CancellationToken,
    ) -> Result<StepRun, ControllerError> {
        loop {
            match step_of(job, step).state {
                TaskState::Completed => return Ok(StepRun::Completed),
                TaskState::Failed => return Ok(StepRun::Failed(failure_message(job, step))),
                TaskState::Cancelled => step_mut(job, step).requeue(),
                TaskState::Pending | TaskState::Queued | TaskState::Running => {}
            }
            if token.is_cancelled() {
                return Ok(StepRun::Paused);
            }

            let (current_task, current_state) = {
                let progress = step_of(job, step);
                (progress.task_id, progress.state)
            };
            let task_id = match current_task {
                Some(task_id) if current_state != TaskState::Pending => task_id,
                _ => {
                    let task_id = self.inner.scheduler.submit(request_for(job, step))?;
                    step_mut(job, step).submitted(task_id);
                    task_id
                }
            };
            step_mut(job, step).running(self.inner.clock.now_utc());
            self.persist(job)?;

            match self.await_task(task_id, token).await? {
                Waited::Lost => {
                    tracing::warn!(job = %job.id, step = %label(job, step), task = %task_id, "task unknown to scheduler, resubmitting");
                    step_mut(job, step).requeue();
                    self.persist(job)?;
                }
                Waited::Withdrawn => {
                    step_mut(job, step).requeue();
                    self.persist(job)?;
                    return Ok(StepRun::Paused);
                }
                Waited::Outcome(outcome) if outcome.state == TaskState::Completed => {
                    record_success(job, step, &outcome, self.inner.clock.now_utc());
                    self.persist(job)?;
                    tracing::info!(job = %job.id, step = %label(job, step), "step completed");
                    return Ok(StepRun::Completed);
                }
                Waited::Outcome(outcome) if outcome.state == TaskState::Cancelled => {
                    step_mut(job, step).requeue();
                    self.persist(job)?;
                    if token.is_cancelled() {
                        return Ok(StepRun::Paused);
                    }
                }
                Waited::Outcome(outcome) => {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| format!("task ended in state {}", outcome.state));
                    let spent = retries_spent(job, step);
                    let verdict = step_mut(job, step).failed(
                        error.clone(),
                        spent,
                        self.inner.config.max_retries,
                        self.inner.clock.now_utc(),
                    );
                    self.persist(job)?;
                    match verdict {
                        RetryVerdict::Exhausted => {
                            let message = failure_message(job, step);
                            tracing::error!(job = %job.id, "{message}");
                            return Ok(StepRun::Failed(message));
                        }
                        RetryVerdict::Retry => {
                            tracing::warn!(
                                job = %job.id,
                                step = %label(job, step),
                                retry = retries_spent(job, step),
                                "step failed, retrying: {error}"
                            );
                            self.retry_backoff(token).await;
                        }
                    }
                }
            }
        }
    }

    async fn await_task(
        &self,
        task_id: TaskId,
        token: &CancellationToken,
    ) -> Result<Waited, ControllerError> {
        let wait = self.inner.scheduler.wait(task_id);
        tokio::pin!(wait);
        tokio::select! {
            result = &mut wait => return waited(result),
            () = token.cancelled() => {}
        }
        if self.inner.scheduler.cancel(task_id).is_ok() {
            return Ok(Waited::Withdrawn);
        }
        tracing::info!(task = %task_id, "pause requested, letting running task finish");
        waited(wait.await)
    }

    async fn retry_backoff(&self, token: &CancellationToken) {
        let delay = self.inner.config.retry_backoff();
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => {}
        }
    }

    fn fail(&self, job: &mut Job, message: String) -> Result<JobOutcome, ControllerError> {
        self.withdraw_outstanding(job);
        job.error = Some(message);
        job.transition(JobPhase::Failed, self.inner.clock.now_utc())?;
        self.persist(job)?;
        Ok(JobOutcome::from_job(job))
    }

    fn pause_job(&self, job: &mut Job) -> Result<JobOutcome, ControllerError> {
        let resume_to = job
            .phase
            .active()
            .ok_or_else(|| ControllerError::InvalidTransition {
                job: job.id.clone(),
                from: job.phase.to_string(),
                to: "paused".into(),
            })?;
        self.withdraw_outstanding(job);
        job.transition(JobPhase::Paused { resume_to }, self.inner.clock.now_utc())?;
        self.persist(job)?;
        tracing::info!(job = %job.id, "job paused");
        Ok(JobOutcome::from_job(job))
    }

    /// Cancel queued tasks still attached to the job's steps. Tasks already
    /// running are left to finish and stay attached; tasks that completed
    /// without being awaited are recorded as done.
    fn withdraw_outstanding(&self, job: &mut Job) {
        let scheduler = &self.inner.scheduler;
        let steps: Vec<StepRef> = (0..job.units.len())
            .flat_map(|idx| [StepRef::Produce(idx), StepRef::PostProcess(idx)])
            .chain(std::iter::once(StepRef::Assemble))
            .collect();
        for step in steps {
            let progress = step_of(job, step);
            let Some(task_id) = progress.task_id else { continue };
            if progress.state.is_terminal() {
                continue;
            }
            match scheduler.cancel(task_id) {
                Ok(()) | Err(SchedulerError::TaskNotFound(_)) => step_mut(job, step).requeue(),
                Err(err) => match scheduler.task(task_id).map(|t| t.outcome()) {
                    Some(outcome) if outcome.state == TaskState::Completed => {
                        tracing::debug!(
                            job = %job.id,
                            step = %label(job, step),
                            task = %task_id,
                            "finished unawaited, keeping result"
                        );
                        record_success(job, step, &outcome, self.inner.clock.now_utc());
                    }
                    Some(outcome) if outcome.state.is_terminal() => step_mut(job, step).requeue(),
                    _ => tracing::debug!(task = %task_id, "left outstanding: {err}"),
                },
            }
        }
    }
}

fn waited(result: Result<TaskOutcome, SchedulerError>) -> Result<Waited, ControllerError> {
    match result {
        Ok(outcome) => Ok(Waited::Outcome(outcome)),
        Err(SchedulerError::TaskNotFound(_)) => Ok(Waited::Lost),
        Err(err) => Err(err.into()),
    }
}

fn step_of(job: &Job, step: StepRef) -> &StepProgress {
    match step {
        StepRef::Produce(idx) => &job.units[idx].produce,
        StepRef::PostProcess(idx) => &job.units[idx].post_process,
        StepRef::Assemble => &job.assemble,
    }
}

fn step_mut(job: &mut Job, step: StepRef) -> &mut StepProgress {
    match step {
        StepRef::Produce(idx) => &mut job.units[idx].produce,
        StepRef::PostProcess(idx) => &mut job.units[idx].post_process,
        StepRef::Assemble => &mut job.assemble,
    }
}

/// Retries already charged to the budget `step` draws on.
fn retries_spent(job: &Job, step: StepRef) -> u32 {
    match step {
        StepRef::Produce(idx) | StepRef::PostProcess(idx) => job.units[idx].retries(),
        StepRef::Assemble => job.assemble.retries,
    }
}

fn label(job: &Job, step: StepRef) -> String {
    match step {
        StepRef::Produce(idx) => format!("unit {} produce", job.units[idx].ordinal),
        StepRef::PostProcess(idx) => format!("unit {} post-process", job.units[idx].ordinal),
        StepRef::Assemble => "assemble".to_string(),
    }
}

fn failure_message(job: &Job, step: StepRef) -> String {
    let error = step_of(job, step).error.as_deref().unwrap_or("unknown error");
    let attempts = retries_spent(job, step) + 1;
    match step {
        StepRef::Produce(idx) | StepRef::PostProcess(idx) => {
            let unit = &job.units[idx];
            format!(
                "{} ({}) failed after {attempts} attempts: {error}",
                label(job, step),
                unit.title
            )
        }
        StepRef::Assemble => format!("assemble failed after {attempts} attempts: {error}"),
    }
}

fn request_for(job: &Job, step: StepRef) -> TaskRequest {
    let payload = |output: PathBuf| {
        let mut payload = TaskPayload::new(output);
        payload.inputs.clone_from(&job.config.params);
        payload.with_input("job_id", job.id.as_str())
    };
    let priority = job.config.priority;
    match step {
        StepRef::Produce(idx) => {
            let unit = &job.units[idx];
            TaskRequest::new(
                TaskKind::Synthesis,
                priority,
                payload(job.raw_path(unit))
                    .with_input("unit_id", unit.id.clone())
                    .with_input("ordinal", unit.ordinal)
                    .with_input("title", unit.title.clone())
                    .with_input("word_count", unit.word_count),
            )
            .with_estimate(unit.produce_estimate_minutes())
        }
        StepRef::PostProcess(idx) => {
            let unit = &job.units[idx];
            let source = unit.audio_path.clone().unwrap_or_else(|| job.raw_path(unit));
            TaskRequest::new(
                TaskKind::Mastering,
                priority,
                payload(job.mastered_path(unit))
                    .with_input("unit_id", unit.id.clone())
                    .with_input("ordinal", unit.ordinal)
                    .with_input("source", source.display().to_string()),
            )
            .with_estimate(POST_PROCESS_MINUTES)
        }
        StepRef::Assemble => {
            let sources: Vec<String> = job
                .units
                .iter()
                .map(|u| {
                    u.mastered_path
                        .clone()
                        .unwrap_or_else(|| job.mastered_path(u))
                        .display()
                        .to_string()
                })
                .collect();
            let titles: Vec<String> = job.units.iter().map(|u| u.title.clone()).collect();
            TaskRequest::new(
                TaskKind::Packaging,
                priority,
                payload(job.assembled_path())
                    .with_input("logical_key", job.logical_key.clone())
                    .with_input("sources", sources)
                    .with_input("titles", titles),
            )
            .with_estimate(ASSEMBLE_MINUTES)
        }
    }
}

fn record_success(job: &mut Job, step: StepRef, outcome: &TaskOutcome, now: DateTime<Utc>) {
    match step {
        StepRef::Produce(idx) => {
            let path = job.raw_path(&job.units[idx]);
            let unit = &mut job.units[idx];
            unit.audio_path = Some(path);
            unit.duration_seconds = Some(
                outcome
                    .produced_seconds
                    .unwrap_or_else(|| unit.estimated_duration_seconds()),
            );
            unit.produce.succeeded(now);
        }
        StepRef::PostProcess(idx) => {
            let path = job.mastered_path(&job.units[idx]);
            let unit = &mut job.units[idx];
            unit.mastered_path = Some(path);
            if let Some(seconds) = outcome.produced_seconds {
                unit.duration_seconds = Some(seconds);
            }
            unit.post_process.succeeded(now);
        }
        StepRef::Assemble => {
            job.final_path = Some(job.assembled_path());
            job.assemble.succeeded(now);
        }
    }
}
