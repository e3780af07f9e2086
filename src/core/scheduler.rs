//! Resource-aware task scheduler.
//!
//! The scheduler is the only component that dispatches work to the device.
//! Pending tasks wait in a priority-ordered queue; a cooperative run loop
//! samples fresh telemetry on every pass, admits the first task that clears
//! [`evaluate`](crate::core::evaluate), runs it through the registered
//! [`TaskHandler`](crate::core::TaskHandler) and records the outcome.
//!
//! Concurrency is counted lock-free through [`SlotCounter`]; queue, running
//! and finished tasks share one `parking_lot::Mutex`. Every queue mutation is
//! followed by a snapshot write, and a snapshot that cannot be written stops
//! the run loop with [`SchedulerError::Persistence`].
//!
//! The scheduler never retries. A handler error, timeout, panic or missing
//! handler marks the task `Failed` and delivers the outcome to waiters.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinSet;

use crate::config::SchedulerConfig;
use crate::core::{
    build_audit_event, evaluate, Admission, AuditSink, DeviceLease, DeviceProbe, DeviceStats,
    HandlerError, HandlerRegistry, ProgressReporter, QueueSnapshot, QueueStore, SchedulerError,
    SlotCounter, Task, TaskContext, TaskOutcome, TaskQueue, TaskReport, TaskRequest, TaskState,
};
use crate::util::clock::add_minutes;
use crate::util::{Clock, TaskId, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Forever,
    UntilIdle,
}

/// Counters and telemetry reported by [`ResourceScheduler::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Tasks waiting in the queue.
    pub pending: usize,
    /// Tasks currently executing.
    pub running: usize,
    /// Tasks finished successfully.
    pub completed: u64,
    /// Tasks finished with an error.
    pub failed: u64,
    /// Tasks removed from the queue before they started.
    pub cancelled: u64,
    /// Fresh device snapshot.
    pub telemetry: DeviceStats,
    /// Task at the head of the queue, if any.
    pub next_task: Option<TaskId>,
    /// Admission decision for the head task at the time of the call.
    pub next_admission: Option<Admission>,
}

/// Wall-clock estimate of when the current workload drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEstimate {
    /// Queued plus running tasks.
    pub tasks_remaining: usize,
    /// Remaining estimated work in minutes.
    pub total_minutes: f64,
    /// Current time plus the remaining work.
    pub completion_at: DateTime<FixedOffset>,
}

/// Terminal tasks kept for late `wait` and `task` calls, oldest evicted
/// first once `capacity` is reached.
struct FinishedTasks {
    tasks: HashMap<TaskId, Task>,
    order: VecDeque<TaskId>,
    capacity: usize,
}

impl FinishedTasks {
    fn new(capacity: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, task: Task) {
        while self.order.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            self.tasks.remove(&oldest);
        }
        self.order.push_back(task.id);
        self.tasks.insert(task.id, task);
    }

    fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }
}

struct SchedulerState {
    queue: Box<dyn TaskQueue>,
    running: HashMap<TaskId, Task>,
    finished: FinishedTasks,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<TaskOutcome>>>,
    completed_count: u64,
    failed_count: u64,
    cancelled_count: u64,
}

impl SchedulerState {
    fn snapshot(&self, now: DateTime<Utc>) -> QueueSnapshot {
        let mut pending: Vec<Task> = self
            .running
            .values()
            .cloned()
            .map(|mut task| {
                task.state = TaskState::Queued;
                task.progress = 0.0;
                task.started_at = None;
                task
            })
            .collect();
        pending.extend(self.queue.tasks().iter().cloned());
        pending.sort_by_key(Task::order_key);
        QueueSnapshot {
            pending_tasks: pending,
            completed_count: self.completed_count,
            saved_at: now,
        }
    }

    fn lookup(&self, id: TaskId) -> Option<&Task> {
        self.running
            .get(&id)
            .or_else(|| self.finished.get(&id))
            .or_else(|| self.queue.tasks().iter().find(|t| t.id == id))
    }
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    slots: SlotCounter,
    wake: Arc<Notify>,
    stopping: AtomicBool,
    halted: AtomicBool,
    seq: AtomicU64,
    probe: Arc<dyn DeviceProbe>,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry,
    store: Arc<dyn QueueStore>,
    audit: Mutex<Option<Box<dyn AuditSink>>>,
}

impl Inner {
    fn persist(&self, state: &SchedulerState, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.store.save(&state.snapshot(now)).map_err(|e| {
            tracing::error!("queue snapshot write failed: {e}");
            e
        })
    }

    fn record_audit(&self, task_id: TaskId, kind: TaskKind, action: &str, detail: Option<String>) {
        if let Some(sink) = self.audit.lock().as_mut() {
            sink.record(build_audit_event(task_id, kind, action, detail));
        }
    }

    fn finish(
        &self,
        id: TaskId,
        kind: TaskKind,
        result: Result<TaskReport, HandlerError>,
    ) -> Result<(), SchedulerError> {
        let now = self.clock.now_utc();
        let (outcome, waiters) = {
            let mut st = self.state.lock();
            let mut task = st.running.remove(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            match result {
                Ok(report) => {
                    task.produced_seconds = report.produced_seconds;
                    task.transition(TaskState::Completed, now)?;
                    st.completed_count += 1;
                }
                Err(err) => {
                    task.error = Some(err.to_string());
                    task.transition(TaskState::Failed, now)?;
                    st.failed_count += 1;
                }
            }
            let outcome = task.outcome();
            let waiters = st.waiters.remove(&id).unwrap_or_default();
            st.finished.insert(task);
            self.persist(&st, now)?;
            (outcome, waiters)
        };

        match &outcome.error {
            None => {
                tracing::info!(task = %id, %kind, "task completed");
                self.record_audit(id, kind, "complete", None);
            }
            Some(reason) => {
                tracing::warn!(task = %id, %kind, "task failed: {reason}");
                self.record_audit(id, kind, "fail", Some(reason.clone()));
            }
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        Ok(())
    }
}

/// Priority queue plus admission-controlled run loop for one device.
///
/// Cloning is cheap; clones share the same queue and run state, so one clone
/// can drive [`run_loop`](Self::run_loop) while others submit and wait.
#[derive(Clone)]
pub struct ResourceScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResourceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScheduler")
            .field("config", &self.inner.config)
            .field("active_slots", &self.inner.slots.active())
            .finish_non_exhaustive()
    }
}

impl ResourceScheduler {
    /// Create a scheduler from components. When `config.restore_pending` is
    /// set, tasks left in the stored snapshot are queued again with their
    /// original ids and order.
    pub fn new(
        config: SchedulerConfig,
        queue: impl TaskQueue + 'static,
        store: Arc<dyn QueueStore>,
        probe: Arc<dyn DeviceProbe>,
        clock: Arc<dyn Clock>,
        handlers: HandlerRegistry,
    ) -> Result<Self, SchedulerError> {
        config
            .validate()
            .map_err(|e| SchedulerError::Backend(format!("config invalid: {e}")))?;

        let mut state = SchedulerState {
            queue: Box::new(queue),
            running: HashMap::new(),
            finished: FinishedTasks::new(config.finished_retention),
            waiters: HashMap::new(),
            completed_count: 0,
            failed_count: 0,
            cancelled_count: 0,
        };
        let mut seq = 0_u64;
        if config.restore_pending {
            if let Some(snapshot) = store.load()? {
                tracing::info!(
                    "restoring {} pending tasks from queue snapshot saved at {}",
                    snapshot.pending_tasks.len(),
                    snapshot.saved_at
                );
                state.completed_count = snapshot.completed_count;
                let mut pending = snapshot.pending_tasks;
                pending.sort_by_key(Task::order_key);
                for mut task in pending {
                    task.state = TaskState::Queued;
                    task.progress = 0.0;
                    task.started_at = None;
                    task.seq = seq;
                    seq += 1;
                    state.queue.enqueue(task);
                }
            }
        }

        let wake = Arc::new(Notify::new());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                slots: SlotCounter::new(Arc::clone(&wake)),
                wake,
                stopping: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                seq: AtomicU64::new(seq),
                probe,
                clock,
                handlers,
                store,
                audit: Mutex::new(None),
            }),
        })
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(self, audit: Box<dyn AuditSink>) -> Self {
        *self.inner.audit.lock() = Some(audit);
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Clock the scheduler reads time from.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Queue one task. Never blocks on the device.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId, SchedulerError> {
        self.submit_batch([request])?
            .pop()
            .ok_or_else(|| SchedulerError::Backend("submit produced no task id".into()))
    }

    /// Queue several tasks in order with a single snapshot write.
    pub fn submit_batch<I>(&self, requests: I) -> Result<Vec<TaskId>, SchedulerError>
    where
        I: IntoIterator<Item = TaskRequest>,
    {
        let now = self.inner.clock.now_utc();
        let mut submitted = Vec::new();
        {
            let mut st = self.inner.state.lock();
            for request in requests {
                let memory_gb = self.inner.config.memory_cost_gb(request.kind);
                let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                let mut task = Task::from_request(request, memory_gb, seq, now);
                task.transition(TaskState::Queued, now)?;
                submitted.push((task.id, task.kind, task.priority));
                st.queue.enqueue(task);
            }
            if let Err(err) = self.inner.persist(&st, now) {
                for (id, ..) in &submitted {
                    st.queue.remove(*id);
                }
                return Err(err);
            }
        }

        for (id, kind, priority) in &submitted {
            tracing::info!(task = %id, %kind, %priority, "task submitted");
            self.inner.record_audit(*id, *kind, "submit", None);
        }
        if !submitted.is_empty() {
            self.inner.wake.notify_one();
        }
        Ok(submitted.into_iter().map(|(id, ..)| id).collect())
    }

    /// Remove a queued task. Running and finished tasks cannot be cancelled.
    pub fn cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        let now = self.inner.clock.now_utc();
        let (outcome, waiters, kind) = {
            let mut st = self.inner.state.lock();
            let Some(mut task) = st.queue.remove(id) else {
                return Err(st.lookup(id).map_or(SchedulerError::TaskNotFound(id), |t| {
                    SchedulerError::InvalidTransition {
                        task: id,
                        from: t.state.to_string(),
                        to: TaskState::Cancelled.to_string(),
                    }
                }));
            };
            task.transition(TaskState::Cancelled, now)?;
            st.cancelled_count += 1;
            let outcome = task.outcome();
            let kind = task.kind;
            let waiters = st.waiters.remove(&id).unwrap_or_default();
            st.finished.insert(task);
            self.inner.persist(&st, now)?;
            (outcome, waiters, kind)
        };

        tracing::info!(task = %id, %kind, "task cancelled");
        self.inner.record_audit(id, kind, "cancel", None);
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        Ok(())
    }

    /// Wait for a task to reach a terminal state.
    ///
    /// Returns immediately for retained finished tasks. Fails with
    /// [`SchedulerError::TaskNotFound`] for ids this scheduler never saw and
    /// with [`SchedulerError::Stopped`] if the run loop exits first.
    pub async fn wait(&self, id: TaskId) -> Result<TaskOutcome, SchedulerError> {
        let receiver = {
            let mut st = self.inner.state.lock();
            if let Some(task) = st.finished.get(&id) {
                return Ok(task.outcome());
            }
            if !st.running.contains_key(&id) && !st.queue.contains(id) {
                return Err(SchedulerError::TaskNotFound(id));
            }
            if self.inner.halted.load(Ordering::Acquire) {
                return Err(SchedulerError::Stopped(id));
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.entry(id).or_default().push(tx);
            rx
        };
        receiver.await.map_err(|_| SchedulerError::Stopped(id))
    }

    /// Copy of a task in any state. Finished tasks are only kept up to
    /// `finished_retention`.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.inner.state.lock().lookup(id).cloned()
    }

    /// Finished tasks currently retained.
    #[must_use]
    pub fn retained_finished(&self) -> usize {
        self.inner.state.lock().finished.len()
    }

    /// Queued tasks in scheduling order.
    #[must_use]
    pub fn pending(&self) -> Vec<Task> {
        self.inner.state.lock().queue.tasks().to_vec()
    }

    /// Decide whether `task` may start right now, against fresh telemetry.
    pub async fn admission_check(&self, task: &Task) -> Admission {
        let stats = self.inner.probe.sample().await;
        let now = self.inner.clock.now();
        evaluate(task, &stats, now, self.inner.slots.active(), &self.inner.config)
    }

    /// Run until [`stop`](Self::stop) is called. Sleeps `poll_backoff_ms`
    /// between passes that admit nothing and wakes early on submit or slot
    /// release. Returns `Err` only on a persistence failure.
    pub async fn run_loop(&self) -> Result<(), SchedulerError> {
        self.drive(Drain::Forever).await
    }

    /// Run until the queue is empty and nothing is running.
    pub async fn run_until_empty(&self) -> Result<(), SchedulerError> {
        self.drive(Drain::UntilIdle).await
    }

    /// Stop admitting tasks. Running tasks finish normally; the loop returns
    /// once they have. Only a loop that is already running is affected; a
    /// later `run_loop` starts fresh.
    pub fn stop(&self) {
        tracing::info!("scheduler stop requested");
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Queue counters, fresh telemetry and the head task's admission decision.
    pub async fn status(&self) -> SchedulerStatus {
        let telemetry = self.inner.probe.sample().await;
        let now = self.inner.clock.now();
        let running_slots = self.inner.slots.active();
        let st = self.inner.state.lock();
        let head = st.queue.tasks().first();
        SchedulerStatus {
            pending: st.queue.len(),
            running: st.running.len(),
            completed: st.completed_count,
            failed: st.failed_count,
            cancelled: st.cancelled_count,
            next_task: head.map(|t| t.id),
            next_admission: head
                .map(|t| evaluate(t, &telemetry, now, running_slots, &self.inner.config)),
            telemetry,
        }
    }

    /// Remaining estimated minutes of queued tasks plus the unfinished
    /// fraction of running ones, added to the current time.
    #[must_use]
    pub fn estimate_completion(&self) -> CompletionEstimate {
        let now = self.inner.clock.now();
        let st = self.inner.state.lock();
        let total_minutes: f64 = st
            .queue
            .tasks()
            .iter()
            .chain(st.running.values())
            .map(Task::remaining_minutes)
            .sum();
        CompletionEstimate {
            tasks_remaining: st.queue.len() + st.running.len(),
            total_minutes,
            completion_at: add_minutes(now, total_minutes),
        }
    }

    async fn drive(&self, mode: Drain) -> Result<(), SchedulerError> {
        self.inner.stopping.store(false, Ordering::Release);
        self.inner.halted.store(false, Ordering::Release);
        let result = self.drive_passes(mode).await;
        if result.is_err() || self.inner.stopping.load(Ordering::Acquire) {
            self.inner.halted.store(true, Ordering::Release);
            self.inner.state.lock().waiters.clear();
        }
        if let Err(err) = &result {
            tracing::error!("scheduler run loop aborted: {err}");
        }
        result
    }

    async fn drive_passes(&self, mode: Drain) -> Result<(), SchedulerError> {
        let mut in_flight: JoinSet<Result<(), SchedulerError>> = JoinSet::new();
        loop {
            let stopping = self.inner.stopping.load(Ordering::Acquire);
            if !stopping {
                if let Some((task, lease)) = self.admit_next().await? {
                    in_flight.spawn(execute(Arc::clone(&self.inner), task, lease));
                    continue;
                }
            }

            if in_flight.is_empty() {
                if stopping {
                    tracing::info!("scheduler drained and stopped");
                    return Ok(());
                }
                if mode == Drain::UntilIdle && self.inner.state.lock().queue.is_empty() {
                    tracing::debug!("queue empty, run finished");
                    return Ok(());
                }
            }

            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    joined.map_err(|e| SchedulerError::Backend(format!("task execution aborted: {e}")))??;
                }
                () = self.inner.wake.notified(), if !stopping => {}
                () = tokio::time::sleep(self.inner.config.poll_backoff()), if !stopping => {}
            }
        }
    }

    /// Admit the first queued task that passes admission and reserve its slot.
    async fn admit_next(&self) -> Result<Option<(Task, DeviceLease)>, SchedulerError> {
        let candidates = self.inner.state.lock().queue.tasks().to_vec();
        if candidates.is_empty() {
            return Ok(None);
        }
        let stats = self.inner.probe.sample().await;
        let now = self.inner.clock.now();

        for candidate in &candidates {
            let decision = evaluate(
                candidate,
                &stats,
                now,
                self.inner.slots.active(),
                &self.inner.config,
            );
            if let Admission::Refused(refusal) = decision {
                tracing::debug!(task = %candidate.id, "not admitted: {refusal}");
                continue;
            }
            let Some(lease) = self
                .inner
                .slots
                .try_acquire(self.inner.config.max_concurrent, candidate.memory_gb)
            else {
                continue;
            };

            let started = now.with_timezone(&Utc);
            let mut st = self.inner.state.lock();
            // Cancelled between the scan and now.
            let Some(mut task) = st.queue.remove(candidate.id) else {
                continue;
            };
            task.transition(TaskState::Running, started)?;
            st.running.insert(task.id, task.clone());
            self.inner.persist(&st, started)?;
            drop(st);

            tracing::info!(
                task = %task.id,
                kind = %task.kind,
                priority = %task.priority,
                memory_gb = task.memory_gb,
                "task started"
            );
            self.inner.record_audit(task.id, task.kind, "start", None);
            return Ok(Some((task, lease)));
        }
        Ok(None)
    }
}

async fn execute(inner: Arc<Inner>, task: Task, lease: DeviceLease) -> Result<(), SchedulerError> {
    let id = task.id;
    let kind = task.kind;
    let timeout = inner.config.task_timeout();

    let result = match inner.handlers.get(kind) {
        None => Err(HandlerError::NoHandler(kind)),
        Some(handler) => {
            let progress = {
                let inner = Arc::clone(&inner);
                ProgressReporter::new(move |fraction| {
                    if let Some(running) = inner.state.lock().running.get_mut(&id) {
                        running.progress = fraction;
                    }
                })
            };
            let payload = task.payload;
            let run = tokio::spawn(async move {
                let ctx = TaskContext {
                    task_id: id,
                    kind,
                    payload: &payload,
                    lease: &lease,
                    progress,
                };
                tokio::time::timeout(timeout, handler.run(ctx)).await
            });
            match run.await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(HandlerError::Timeout(timeout)),
                Err(join) => Err(HandlerError::failed(format!("handler panicked: {join}"))),
            }
        }
    };

    inner.finish(id, kind, result)
}
