//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nightshift::config::{ControllerConfig, SchedulerConfig};
use nightshift::core::{
    DeviceStats, HandlerError, HandlerRegistry, QueueSnapshot, QueueStore, ResourceScheduler,
    SchedulerError, StaticProbe, TaskContext, TaskHandler, TaskReport,
};
use nightshift::infra::{InMemoryJobStore, InMemoryQueue, InMemoryQueueStore};
use nightshift::job::{Job, JobController, JobId, JobStore, UnitSpec};
use nightshift::util::{ManualClock, TaskId, TaskKind};
use parking_lot::Mutex;

type FailureKey = (TaskKind, Option<u64>);

/// One handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub ordinal: Option<u64>,
    pub label: Option<String>,
}

/// Handler that records every call and fails or blocks on request.
///
/// Units are matched by the `ordinal` input, scheduler-only tasks by `label`.
/// Failures are scripted per `(kind, ordinal)`; job-level steps such as
/// assembly carry no ordinal.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    calls: Arc<Mutex<Vec<Call>>>,
    failures_left: Arc<Mutex<HashMap<FailureKey, u32>>>,
    always_fail: Arc<Mutex<HashSet<FailureKey>>>,
    blocked: Arc<Mutex<HashSet<u64>>>,
    delay: Duration,
    seconds: Option<f64>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report this media duration on success.
    pub fn with_seconds(mut self, seconds: f64) -> Self {
        self.seconds = Some(seconds);
        self
    }

    /// Fail the first `times` calls of `kind` for unit `ordinal`.
    pub fn fail_times(&self, kind: TaskKind, ordinal: Option<u64>, times: u32) {
        self.failures_left.lock().insert((kind, ordinal), times);
    }

    /// Fail every call of `kind` for unit `ordinal`.
    pub fn fail_always(&self, kind: TaskKind, ordinal: Option<u64>) {
        self.always_fail.lock().insert((kind, ordinal));
    }

    /// Never return from calls for unit `ordinal`.
    pub fn block(&self, ordinal: u64) {
        self.blocked.lock().insert(ordinal);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, kind: TaskKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    pub fn count(&self, kind: TaskKind, ordinal: u64) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.kind == kind && c.ordinal == Some(ordinal))
            .count()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls().into_iter().filter_map(|c| c.label).collect()
    }

    /// Registry routing every kind used by jobs to this handler.
    pub fn registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for kind in TaskKind::ALL {
            registry.register(kind, Arc::new(self.clone()));
        }
        registry
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn run(&self, ctx: TaskContext<'_>) -> Result<TaskReport, HandlerError> {
        let ordinal = ctx
            .payload
            .inputs
            .get("ordinal")
            .and_then(serde_json::Value::as_u64);
        let label = ctx
            .payload
            .inputs
            .get("label")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        self.calls.lock().push(Call {
            task_id: ctx.task_id,
            kind: ctx.kind,
            ordinal,
            label,
        });
        ctx.progress.report(0.5);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let blocked = ordinal.is_some_and(|o| self.blocked.lock().contains(&o));
        if blocked {
            std::future::pending::<()>().await;
        }
        match self.scripted_failure(ctx.kind, ordinal) {
            Some(err) => Err(err),
            None => Ok(self.report()),
        }
    }
}

impl ScriptedHandler {
    fn report(&self) -> TaskReport {
        TaskReport {
            produced_seconds: self.seconds,
        }
    }

    fn scripted_failure(&self, kind: TaskKind, ordinal: Option<u64>) -> Option<HandlerError> {
        let key = (kind, ordinal);
        let who = ordinal.map_or_else(|| kind.to_string(), |o| format!("{kind} of unit {o}"));
        if self.always_fail.lock().contains(&key) {
            return Some(HandlerError::failed(format!("{who} is broken")));
        }
        let mut failures = self.failures_left.lock();
        let left = failures.get_mut(&key)?;
        if *left == 0 {
            return None;
        }
        *left -= 1;
        Some(HandlerError::failed(format!("{who} flaked")))
    }
}

/// Queue store whose writes can be switched off.
#[derive(Debug, Default)]
pub struct FlakyQueueStore {
    inner: InMemoryQueueStore,
    broken: Mutex<bool>,
}

impl FlakyQueueStore {
    pub fn break_writes(&self) {
        *self.broken.lock() = true;
    }
}

impl QueueStore for FlakyQueueStore {
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), SchedulerError> {
        if *self.broken.lock() {
            return Err(SchedulerError::Persistence("disk full".into()));
        }
        self.inner.save(snapshot)
    }

    fn load(&self) -> Result<Option<QueueSnapshot>, SchedulerError> {
        self.inner.load()
    }
}

/// Idle 16GB device at a comfortable temperature.
pub fn idle_probe() -> Arc<StaticProbe> {
    let mut stats = DeviceStats::idle("test-gpu", 16.0);
    stats.temperature_c = 45.0;
    Arc::new(StaticProbe::new(stats))
}

/// Scheduler config with a short idle backoff.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default().with_poll_backoff(Duration::from_millis(10))
}

/// Controller config with no pause between retries.
pub fn retry_config(max_retries: u32) -> ControllerConfig {
    ControllerConfig::default()
        .with_max_retries(max_retries)
        .with_retry_backoff(Duration::ZERO)
}

/// Scheduler over in-memory storage at midday.
pub fn scheduler(
    config: SchedulerConfig,
    store: Arc<dyn QueueStore>,
    handlers: HandlerRegistry,
) -> ResourceScheduler {
    scheduler_at(config, store, handlers, idle_probe(), ManualClock::at_hour(12))
}

pub fn scheduler_at(
    config: SchedulerConfig,
    store: Arc<dyn QueueStore>,
    handlers: HandlerRegistry,
    probe: Arc<StaticProbe>,
    clock: ManualClock,
) -> ResourceScheduler {
    nightshift::util::init_tracing();
    ResourceScheduler::new(
        config,
        InMemoryQueue::new(),
        store,
        probe,
        Arc::new(clock),
        handlers,
    )
    .unwrap()
}

/// Run the scheduler loop in the background.
pub fn spawn_loop(
    scheduler: &ResourceScheduler,
) -> tokio::task::JoinHandle<Result<(), SchedulerError>> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.run_loop().await })
}

/// Controller plus the pieces tests poke at.
pub struct Harness {
    pub controller: JobController,
    pub scheduler: ResourceScheduler,
    pub jobs: Arc<InMemoryJobStore>,
    pub handler: ScriptedHandler,
    pub out: tempfile::TempDir,
}

impl Harness {
    pub fn new(handler: ScriptedHandler, max_retries: u32) -> Self {
        Self::with_store(handler, max_retries, Arc::new(InMemoryJobStore::new()))
    }

    pub fn with_store(
        handler: ScriptedHandler,
        max_retries: u32,
        jobs: Arc<InMemoryJobStore>,
    ) -> Self {
        let scheduler = scheduler(
            fast_config(),
            Arc::new(InMemoryQueueStore::new()),
            handler.registry(),
        );
        let controller = JobController::new(
            scheduler.clone(),
            Arc::clone(&jobs) as Arc<dyn JobStore>,
            retry_config(max_retries),
        );
        Self {
            controller,
            scheduler,
            jobs,
            handler,
            out: tempfile::tempdir().unwrap(),
        }
    }

    pub fn units(count: u32) -> Vec<UnitSpec> {
        (1..=count)
            .map(|n| UnitSpec::new(format!("Chapter {n}"), 1_500))
            .collect()
    }

    pub fn create(&self, key: &str, units: u32) -> Job {
        self.controller
            .create_job(
                key,
                Self::units(units),
                nightshift::job::JobConfig::new(self.out.path()),
            )
            .unwrap()
    }

    pub fn stored(&self, id: &JobId) -> Job {
        self.jobs.load(id).unwrap().unwrap()
    }

    /// Poll the job store until `ready` holds.
    pub async fn wait_until(&self, id: &JobId, ready: impl Fn(&Job) -> bool) {
        for _ in 0..500 {
            if ready(&self.stored(id)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached the expected state");
    }
}
