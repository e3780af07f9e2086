//! Handler contract between the scheduler and the collaborators that do the
//! actual device work (synthesis, image generation, mastering, packaging).
//!
//! Given a task kind, its payload and an output path, a handler produces the
//! artifact at that path or returns a typed [`HandlerError`]. The scheduler
//! never inspects artifact contents.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{DeviceLease, HandlerError, TaskPayload};
use crate::util::{TaskId, TaskKind};

/// Callback used by handlers to publish fractional progress.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(f64) + Send + Sync>,
}

impl ProgressReporter {
    /// Reporter forwarding clamped fractions to `sink`.
    pub fn new(sink: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self { sink: Arc::new(sink) }
    }

    /// Reporter that discards updates.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Publish progress. Values are clamped to `[0, 1]`; NaN is ignored.
    pub fn report(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        (self.sink)(fraction.clamp(0.0, 1.0));
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Everything a handler receives for one execution.
#[derive(Debug)]
pub struct TaskContext<'a> {
    /// Task being executed.
    pub task_id: TaskId,
    /// Work category.
    pub kind: TaskKind,
    /// Inputs and output location.
    pub payload: &'a TaskPayload,
    /// Device slot held for the duration of the run.
    pub lease: &'a DeviceLease,
    /// Progress callback.
    pub progress: ProgressReporter,
}

/// Optional facts a handler reports about what it produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskReport {
    /// Duration of produced media in seconds, when applicable.
    pub produced_seconds: Option<f64>,
}

impl TaskReport {
    /// Report carrying a produced media duration.
    #[must_use]
    pub const fn with_duration(seconds: f64) -> Self {
        Self {
            produced_seconds: Some(seconds),
        }
    }
}

/// Abstraction for executing one task kind.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use nightshift::core::{HandlerError, TaskContext, TaskHandler, TaskReport};
///
/// struct Mastering;
///
/// #[async_trait]
/// impl TaskHandler for Mastering {
///     async fn run(&self, ctx: TaskContext<'_>) -> Result<TaskReport, HandlerError> {
///         tokio::fs::copy(&ctx.payload.inputs["source"].as_str().unwrap(), &ctx.payload.output_path).await?;
///         Ok(TaskReport::default())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Produce the artifact at `ctx.payload.output_path`.
    async fn run(&self, ctx: TaskContext<'_>) -> Result<TaskReport, HandlerError>;
}

/// Handlers keyed by task kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, kind: TaskKind, handler: impl TaskHandler) -> Self {
        self.register(kind, Arc::new(handler));
        self
    }

    /// Register a shared handler for `kind`. Returns the handler it replaced.
    pub fn register(
        &mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.insert(kind, handler)
    }

    /// Handler for `kind`, if any.
    #[must_use]
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Kinds with a registered handler.
    #[must_use]
    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Instance-owned, lazily loaded model handle.
///
/// Handlers that keep an expensive model resident (a speech model, a
/// diffusion pipeline) own one of these instead of a module-level global, so
/// two schedulers or two test harnesses never share loaded state.
#[derive(Debug)]
pub struct ModelSlot<M> {
    inner: tokio::sync::Mutex<Option<M>>,
}

impl<M> Default for ModelSlot<M> {
    fn default() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(None),
        }
    }
}

impl<M: Send> ModelSlot<M> {
    /// Empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the model, loading it with `load` if the slot is empty. The
    /// guard keeps other users out until it is dropped.
    pub async fn acquire<F, Fut>(&self, load: F) -> Result<ModelGuard<'_, M>, HandlerError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<M, HandlerError>> + Send,
    {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(load().await?);
        }
        Ok(ModelGuard { guard })
    }

    /// Drop the loaded model, freeing its device memory.
    pub async fn release(&self) -> bool {
        self.inner.lock().await.take().is_some()
    }

    /// Whether a model is currently loaded.
    pub async fn is_loaded(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

/// Scoped access to a loaded model.
pub struct ModelGuard<'a, M> {
    guard: tokio::sync::MutexGuard<'a, Option<M>>,
}

impl<M> std::ops::Deref for ModelGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        // Only constructed after the slot was filled.
        self.guard.as_ref().unwrap_or_else(|| unreachable!("model slot emptied while borrowed"))
    }
}

impl<M> std::ops::DerefMut for ModelGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.guard.as_mut().unwrap_or_else(|| unreachable!("model slot emptied while borrowed"))
    }
}
