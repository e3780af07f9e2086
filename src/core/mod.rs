//! Core scheduling abstractions: task model, admission control, device
//! telemetry, handler contract and the resource scheduler.

pub mod admission;
pub mod audit;
pub mod device;
pub mod error;
pub mod handler;
pub mod lease;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use admission::{evaluate, in_overnight_window, Admission, Refusal};
pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink};
pub use device::{parse_smi_line, DeviceProbe, DeviceStats, NvidiaSmiProbe, StaticProbe};
pub use error::{AppResult, HandlerError, SchedulerError};
pub use handler::{
    HandlerRegistry, ModelGuard, ModelSlot, ProgressReporter, TaskContext, TaskHandler,
    TaskReport,
};
pub use lease::{DeviceLease, SlotCounter};
pub use queue::{QueueSnapshot, QueueStore, TaskQueue};
pub use scheduler::{CompletionEstimate, ResourceScheduler, SchedulerStatus};
pub use task::{
    Task, TaskOutcome, TaskPayload, TaskRequest, TaskState, DEFAULT_ESTIMATE_MINUTES,
};
