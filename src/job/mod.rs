//! Multi-phase batch jobs built on the resource scheduler.

pub mod controller;
pub mod error;
pub mod model;
pub mod store;

pub use controller::{
    JobController, JobOutcome, JobStatus, JobSummary, RunSummary, UnitFailure, UnitStatus,
};
pub use error::ControllerError;
pub use model::{
    ActivePhase, Job, JobConfig, JobId, JobPhase, RetryVerdict, StepProgress, Unit, UnitSpec,
};
pub use store::JobStore;
