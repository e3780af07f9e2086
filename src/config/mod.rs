//! Configuration models for the scheduler, the job controller and storage.

pub mod app;
pub mod scheduler;

pub use app::AppConfig;
pub use scheduler::{ControllerConfig, SchedulerConfig};
