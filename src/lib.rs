//! # Nightshift
//!
//! Resource-aware task scheduling for a single accelerator, plus a controller
//! that drives long multi-phase batch jobs through it.
//!
//! A workstation with one GPU runs everything from speech synthesis to image
//! generation. Those workloads share scarce device memory, heat the card and
//! take hours, so they cannot simply be fired off as they arrive. Nightshift
//! parks work in a priority queue and starts a task only when the device can
//! take it.
//!
//! ## Key Features
//!
//! - **Admission control**: free memory, temperature ceiling, overnight window
//!   and a concurrency limit are checked against fresh telemetry before every
//!   start
//! - **Priority tiers**: `critical` through `overnight`, FIFO within a tier
//! - **Durable queue**: every queue mutation is snapshotted and pending work
//!   can be restored after a restart
//! - **Job controller**: jobs split into units move through produce,
//!   post-process and assemble phases with bounded per-unit retries
//! - **Crash resume**: job state is persisted after every step, so a restarted
//!   process continues at the first unfinished step
//!
//! ## Wiring
//!
//! ```rust,ignore
//! use nightshift::builders::build_runtime;
//! use nightshift::config::AppConfig;
//! use nightshift::core::HandlerRegistry;
//! use nightshift::util::TaskKind;
//!
//! let cfg = AppConfig::from_env()?;
//! let handlers = HandlerRegistry::new()
//!     .with(TaskKind::Synthesis, my_tts)
//!     .with(TaskKind::Mastering, my_mastering)
//!     .with(TaskKind::Packaging, my_packager);
//! let runtime = build_runtime(&cfg, handlers)?;
//! let run_loop = runtime.spawn_scheduler();
//!
//! let job = runtime.controller.create_job("dracula", units, JobConfig::new(out).overnight())?;
//! let outcome = runtime.controller.run_to_completion(&job.id).await?;
//! runtime.scheduler.stop();
//! run_loop.await??;
//! ```
//!
//! For complete flows, see `tests/controller_test.rs`.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders wiring a runtime from configuration.
pub mod builders;
/// Configuration models for the scheduler and the job controller.
pub mod config;
/// Scheduling core: tasks, admission, telemetry, handlers and the run loop.
pub mod core;
/// Infrastructure adapters for queue snapshots and job storage.
pub mod infra;
/// Multi-phase batch jobs driven through the scheduler.
pub mod job;
/// Shared utilities.
pub mod util;

pub use crate::builders::{build_runtime, Runtime};
pub use crate::config::AppConfig;
pub use crate::core::{ResourceScheduler, SchedulerError};
pub use crate::job::{ControllerError, JobController};
