//! Builders to construct a scheduler and job controller from configuration.

pub mod runtime_builder;

pub use runtime_builder::{build_runtime, build_runtime_with, Runtime};
