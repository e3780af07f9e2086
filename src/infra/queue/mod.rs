//! Queue backends and queue snapshot stores.

pub mod file;
pub mod memory;

pub use file::JsonFileQueueStore;
pub use memory::{InMemoryQueue, InMemoryQueueStore};
