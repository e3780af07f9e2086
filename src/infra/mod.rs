//! Infrastructure adapters: queue backends and durable stores.

pub(crate) mod fs;
pub mod queue;
pub mod store;

pub use queue::{InMemoryQueue, InMemoryQueueStore, JsonFileQueueStore};
pub use store::{FileJobStore, InMemoryJobStore};
