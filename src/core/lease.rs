//! Scoped device slots.
//!
//! Running tasks are counted with a lock-free `AtomicU32`. A slot is reserved
//! with a CAS loop when a task is admitted and released when its
//! [`DeviceLease`] is dropped, so a panicking or timed-out handler can never
//! leak a slot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counter of occupied device slots plus a wake signal for the run loop.
#[derive(Debug, Clone)]
pub struct SlotCounter {
    active: Arc<AtomicU32>,
    released: Arc<Notify>,
}

impl SlotCounter {
    /// Fresh counter with no slots taken.
    #[must_use]
    pub fn new(released: Arc<Notify>) -> Self {
        Self {
            active: Arc::new(AtomicU32::new(0)),
            released,
        }
    }

    /// Slots currently held.
    #[must_use]
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Reserve one slot if fewer than `limit` are taken.
    pub fn try_acquire(&self, limit: u32, memory_gb: f64) -> Option<DeviceLease> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(DeviceLease {
                        counter: self.clone(),
                        memory_gb,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// One reserved device slot. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    counter: SlotCounter,
    memory_gb: f64,
}

impl DeviceLease {
    /// Memory the task was admitted against, in GB.
    #[must_use]
    pub const fn memory_gb(&self) -> f64 {
        self.memory_gb
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.counter.active.fetch_sub(1, Ordering::Release);
        self.counter.released.notify_one();
    }
}
