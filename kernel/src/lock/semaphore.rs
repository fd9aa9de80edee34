//! Counting semaphore.
//!
//! One instance per IDE channel carries the command-completion handshake:
//! the interrupt handler calls [`Semaphore::up`] exactly once per issued
//! command and the waiting thread consumes it with [`Semaphore::down`].

use core::sync::atomic::{AtomicU32, Ordering};

use crate::hal::Hal;

pub struct Semaphore {
    value: AtomicU32,
    name: &'static str,
}

impl Semaphore {
    pub const fn new(value: u32, name: &'static str) -> Self {
        Self {
            value: AtomicU32::new(value),
            name,
        }
    }

    /// Decrements the counter, yielding the processor until it is positive.
    pub fn down(&self, hal: &dyn Hal) {
        loop {
            let current = self.value.load(Ordering::Acquire);
            if current > 0 {
                if self
                    .value
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            hal.yield_now();
        }
    }

    /// Increments the counter. Safe to call from interrupt context.
    pub fn up(&self) {
        self.value.fetch_add(1, Ordering::Release);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
