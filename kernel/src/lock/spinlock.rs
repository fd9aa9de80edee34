//! Named spinlock guarding short in-memory critical sections.
//!
//! Bitmap words, cache slot tables and the file table are only ever held
//! for a few instructions; on a single preemptible core these are
//! interrupt-off critical sections, which a plain spinlock models.

use spin::{Mutex, MutexGuard};

pub struct SpinLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn acquire(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
