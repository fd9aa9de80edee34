//! Locking primitives

pub mod semaphore;
pub mod sleeplock;
pub mod spinlock;

pub use semaphore::Semaphore;
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::SpinLock;
