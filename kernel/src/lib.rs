//! Block storage subsystem for a monolithic kernel: the IDE channel driver,
//! the partition scanner and the on-disk filesystem engine (superblock,
//! occupancy bitmaps, inode table, directories, path lookup).
//!
//! The scheduler, the interrupt controller and the console stay outside;
//! everything the stack needs from the machine comes in through the
//! [`hal::Hal`] trait, and all state lives in one [`storage::Storage`]
//! context built at boot.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod define;
pub mod driver;
pub mod fs;
pub mod hal;
pub mod lock;
pub mod storage;

pub use fs::error::{Error, Result};
pub use fs::file::{FdTable, OpenFlags};
pub use hal::Hal;
pub use storage::Storage;
