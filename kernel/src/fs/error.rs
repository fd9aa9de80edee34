//! Errors the filesystem reports back to its callers.
//!
//! Only recoverable conditions live here: running out of some table or
//! bitmap, and path lookups that fail. Hardware timeouts and violated
//! layout invariants panic instead; there is no way to continue past them.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Inode bitmap has no clear bit.
    NoFreeInode,
    /// Block bitmap has no clear bit.
    NoFreeBlock,
    /// All 12 + 128 address slots of the directory are in use.
    DirectoryFull,
    /// Global open-file table is full.
    FileTableFull,
    /// The task's descriptor table is full.
    FdTableFull,
    /// File name longer than a directory entry can hold.
    NameTooLong,
    /// Final path component does not exist.
    NotFound,
    /// An intermediate path component does not exist.
    IntermediateMissing,
    /// The path names a directory; this interface handles regular files.
    IsDirectory,
    /// Create requested but the name already exists.
    AlreadyExists,
    /// Unsupported open-flag combination.
    InvalidFlags,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NoFreeInode => "no free inode",
            Error::NoFreeBlock => "no free block",
            Error::DirectoryFull => "directory is full",
            Error::FileTableFull => "too many open files in system",
            Error::FdTableFull => "too many open files in task",
            Error::NameTooLong => "file name too long",
            Error::NotFound => "no such file",
            Error::IntermediateMissing => "path component does not exist",
            Error::IsDirectory => "is a directory",
            Error::AlreadyExists => "file already exists",
            Error::InvalidFlags => "invalid open flags",
        };
        write!(f, "{}", msg)
    }
}
