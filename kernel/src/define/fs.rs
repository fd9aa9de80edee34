//! Tunables of the in-memory side of the filesystem. The on-disk format
//! constants live in `fs-lib`.

use static_assertions::const_assert;

/// open-inode cache slots per mounted partition
pub const NINODE: usize = 64;

/// open files per system
pub const NFILE: usize = 32;

/// open files per task
pub const NOFILE: usize = 8;

/// descriptors 0..3 belong to stdin/stdout/stderr
pub const RESERVED_FDS: usize = 3;

/// longest accepted path
pub const MAX_PATH_LEN: usize = 512;

/// partition mounted by `filesys_init`
pub const DEFAULT_PART: &str = "sdb1";

const_assert!(RESERVED_FDS < NOFILE);
const_assert!(NOFILE <= NFILE);
