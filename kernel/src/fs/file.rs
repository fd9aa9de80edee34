//! Open files: the global file table, per-task descriptor tables, the
//! bitmap allocation entry points, and file creation with rollback.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::warn;

use fs_lib::{DirEntry, FileType, BITS_PER_SECTOR, DIRSIZ, SECTOR_SIZE};

use crate::define::fs::{NFILE, NOFILE, RESERVED_FDS};
use crate::lock::SpinLock;

use super::dir::Dir;
use super::error::{Error, Result};
use super::inode::{Inode, InodeHandle};
use super::MountedPartition;

bitflags! {
    /// Open flags. Only creation is in scope; the read/write access modes
    /// are carried for the file structure.
    pub struct OpenFlags: u8 {
        const RDONLY = 0;
        const WRONLY = 0b001;
        const RDWR   = 0b010;
        const CREATE = 0b100;
    }
}

/// One open file: position, flags and the cached inode behind it.
#[derive(Clone, Copy)]
pub struct File {
    pub fd_pos: u32,
    pub fd_flag: OpenFlags,
    pub inode: InodeHandle,
}

/// System-wide open-file table. Slots 0..3 are reserved for the standard
/// streams and never handed out here.
pub struct FileTable {
    slots: SpinLock<[Option<File>; NFILE]>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: SpinLock::new([None; NFILE], "file_table"),
        }
    }

    /// Claims the first free slot for `file`.
    pub(crate) fn install(&self, file: File) -> Result<usize> {
        let mut slots = self.slots.acquire();
        for idx in RESERVED_FDS..NFILE {
            if slots[idx].is_none() {
                slots[idx] = Some(file);
                return Ok(idx);
            }
        }
        warn!("exceeded max open files");
        Err(Error::FileTableFull)
    }

    pub(crate) fn clear(&self, idx: usize) {
        self.slots.acquire()[idx] = None;
    }

    pub fn get(&self, idx: usize) -> Option<File> {
        self.slots.acquire()[idx]
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task descriptor table mapping local descriptors to file-table
/// slots. It lives in the task control block; callers pass theirs in.
pub struct FdTable {
    fds: [Option<usize>; NOFILE],
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            fds: [None; NOFILE],
        }
    }

    /// Binds `global_idx` to the first free local descriptor.
    pub(crate) fn install(&mut self, global_idx: usize) -> Result<usize> {
        for fd in RESERVED_FDS..NOFILE {
            if self.fds[fd].is_none() {
                self.fds[fd] = Some(global_idx);
                return Ok(fd);
            }
        }
        warn!("exceeded max open files per task");
        Err(Error::FdTableFull)
    }

    pub(crate) fn clear(&mut self, fd: usize) {
        self.fds[fd] = None;
    }

    pub fn get(&self, fd: usize) -> Option<usize> {
        self.fds.get(fd).copied().flatten()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Which on-disk bitmap a sync call targets.
#[derive(Clone, Copy, Debug)]
pub enum BitmapType {
    Block,
    Inode,
}

impl MountedPartition {
    /// Claims a free inode number in the in-memory bitmap.
    pub fn inode_bitmap_alloc(&self) -> Result<u32> {
        let mut bitmap = self.inode_bitmap.acquire();
        let bit = bitmap.scan().ok_or(Error::NoFreeInode)?;
        bitmap.set(bit);
        Ok(bit as u32)
    }

    /// Claims a free data block; returns its absolute LBA.
    pub fn block_bitmap_alloc(&self) -> Result<u32> {
        let mut bitmap = self.block_bitmap.acquire();
        let bit = bitmap.scan().ok_or(Error::NoFreeBlock)?;
        bitmap.set(bit);
        Ok(self.sb.data_start_lba + bit as u32)
    }

    /// Hands an inode number back (memory only; used by rollback).
    pub(crate) fn inode_bitmap_clear(&self, i_no: u32) {
        self.inode_bitmap.acquire().clear(i_no as usize);
    }

    /// Writes back the one 512-byte sector of the bitmap that holds
    /// `bit_idx`, keeping the disk copy in step with memory.
    pub fn bitmap_sync(&self, bit_idx: u32, which: BitmapType) {
        let off_sec = bit_idx as usize / BITS_PER_SECTOR;
        let (lba, sector) = match which {
            BitmapType::Inode => (
                self.sb.inode_bitmap_lba + off_sec as u32,
                self.inode_bitmap.acquire().sector_copy(bit_idx as usize),
            ),
            BitmapType::Block => (
                self.sb.block_bitmap_lba + off_sec as u32,
                self.block_bitmap.acquire().sector_copy(bit_idx as usize),
            ),
        };
        self.part.disk.write_sectors(lba, &sector);
    }
}

/// Side effects `file_create` has committed so far, undone in reverse on
/// failure.
enum Committed {
    InodeBit(u32),
    CacheRef(InodeHandle),
    FileSlot(usize),
    FdSlot(usize),
}

fn rollback(
    part: &MountedPartition,
    file_table: &FileTable,
    fd_table: &mut FdTable,
    committed: Vec<Committed>,
) {
    for action in committed.into_iter().rev() {
        match action {
            Committed::FdSlot(fd) => fd_table.clear(fd),
            Committed::FileSlot(idx) => file_table.clear(idx),
            Committed::CacheRef(handle) => part.inode_close(handle),
            Committed::InodeBit(i_no) => part.inode_bitmap_clear(i_no),
        }
    }
}

/// Creates a regular file named `filename` under `parent` and opens it.
///
/// Resource acquisition order: inode number, cache slot, file-table slot,
/// task descriptor, then the directory entry; the disk syncs (parent
/// inode, new inode, inode bitmap) happen only once the entry is in.
/// Any failure unwinds everything committed so far; no partial state
/// survives. Returns the task-local descriptor.
pub fn file_create(
    part: &MountedPartition,
    file_table: &FileTable,
    fd_table: &mut FdTable,
    parent: &Dir,
    filename: &str,
    flags: OpenFlags,
) -> Result<usize> {
    if filename.is_empty() || filename.len() > DIRSIZ {
        return Err(Error::NameTooLong);
    }
    let mut io_buf = vec![0u8; 2 * SECTOR_SIZE];
    let mut committed = Vec::new();

    let i_no = part.inode_bitmap_alloc()?;
    committed.push(Committed::InodeBit(i_no));

    let inode_handle = part.inode_cache_insert(Inode::new(i_no));
    committed.push(Committed::CacheRef(inode_handle));

    let file = File {
        fd_pos: 0,
        fd_flag: flags,
        inode: inode_handle,
    };
    let global_fd = match file_table.install(file) {
        Ok(idx) => idx,
        Err(err) => {
            rollback(part, file_table, fd_table, committed);
            return Err(err);
        }
    };
    committed.push(Committed::FileSlot(global_fd));

    let local_fd = match fd_table.install(global_fd) {
        Ok(fd) => fd,
        Err(err) => {
            rollback(part, file_table, fd_table, committed);
            return Err(err);
        }
    };
    committed.push(Committed::FdSlot(local_fd));

    let entry = DirEntry::new(filename, i_no, FileType::Regular);
    if let Err(err) = part.sync_dir_entry(parent, &entry, &mut io_buf) {
        warn!("sync dir entry for {} failed: {}", filename, err);
        rollback(part, file_table, fd_table, committed);
        return Err(err);
    }

    // the entry is durable; now make the metadata match it
    io_buf.fill(0);
    part.inode_sync(parent.inode, &mut io_buf);
    io_buf.fill(0);
    part.inode_sync(inode_handle, &mut io_buf);
    part.bitmap_sync(i_no, BitmapType::Inode);

    Ok(local_fd)
}
