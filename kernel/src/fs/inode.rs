//! Inode store: locating records in the on-disk table, and the per-mount
//! cache of open inodes.
//!
//! The cache is a fixed arena of slots with explicit reference counts. A
//! hit bumps the count and never touches the disk; the last close empties
//! the slot. Records are smaller than a sector and may straddle two, so
//! writing one back is always read–patch–write.

use alloc::boxed::Box;
use alloc::vec;

use array_macro::array;

use fs_lib::{DiskInode, NDIRECT, SECTOR_SIZE};

use crate::define::fs::NINODE;
use crate::lock::SpinLock;

use super::MountedPartition;

/// In-memory inode. The open count lives on the cache slot, not here.
#[derive(Clone, Copy, Debug)]
pub struct Inode {
    pub i_no: u32,
    pub i_size: u32,
    /// Set while some writer holds the file; always zero on disk.
    pub write_deny: bool,
    /// 12 direct block pointers plus the indirect-table pointer.
    pub i_sectors: [u32; NDIRECT + 1],
}

impl Inode {
    pub fn new(i_no: u32) -> Self {
        Self {
            i_no,
            i_size: 0,
            write_deny: false,
            i_sectors: [0; NDIRECT + 1],
        }
    }

    fn from_disk(disk_inode: &DiskInode) -> Self {
        Self {
            i_no: disk_inode.i_no,
            i_size: disk_inode.i_size,
            write_deny: false,
            i_sectors: disk_inode.i_sectors,
        }
    }

    /// The disk-safe copy: memory-only state is dropped.
    fn to_disk(&self) -> DiskInode {
        DiskInode {
            i_no: self.i_no,
            i_size: self.i_size,
            i_sectors: self.i_sectors,
        }
    }
}

struct CacheSlot {
    refs: u32,
    inode: Inode,
}

/// Arena of open inodes, scanned linearly by inode number.
pub struct InodeCache {
    slots: SpinLock<[Option<Box<CacheSlot>>; NINODE]>,
}

impl InodeCache {
    pub(crate) fn new() -> Self {
        Self {
            slots: SpinLock::new(array![_ => None; NINODE], "inode_cache"),
        }
    }
}

/// Stable reference into the cache arena, handed out by `inode_open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeHandle {
    pub(crate) index: usize,
    pub i_no: u32,
}

/// Where an inode record lives on disk.
pub struct InodePosition {
    pub sec_lba: u32,
    /// Byte offset of the record inside its first sector.
    pub off_size: usize,
    /// Whether the record continues into the next sector.
    pub two_sec: bool,
}

impl MountedPartition {
    /// Absolute sector and in-sector offset of inode `i_no`.
    pub(crate) fn inode_locate(&self, i_no: u32) -> InodePosition {
        assert!(i_no < self.sb.inode_cnt, "inode {} out of range", i_no);
        let off_size = i_no as usize * DiskInode::SIZE;
        let off_in_sec = off_size % SECTOR_SIZE;
        InodePosition {
            sec_lba: self.sb.inode_table_lba + (off_size / SECTOR_SIZE) as u32,
            off_size: off_in_sec,
            two_sec: SECTOR_SIZE - off_in_sec < DiskInode::SIZE,
        }
    }

    /// Opens inode `i_no`: a cache hit bumps the reference count, a miss
    /// reads the record from disk into a free slot.
    pub fn inode_open(&self, i_no: u32) -> InodeHandle {
        let mut slots = self.inode_cache.slots.acquire();

        let mut free_index = None;
        for (index, slot) in slots.iter_mut().enumerate() {
            match slot {
                Some(cached) if cached.inode.i_no == i_no => {
                    cached.refs += 1;
                    return InodeHandle { index, i_no };
                }
                None if free_index.is_none() => free_index = Some(index),
                _ => {}
            }
        }
        let index = free_index.expect("inode cache: out of slots");

        // Cold miss. The cache stays locked across the read so a second
        // opener of the same number cannot double-insert.
        let pos = self.inode_locate(i_no);
        let sects = if pos.two_sec { 2 } else { 1 };
        let mut buf = vec![0u8; sects * SECTOR_SIZE];
        self.part.disk.read_sectors(pos.sec_lba, &mut buf);

        let disk_inode = DiskInode::decode(&buf[pos.off_size..]);
        slots[index] = Some(Box::new(CacheSlot {
            refs: 1,
            inode: Inode::from_disk(&disk_inode),
        }));
        InodeHandle { index, i_no }
    }

    /// Inserts a freshly built inode (not yet on disk) with one reference.
    pub(crate) fn inode_cache_insert(&self, inode: Inode) -> InodeHandle {
        let mut slots = self.inode_cache.slots.acquire();
        let i_no = inode.i_no;
        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .expect("inode cache: out of slots");
        slots[index] = Some(Box::new(CacheSlot { refs: 1, inode }));
        InodeHandle { index, i_no }
    }

    /// Drops one reference; the last one evicts the slot and frees the
    /// record.
    pub fn inode_close(&self, handle: InodeHandle) {
        let mut slots = self.inode_cache.slots.acquire();
        let slot = slots[handle.index]
            .as_mut()
            .expect("inode_close: empty slot");
        assert_eq!(slot.inode.i_no, handle.i_no);
        slot.refs -= 1;
        if slot.refs == 0 {
            slots[handle.index] = None;
        }
    }

    pub fn with_inode<R>(&self, handle: InodeHandle, f: impl FnOnce(&Inode) -> R) -> R {
        let slots = self.inode_cache.slots.acquire();
        let slot = slots[handle.index].as_ref().expect("stale inode handle");
        assert_eq!(slot.inode.i_no, handle.i_no);
        f(&slot.inode)
    }

    /// Mutates a cached inode in place. The closure must not reach back
    /// into the cache.
    pub(crate) fn with_inode_mut<R>(&self, handle: InodeHandle, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut slots = self.inode_cache.slots.acquire();
        let slot = slots[handle.index].as_mut().expect("stale inode handle");
        assert_eq!(slot.inode.i_no, handle.i_no);
        f(&mut slot.inode)
    }

    /// Writes the cached inode back to its place in the inode table.
    ///
    /// Neighbors share the sector, so the owning sector(s) are read first
    /// and only the record's bytes are replaced. `io_buf` needs room for
    /// two sectors.
    pub fn inode_sync(&self, handle: InodeHandle, io_buf: &mut [u8]) {
        let inode = self.with_inode(handle, |inode| *inode);
        let pos = self.inode_locate(inode.i_no);
        assert!(pos.sec_lba < self.part.start_lba + self.part.sec_cnt);

        let sects = if pos.two_sec { 2 } else { 1 };
        let len = sects * SECTOR_SIZE;
        assert!(io_buf.len() >= len);
        let buf = &mut io_buf[..len];

        self.part.disk.read_sectors(pos.sec_lba, buf);
        inode.to_disk().encode(&mut buf[pos.off_size..]);
        self.part.disk.write_sectors(pos.sec_lba, buf);
    }

    /// Open count of `i_no` if it is cached; test scaffolding.
    #[cfg(test)]
    pub(crate) fn cached_refs(&self, i_no: u32) -> Option<u32> {
        let slots = self.inode_cache.slots.acquire();
        slots
            .iter()
            .flatten()
            .find(|slot| slot.inode.i_no == i_no)
            .map(|slot| slot.refs)
    }
}
