//! Directory store: exact-name search and append-oriented insertion over
//! an inode's 12 direct blocks plus its 128-pointer indirect table.
//!
//! A directory grows by claiming the first unused address slot; entries
//! are never compacted or reordered. Each link step (allocate block, wire
//! pointer, write entry) is its own disk write; there is no journal, so
//! the order is chosen to leave at worst an unreferenced block behind.

use alloc::vec;
use core::convert::TryInto;

use fs_lib::{DirEntry, DIRENTS_PER_SECTOR, NDIRECT, NINDIRECT, SECTOR_SIZE};

use super::error::Result;
use super::file::BitmapType;
use super::inode::InodeHandle;
use super::MountedPartition;

/// An open directory. Closing it releases its inode reference.
pub struct Dir {
    pub inode: InodeHandle,
}

impl MountedPartition {
    pub fn dir_open(&self, i_no: u32) -> Dir {
        Dir {
            inode: self.inode_open(i_no),
        }
    }

    pub fn dir_close(&self, dir: Dir) {
        self.inode_close(dir.inode);
    }

    /// Builds the full 140-slot block list of a directory inode. Slots
    /// 0..12 mirror the direct pointers; the indirect table is read from
    /// disk only when the inode has one.
    fn dir_all_blocks(&self, dir: &Dir) -> [u32; NDIRECT + NINDIRECT] {
        let i_sectors = self.with_inode(dir.inode, |inode| inode.i_sectors);
        let mut all_blocks = [0u32; NDIRECT + NINDIRECT];
        all_blocks[..NDIRECT].copy_from_slice(&i_sectors[..NDIRECT]);
        if i_sectors[NDIRECT] != 0 {
            self.read_indirect_table(i_sectors[NDIRECT], &mut all_blocks);
        }
        all_blocks
    }

    fn read_indirect_table(&self, table_lba: u32, all_blocks: &mut [u32; NDIRECT + NINDIRECT]) {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.part.disk.read_sectors(table_lba, &mut buf);
        for (slot, bytes) in all_blocks[NDIRECT..].iter_mut().zip(buf.chunks_exact(4)) {
            *slot = u32::from_le_bytes(bytes.try_into().unwrap());
        }
    }

    fn write_indirect_table(&self, table_lba: u32, all_blocks: &[u32; NDIRECT + NINDIRECT]) {
        let mut buf = vec![0u8; SECTOR_SIZE];
        for (bytes, slot) in buf.chunks_exact_mut(4).zip(all_blocks[NDIRECT..].iter()) {
            bytes.copy_from_slice(&slot.to_le_bytes());
        }
        self.part.disk.write_sectors(table_lba, &buf);
    }

    /// Looks `name` up in `dir`. Exact byte equality, no case folding.
    pub fn search_dir_entry(&self, dir: &Dir, name: &str) -> Option<DirEntry> {
        let all_blocks = self.dir_all_blocks(dir);
        let mut buf = vec![0u8; SECTOR_SIZE];

        for &block_lba in all_blocks.iter() {
            if block_lba == 0 {
                continue;
            }
            self.part.disk.read_sectors(block_lba, &mut buf);
            for slot in 0..DIRENTS_PER_SECTOR {
                let entry = DirEntry::decode(&buf[slot * DirEntry::SIZE..]);
                if !entry.is_free() && entry.name() == name {
                    return Some(entry);
                }
            }
        }
        None
    }

    /// Writes `entry` into the first free record slot of `parent`,
    /// allocating and linking a new data block (and, the first time slot
    /// 12 is needed, the indirect table) when every existing block is
    /// full. `io_buf` needs room for one sector.
    ///
    /// On allocation failure any block already taken for the indirect
    /// table in this call is handed back before the error is returned.
    pub fn sync_dir_entry(&self, parent: &Dir, entry: &DirEntry, io_buf: &mut [u8]) -> Result<()> {
        assert!(io_buf.len() >= SECTOR_SIZE);
        let dir_size = self.with_inode(parent.inode, |inode| inode.i_size);
        assert!(dir_size as usize % DirEntry::SIZE == 0);

        let mut all_blocks = self.dir_all_blocks(parent);
        let table_lba = self.with_inode(parent.inode, |inode| inode.i_sectors[NDIRECT]);

        for block_idx in 0..NDIRECT + NINDIRECT {
            if all_blocks[block_idx] == 0 {
                // no block behind this address slot yet
                let block_lba = self.block_bitmap_alloc()?;
                self.bitmap_sync(block_lba - self.sb.data_start_lba, BitmapType::Block);

                if block_idx < NDIRECT {
                    self.with_inode_mut(parent.inode, |inode| {
                        inode.i_sectors[block_idx] = block_lba
                    });
                    all_blocks[block_idx] = block_lba;
                } else if block_idx == NDIRECT {
                    // slot 12 needs two blocks: the indirect table itself
                    // and the first block it points at
                    self.with_inode_mut(parent.inode, |inode| {
                        inode.i_sectors[NDIRECT] = block_lba
                    });
                    let first_lba = match self.block_bitmap_alloc() {
                        Ok(lba) => lba,
                        Err(err) => {
                            let table_bit = block_lba - self.sb.data_start_lba;
                            self.block_bitmap.acquire().clear(table_bit as usize);
                            self.bitmap_sync(table_bit, BitmapType::Block);
                            self.with_inode_mut(parent.inode, |inode| {
                                inode.i_sectors[NDIRECT] = 0
                            });
                            return Err(err);
                        }
                    };
                    self.bitmap_sync(first_lba - self.sb.data_start_lba, BitmapType::Block);
                    all_blocks[NDIRECT] = first_lba;
                    self.write_indirect_table(block_lba, &all_blocks);
                } else {
                    // table exists; it just gains one more pointer
                    debug_assert!(table_lba != 0);
                    all_blocks[block_idx] = block_lba;
                    self.write_indirect_table(table_lba, &all_blocks);
                }

                // the new entry is the first record of the fresh block
                io_buf[..SECTOR_SIZE].fill(0);
                entry.encode(io_buf);
                self.part
                    .disk
                    .write_sectors(all_blocks[block_idx], &io_buf[..SECTOR_SIZE]);
                self.with_inode_mut(parent.inode, |inode| {
                    inode.i_size += DirEntry::SIZE as u32
                });
                return Ok(());
            }

            // block exists: reuse a reclaimed or never-used record slot
            let sector = &mut io_buf[..SECTOR_SIZE];
            self.part.disk.read_sectors(all_blocks[block_idx], sector);
            for slot in 0..DIRENTS_PER_SECTOR {
                let offset = slot * DirEntry::SIZE;
                if DirEntry::decode(&sector[offset..]).is_free() {
                    entry.encode(&mut sector[offset..]);
                    self.part.disk.write_sectors(all_blocks[block_idx], sector);
                    self.with_inode_mut(parent.inode, |inode| {
                        inode.i_size += DirEntry::SIZE as u32
                    });
                    return Ok(());
                }
            }
        }
        Err(super::error::Error::DirectoryFull)
    }
}
