//! Filesystem engine: occupancy bitmaps, the inode store, directories and
//! the open-file tables, all operating on one mounted partition.

pub mod bitmap;
pub mod dir;
pub mod error;
pub mod file;
pub mod inode;

use alloc::sync::Arc;
use alloc::vec;

use fs_lib::{SuperBlock, SECTOR_SIZE};

use crate::driver::Partition;
use crate::lock::SpinLock;

use bitmap::Bitmap;
use dir::Dir;
use inode::InodeCache;

/// A partition with its filesystem state loaded: the superblock, the
/// in-memory mirrors of both occupancy bitmaps, and the open-inode cache.
///
/// The bitmaps are the allocation truth; the on-disk copies trail them by
/// one `bitmap_sync` call per mutated bit.
pub struct MountedPartition {
    pub part: Arc<Partition>,
    pub sb: SuperBlock,
    pub(crate) block_bitmap: SpinLock<Bitmap>,
    pub(crate) inode_bitmap: SpinLock<Bitmap>,
    pub(crate) inode_cache: InodeCache,
    root_dir: Option<Dir>,
}

impl MountedPartition {
    /// Loads the filesystem of `part` into memory and pins the root
    /// directory inode in the cache for the lifetime of the mount.
    ///
    /// Panics if the partition does not carry a valid superblock; callers
    /// format first.
    pub fn mount(part: Arc<Partition>) -> Arc<Self> {
        let disk = Arc::clone(&part.disk);

        let mut sb_buf = vec![0u8; SECTOR_SIZE];
        disk.read_sectors(part.start_lba + 1, &mut sb_buf);
        let sb = SuperBlock::decode(&sb_buf);
        assert!(sb.is_valid(), "{}: superblock magic mismatch", part.name);

        let mut block_bits = vec![0u8; sb.block_bitmap_sects as usize * SECTOR_SIZE];
        disk.read_sectors(sb.block_bitmap_lba, &mut block_bits);

        let mut inode_bits = vec![0u8; sb.inode_bitmap_sects as usize * SECTOR_SIZE];
        disk.read_sectors(sb.inode_bitmap_lba, &mut inode_bits);

        let mut mounted = Self {
            part,
            sb,
            block_bitmap: SpinLock::new(Bitmap::new(block_bits), "block_bitmap"),
            inode_bitmap: SpinLock::new(Bitmap::new(inode_bits), "inode_bitmap"),
            inode_cache: InodeCache::new(),
            root_dir: None,
        };
        let root = mounted.dir_open(mounted.sb.root_inode_no);
        mounted.root_dir = Some(root);
        Arc::new(mounted)
    }

    /// The root directory, open since mount.
    pub fn root_dir(&self) -> &Dir {
        self.root_dir.as_ref().expect("partition not mounted")
    }
}
