//! The storage subsystem context: channel and disk enumeration, partition
//! discovery, filesystem search/auto-format, mounting, and path-based file
//! creation.
//!
//! The channel table, partition list, current partition and file table
//! are owned by one [`Storage`] value built at boot and threaded through
//! explicitly; nothing here hides in globals.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::{info, warn};

use fs_lib::{
    div_round_up, DirEntry, DiskInode, FileType, SuperBlock, BITS_PER_SECTOR, FSMAGIC, NINODES,
    SECTOR_SIZE,
};

use crate::define::fs::{DEFAULT_PART, MAX_PATH_LEN};
use crate::driver::ide::{Disk, IdeChannel};
use crate::driver::partition::{partition_scan, report_partitions, Partition};
use crate::fs::dir::Dir;
use crate::fs::error::{Error, Result};
use crate::fs::file::{file_create, FdTable, FileTable, OpenFlags};
use crate::fs::MountedPartition;
use crate::hal::Hal;

/// Root of the storage subsystem; one per machine, built at boot.
pub struct Storage {
    hal: Arc<dyn Hal>,
    pub channels: Vec<Arc<IdeChannel>>,
    pub disks: Vec<Arc<Disk>>,
    pub partitions: Vec<Arc<Partition>>,
    pub cur_part: Option<Arc<MountedPartition>>,
    pub file_table: FileTable,
}

impl Storage {
    /// Enumerates `disk_cnt` drives over up to two channels, identifies
    /// each, and scans the data disks (device 1 of each channel) for
    /// partitions. Device 0 carries the system image and is left alone.
    pub fn init(hal: Arc<dyn Hal>, disk_cnt: usize) -> Self {
        assert!(disk_cnt > 0);
        let channel_cnt = div_round_up(disk_cnt, 2);
        assert!(channel_cnt <= 2);
        info!("ide: {} disk(s) on {} channel(s)", disk_cnt, channel_cnt);

        let mut channels = Vec::new();
        let mut disks: Vec<Arc<Disk>> = Vec::new();
        let mut partitions = Vec::new();

        for channel_no in 0..channel_cnt {
            let channel = IdeChannel::new(channel_no, Arc::clone(&hal));
            for dev_no in 0..2usize {
                let disk_idx = channel_no * 2 + dev_no;
                if disk_idx >= disk_cnt {
                    break;
                }
                let name = format!("sd{}", (b'a' + disk_idx as u8) as char);
                let disk = Disk::new(name, Arc::clone(&channel), dev_no as u8);
                if dev_no != 0 {
                    let found = partition_scan(&disk);
                    report_partitions(&found);
                    partitions.extend(found);
                }
                disks.push(disk);
            }
            channels.push(channel);
        }

        Self {
            hal,
            channels,
            disks,
            partitions,
            cur_part: None,
            file_table: FileTable::new(),
        }
    }

    pub fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    /// Probes every discovered partition for a filesystem, formats the
    /// ones that have none, then mounts the default partition.
    pub fn filesys_init(&mut self) {
        info!("searching for filesystems...");
        let mut sb_buf = vec![0u8; SECTOR_SIZE];
        for part in &self.partitions {
            sb_buf.fill(0);
            part.disk.read_sectors(part.start_lba + 1, &mut sb_buf);
            if SuperBlock::decode(&sb_buf).is_valid() {
                info!("  {} already has a filesystem", part.name);
            } else {
                info!("formatting {} on {}...", part.name, part.disk.name);
                format_partition(part);
            }
        }
        self.mount(DEFAULT_PART);
    }

    /// Loads the named partition's filesystem and makes it current.
    pub fn mount(&mut self, part_name: &str) {
        let part = self
            .partitions
            .iter()
            .find(|part| part.name == part_name)
            .unwrap_or_else(|| panic!("mount: no partition named {}", part_name));
        self.cur_part = Some(MountedPartition::mount(Arc::clone(part)));
        info!("mount {} done", part_name);
    }

    fn cur(&self) -> &Arc<MountedPartition> {
        self.cur_part.as_ref().expect("no partition mounted")
    }

    /// Walks `pathname` from the root directory.
    ///
    /// Returns the target's inode number when every component resolved,
    /// and always a [`PathSearchRecord`] whose `searched_path` covers the
    /// components that actually matched; the caller tells a missing leaf
    /// from a missing intermediate directory by comparing depths. The
    /// record's parent directory is open; the caller closes it.
    pub fn search_file(&self, pathname: &str) -> (Option<u32>, PathSearchRecord) {
        let part = self.cur();
        let root_no = part.sb.root_inode_no;

        if pathname == "/" || pathname == "/." || pathname == "/.." || path_depth(pathname) == 0 {
            return (
                Some(root_no),
                PathSearchRecord {
                    searched_path: String::new(),
                    parent_dir: part.dir_open(root_no),
                    file_type: FileType::Directory,
                },
            );
        }
        assert!(pathname.len() < MAX_PATH_LEN);
        assert!(pathname.starts_with('/'));

        let mut record = PathSearchRecord {
            searched_path: String::new(),
            parent_dir: part.dir_open(root_no),
            file_type: FileType::Unknown,
        };
        let mut parent_inode_no = root_no;
        let (mut name, mut sub_path) = path_parse(pathname);

        while !name.is_empty() {
            record.searched_path.push('/');
            record.searched_path.push_str(name);

            match part.search_dir_entry(&record.parent_dir, name) {
                Some(dir_e) => {
                    let (next_name, next_sub) = path_parse(sub_path);
                    name = next_name;
                    sub_path = next_sub;

                    match dir_e.f_type {
                        FileType::Directory => {
                            // descend: the directory we leave becomes the
                            // grandparent on record
                            parent_inode_no = record.parent_dir.inode.i_no;
                            let next_dir = part.dir_open(dir_e.i_no);
                            let prev = core::mem::replace(&mut record.parent_dir, next_dir);
                            part.dir_close(prev);

                            if name.is_empty() {
                                // the path ends at this directory; report
                                // its parent as the enclosing directory
                                let reopened = part.dir_open(parent_inode_no);
                                let this_dir =
                                    core::mem::replace(&mut record.parent_dir, reopened);
                                part.dir_close(this_dir);
                                record.file_type = FileType::Directory;
                                return (Some(dir_e.i_no), record);
                            }
                        }
                        FileType::Regular => {
                            record.file_type = FileType::Regular;
                            return (Some(dir_e.i_no), record);
                        }
                        FileType::Unknown => unreachable!("free slot returned from search"),
                    }
                }
                None => return (None, record),
            }
        }
        unreachable!("path walk fell through");
    }

    /// Opens `pathname`, which today means creating it: reads and writes
    /// go through a separate layer, so any flag combination without
    /// CREATE is rejected. Returns the task-local descriptor on success.
    pub fn sys_open(
        &self,
        pathname: &str,
        flags: OpenFlags,
        fd_table: &mut FdTable,
    ) -> Result<usize> {
        let part = self.cur();
        if pathname.ends_with('/') {
            warn!("cannot open a directory: {}", pathname);
            return Err(Error::IsDirectory);
        }
        assert!(flags.bits() <= 7);
        if !flags.contains(OpenFlags::CREATE) {
            return Err(Error::InvalidFlags);
        }

        let pathname_depth = path_depth(pathname);
        let (found, record) = self.search_file(pathname);

        if record.file_type == FileType::Directory {
            warn!("cannot open a directory with open(): {}", pathname);
            part.dir_close(record.parent_dir);
            return Err(Error::IsDirectory);
        }

        let searched_depth = path_depth(&record.searched_path);
        if searched_depth != pathname_depth {
            warn!(
                "cannot access {}: subpath {} does not exist",
                pathname, record.searched_path
            );
            part.dir_close(record.parent_dir);
            return Err(Error::IntermediateMissing);
        }

        if found.is_some() {
            warn!("{} already exists", pathname);
            part.dir_close(record.parent_dir);
            return Err(Error::AlreadyExists);
        }

        info!("creating file {}", pathname);
        let leaf = pathname.rsplit('/').next().unwrap_or(pathname);
        let result = file_create(
            part,
            &self.file_table,
            fd_table,
            &record.parent_dir,
            leaf,
            flags,
        );
        part.dir_close(record.parent_dir);
        result
    }
}

/// Transient result of a path walk.
pub struct PathSearchRecord {
    /// The prefix of the path that matched, component by component.
    pub searched_path: String,
    /// Enclosing directory of the walk's end point; open, caller closes.
    pub parent_dir: Dir,
    pub file_type: FileType,
}

/// Splits off the first path component: `"/a/b" → ("a", "/b")`. Leading
/// separators are skipped; an exhausted path yields an empty name.
pub(crate) fn path_parse(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches('/');
    match path.find('/') {
        Some(pos) => (&path[..pos], &path[pos..]),
        None => (path, ""),
    }
}

/// Number of components in `path`.
pub fn path_depth(path: &str) -> usize {
    let mut rest = path;
    let mut depth = 0;
    loop {
        let (name, sub_path) = path_parse(rest);
        if name.is_empty() {
            return depth;
        }
        depth += 1;
        rest = sub_path;
    }
}

/// Computes the on-disk region layout for `part` and writes the initial
/// filesystem: superblock, both bitmaps, the inode table with the root
/// inode, and the root directory block holding `.` and `..`.
pub fn format_partition(part: &Arc<Partition>) {
    let boot_sector_sects = 1u32;
    let super_block_sects = 1u32;
    let inode_bitmap_sects = div_round_up(NINODES, BITS_PER_SECTOR) as u32;
    let inode_table_sects = div_round_up(DiskInode::SIZE * NINODES, SECTOR_SIZE) as u32;
    let used_sects =
        boot_sector_sects + super_block_sects + inode_bitmap_sects + inode_table_sects;
    assert!(part.sec_cnt > used_sects + 1, "partition too small to format");
    let free_sects = part.sec_cnt - used_sects;

    // The block bitmap takes sectors away from the pool it tracks; one
    // more sizing round makes the two agree.
    let mut block_bitmap_sects = div_round_up(free_sects as usize, BITS_PER_SECTOR) as u32;
    let block_bitmap_bit_len = free_sects - block_bitmap_sects;
    block_bitmap_sects = div_round_up(block_bitmap_bit_len as usize, BITS_PER_SECTOR) as u32;

    let sb = SuperBlock {
        magic: FSMAGIC,
        sec_cnt: part.sec_cnt,
        inode_cnt: NINODES as u32,
        part_lba_base: part.start_lba,
        block_bitmap_lba: part.start_lba + 2,
        block_bitmap_sects,
        inode_bitmap_lba: part.start_lba + 2 + block_bitmap_sects,
        inode_bitmap_sects,
        inode_table_lba: part.start_lba + 2 + block_bitmap_sects + inode_bitmap_sects,
        inode_table_sects,
        data_start_lba: part.start_lba
            + 2
            + block_bitmap_sects
            + inode_bitmap_sects
            + inode_table_sects,
        root_inode_no: 0,
        dir_entry_size: DirEntry::SIZE as u32,
    };

    info!("{} layout:", part.name);
    info!("  magic               {:#x}", sb.magic);
    info!("  part_lba_base       {:#x}", sb.part_lba_base);
    info!("  sec_cnt             {:#x}", sb.sec_cnt);
    info!("  inode_cnt           {:#x}", sb.inode_cnt);
    info!("  block_bitmap_lba    {:#x} ({} sects)", sb.block_bitmap_lba, sb.block_bitmap_sects);
    info!("  inode_bitmap_lba    {:#x} ({} sects)", sb.inode_bitmap_lba, sb.inode_bitmap_sects);
    info!("  inode_table_lba     {:#x} ({} sects)", sb.inode_table_lba, sb.inode_table_sects);
    info!("  data_start_lba      {:#x}", sb.data_start_lba);

    let disk = &part.disk;

    // 1. superblock into the partition's second sector
    let mut sector = vec![0u8; SECTOR_SIZE];
    sb.encode(&mut sector);
    disk.write_sectors(part.start_lba + 1, &sector);

    let buf_sects = block_bitmap_sects
        .max(inode_bitmap_sects)
        .max(inode_table_sects) as usize;
    let mut buf = vec![0u8; buf_sects * SECTOR_SIZE];

    // 2. block bitmap: bit 0 is the root directory block; the tail bits
    // past the real free-sector count are preset to allocated so they can
    // never be handed out
    buf[0] |= 0x01;
    let last_byte = (block_bitmap_bit_len / 8) as usize;
    let last_bit = (block_bitmap_bit_len % 8) as u8;
    for byte in buf[last_byte..block_bitmap_sects as usize * SECTOR_SIZE].iter_mut() {
        *byte = 0xFF;
    }
    for bit in 0..last_bit {
        buf[last_byte] &= !(1 << bit);
    }
    disk.write_sectors(
        sb.block_bitmap_lba,
        &buf[..block_bitmap_sects as usize * SECTOR_SIZE],
    );

    // 3. inode bitmap: only the root inode is allocated
    buf.fill(0);
    buf[0] |= 0x01;
    disk.write_sectors(
        sb.inode_bitmap_lba,
        &buf[..inode_bitmap_sects as usize * SECTOR_SIZE],
    );

    // 4. inode table: root inode holds one block with two entries
    buf.fill(0);
    let mut root = DiskInode::new(sb.root_inode_no);
    root.i_size = 2 * DirEntry::SIZE as u32;
    root.i_sectors[0] = sb.data_start_lba;
    root.encode(&mut buf);
    disk.write_sectors(
        sb.inode_table_lba,
        &buf[..inode_table_sects as usize * SECTOR_SIZE],
    );

    // 5. root directory block: `.` and `..` both point at the root inode
    buf.fill(0);
    DirEntry::new(".", sb.root_inode_no, FileType::Directory).encode(&mut buf[..]);
    DirEntry::new("..", sb.root_inode_no, FileType::Directory)
        .encode(&mut buf[DirEntry::SIZE..]);
    disk.write_sectors(sb.data_start_lba, &buf[..SECTOR_SIZE]);

    info!("{} format done", part.name);
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use fs_lib::{
        BootSector, DirEntry, FileType, PartitionTableEntry, DIRENTS_PER_SECTOR, NDIRECT,
        NINDIRECT, SECTOR_SIZE,
    };

    use crate::define::fs::RESERVED_FDS;
    use crate::driver::ramdisk::RamDisk;
    use crate::fs::file::{FdTable, OpenFlags};
    use crate::hal::Hal;

    use super::*;

    const DATA_DISK_SECTORS: usize = 16 * 1024;
    const PART_START: u32 = 256;

    /// MBR with one primary partition, then the full boot path: identify,
    /// partition scan, auto-format, mount.
    fn boot() -> (Arc<RamDisk>, Storage) {
        let mut table = [PartitionTableEntry::default(); 4];
        table[0] = PartitionTableEntry {
            fs_type: 0x83,
            start_lba: PART_START,
            sec_cnt: DATA_DISK_SECTORS as u32 - PART_START,
            ..PartitionTableEntry::default()
        };
        let mut mbr = vec![0u8; SECTOR_SIZE];
        BootSector::new(table).encode(&mut mbr);

        let ramdisk = RamDisk::new(&[64, DATA_DISK_SECTORS]);
        ramdisk.load(1, 0, &mbr);

        let hal: Arc<dyn Hal> = ramdisk.clone();
        let mut storage = Storage::init(hal, 2);
        storage.filesys_init();
        (ramdisk, storage)
    }

    #[test]
    fn parse_skips_separators_and_counts_depth() {
        assert_eq!(path_parse("/a/b/c"), ("a", "/b/c"));
        assert_eq!(path_parse("///x"), ("x", ""));
        assert_eq!(path_parse("/"), ("", ""));
        assert_eq!(path_depth("/a/b/c"), 3);
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("//tmp///f"), 2);
    }

    #[test]
    fn format_orders_regions_and_mount_loads_them() {
        let (_ramdisk, storage) = boot();
        let part = storage.cur_part.as_ref().unwrap();
        let sb = &part.sb;

        assert_eq!(sb.part_lba_base, PART_START);
        assert!(sb.block_bitmap_lba < sb.inode_bitmap_lba);
        assert!(sb.inode_bitmap_lba < sb.inode_table_lba);
        assert!(sb.inode_table_lba < sb.data_start_lba);
        assert!(sb.data_start_lba < sb.part_lba_base + sb.sec_cnt);
        assert_eq!(sb.root_inode_no, 0);
        assert_eq!(sb.dir_entry_size as usize, DirEntry::SIZE);

        // the root inode was pinned by mount and holds `.` and `..`
        let root = part.root_dir();
        assert_eq!(root.inode.i_no, 0);
        let dot = part.search_dir_entry(root, ".").unwrap();
        assert_eq!(dot.i_no, 0);
        assert_eq!(dot.f_type, FileType::Directory);
        let dotdot = part.search_dir_entry(root, "..").unwrap();
        assert_eq!(dotdot.i_no, 0);
    }

    #[test]
    fn create_then_search_round_trips() {
        let (_ramdisk, storage) = boot();
        let mut fd_table = FdTable::new();

        let fd = storage
            .sys_open("/kernel.bin", OpenFlags::CREATE, &mut fd_table)
            .unwrap();
        assert_eq!(fd, RESERVED_FDS);

        let part = storage.cur_part.as_ref().unwrap();
        let entry = part.search_dir_entry(part.root_dir(), "kernel.bin").unwrap();
        assert_eq!(entry.name(), "kernel.bin");
        assert_eq!(entry.i_no, 1);
        assert_eq!(entry.f_type, FileType::Regular);

        assert!(part.search_dir_entry(part.root_dir(), "kernel.bi").is_none());
        assert!(part.search_dir_entry(part.root_dir(), "KERNEL.BIN").is_none());
    }

    #[test]
    fn missing_intermediate_is_not_a_plain_not_found() {
        let (_ramdisk, storage) = boot();
        let mut fd_table = FdTable::new();
        storage
            .sys_open("/a", OpenFlags::CREATE, &mut fd_table)
            .unwrap();

        // "/a" resolves one component deep and stops there
        let (found, record) = storage.search_file("/a/b/c");
        let part = storage.cur_part.as_ref().unwrap();
        assert!(found.is_some());
        assert_eq!(record.file_type, FileType::Regular);
        assert_eq!(path_depth(&record.searched_path), 1);
        assert_eq!(record.searched_path, "/a");
        part.dir_close(record.parent_dir);

        assert_eq!(
            storage.sys_open("/a/b/c", OpenFlags::CREATE, &mut fd_table),
            Err(Error::IntermediateMissing)
        );
        // entirely absent intermediate: the mismatch is at "/x"
        assert_eq!(
            storage.sys_open("/x/y/z", OpenFlags::CREATE, &mut fd_table),
            Err(Error::IntermediateMissing)
        );
    }

    #[test]
    fn open_rejects_directories_and_flag_misuse() {
        let (_ramdisk, storage) = boot();
        let mut fd_table = FdTable::new();

        assert_eq!(
            storage.sys_open("/tmp/", OpenFlags::CREATE, &mut fd_table),
            Err(Error::IsDirectory)
        );
        assert_eq!(
            storage.sys_open("/", OpenFlags::CREATE, &mut fd_table),
            Err(Error::IsDirectory)
        );
        assert_eq!(
            storage.sys_open("/anything", OpenFlags::RDWR, &mut fd_table),
            Err(Error::InvalidFlags)
        );

        storage
            .sys_open("/twice", OpenFlags::CREATE, &mut fd_table)
            .unwrap();
        assert_eq!(
            storage.sys_open("/twice", OpenFlags::CREATE, &mut fd_table),
            Err(Error::AlreadyExists)
        );
    }

    #[test]
    fn inode_cache_hits_do_not_touch_the_disk() {
        let (ramdisk, storage) = boot();
        let mut fd_table = FdTable::new();
        storage
            .sys_open("/cached", OpenFlags::CREATE, &mut fd_table)
            .unwrap();
        let part = storage.cur_part.as_ref().unwrap();

        // the create left the inode cached with one reference
        assert_eq!(part.cached_refs(1), Some(1));

        let reads_before = ramdisk.command_count(crate::driver::ide::CMD_READ_SECTOR);
        let handle = part.inode_open(1);
        assert_eq!(part.cached_refs(1), Some(2));
        assert_eq!(
            ramdisk.command_count(crate::driver::ide::CMD_READ_SECTOR),
            reads_before,
            "cache hit must not re-read the inode table"
        );

        part.inode_close(handle);
        assert_eq!(part.cached_refs(1), Some(1));
        // the creating reference is the last one left
        part.inode_close(handle);
        assert_eq!(part.cached_refs(1), None, "last close evicts the slot");

        // next open is a genuine miss again
        let reads_before = ramdisk.command_count(crate::driver::ide::CMD_READ_SECTOR);
        let reopened = part.inode_open(1);
        assert!(ramdisk.command_count(crate::driver::ide::CMD_READ_SECTOR) > reads_before);
        part.with_inode(reopened, |inode| {
            assert_eq!(inode.i_no, 1);
            assert_eq!(inode.i_size, 0);
        });
        part.inode_close(reopened);
    }

    #[test]
    fn straddling_inode_survives_sync_and_eviction() {
        let (_ramdisk, storage) = boot();
        let part = storage.cur_part.as_ref().unwrap();

        // records are 76 bytes; number 6 starts at byte 456 of its sector
        // and spills into the next one
        let pos = part.inode_locate(6);
        assert!(pos.two_sec);

        // each create uses a fresh task table; the global table has room
        for i in 1..=6 {
            let mut fd_table = FdTable::new();
            let name = format!("/f{}", i);
            storage
                .sys_open(&name, OpenFlags::CREATE, &mut fd_table)
                .unwrap();
        }

        let handle = part.inode_open(6);
        part.inode_close(handle); // drop our reference
        let created_ref = part
            .cached_refs(6)
            .expect("create holds its reference");
        assert_eq!(created_ref, 1);
        // evict by dropping the creating reference too
        part.inode_close(handle);
        assert_eq!(part.cached_refs(6), None);

        // a fresh read of the straddled record must see what sync wrote
        let reopened = part.inode_open(6);
        part.with_inode(reopened, |inode| {
            assert_eq!(inode.i_no, 6);
            assert_eq!(inode.i_size, 0);
            assert!(inode.i_sectors.iter().all(|lba| *lba == 0));
        });
        part.inode_close(reopened);
    }

    #[test]
    fn directory_fills_then_rolls_back_cleanly() {
        let (_ramdisk, storage) = boot();
        let part = storage.cur_part.as_ref().unwrap();
        let root = part.root_dir();

        // capacity: 12 direct + 128 indirect blocks of entries, minus the
        // two the root directory starts with
        let capacity = (NDIRECT + NINDIRECT) * DIRENTS_PER_SECTOR - 2;

        let mut io_buf = vec![0u8; 2 * SECTOR_SIZE];
        for i in 0..capacity {
            let name = format!("f{}", i);
            let entry = DirEntry::new(&name, 100 + i as u32, FileType::Regular);
            part.sync_dir_entry(root, &entry, &mut io_buf)
                .unwrap_or_else(|err| panic!("insert {} failed: {}", i, err));
        }
        let overflow = DirEntry::new("straw", 9999, FileType::Regular);
        assert_eq!(
            part.sync_dir_entry(root, &overflow, &mut io_buf),
            Err(Error::DirectoryFull)
        );

        // entries written through the indirect table are found again
        let deep = part
            .search_dir_entry(root, &format!("f{}", capacity - 1))
            .unwrap();
        assert_eq!(deep.i_no, 100 + capacity as u32 - 1);

        // a create into the full directory must undo all its bookkeeping
        let free_inode_before = part.inode_bitmap.acquire().scan();
        let mut fd_table = FdTable::new();
        assert_eq!(
            storage.sys_open("/overflow", OpenFlags::CREATE, &mut fd_table),
            Err(Error::DirectoryFull)
        );
        assert_eq!(
            part.inode_bitmap.acquire().scan(),
            free_inode_before,
            "inode bitmap bit must be handed back"
        );
        assert!(
            storage.file_table.get(RESERVED_FDS).is_none(),
            "file table slot must be cleared"
        );
        assert!(fd_table.get(RESERVED_FDS).is_none());
        let attempted = free_inode_before.unwrap() as u32;
        assert_eq!(part.cached_refs(attempted), None);
    }
}
