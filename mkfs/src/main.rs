//! Builds a partitioned, formatted disk image.
//!
//! The image is produced by the real storage stack: an MBR with one
//! primary partition is laid onto a RAM-backed IDE device, the driver
//! boots against it, `filesys_init` formats and mounts the partition, and
//! the resulting bytes are written out. What QEMU later reads is exactly
//! what the kernel itself would have created.

use std::env;
use std::process::exit;
use std::sync::Arc;

use lazy_static::lazy_static;

use fs_lib::{BootSector, PartitionTableEntry, SECTOR_SIZE};
use kernel::driver::ramdisk::RamDisk;
use kernel::{Hal, Storage};

lazy_static! {
    static ref ARGS: Vec<String> = env::args().collect();
}

/// Drive 0 stands in for the system disk; it stays blank.
const SYS_DISK_SECTORS: usize = 128;

/// Default data-disk size: 16 MiB.
const DEFAULT_IMAGE_SECTORS: usize = 32 * 1024;

/// Where the single primary partition starts.
const PART_START_LBA: u32 = 2048;

/// Linux-style type byte for the partition entry.
const FS_TYPE_NATIVE: u8 = 0x83;

fn main() {
    if ARGS.len() < 2 {
        eprintln!("Usage: mkfs <image> [sectors]");
        exit(1);
    }
    let image_path = &ARGS[1];
    let total_sectors: usize = match ARGS.get(2) {
        Some(arg) => arg.parse().expect("sector count must be a number"),
        None => DEFAULT_IMAGE_SECTORS,
    };
    assert!(
        total_sectors > PART_START_LBA as usize + 1024,
        "image too small for a formattable partition"
    );

    log::set_logger(&StderrLogger).expect("logger already set");
    log::set_max_level(log::LevelFilter::Info);

    // one primary partition covering the rest of the disk
    let mut table = [PartitionTableEntry::default(); 4];
    table[0] = PartitionTableEntry {
        fs_type: FS_TYPE_NATIVE,
        start_lba: PART_START_LBA,
        sec_cnt: total_sectors as u32 - PART_START_LBA,
        ..PartitionTableEntry::default()
    };
    let mut mbr = vec![0u8; SECTOR_SIZE];
    BootSector::new(table).encode(&mut mbr);

    let ramdisk = RamDisk::new(&[SYS_DISK_SECTORS, total_sectors]);
    ramdisk.load(1, 0, &mbr);

    // boot the stack against the emulated drives; sdb1 gets formatted and
    // mounted exactly like on hardware
    let hal: Arc<dyn Hal> = ramdisk.clone();
    let mut storage = Storage::init(hal, 2);
    storage.filesys_init();

    std::fs::write(image_path, ramdisk.dump(1))
        .unwrap_or_else(|err| panic!("cannot write {}: {}", image_path, err));
    println!("wrote {} ({} sectors)", image_path, total_sectors);
}

/// The kernel code logs through the `log` facade; here the sink is just
/// stderr.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}
