//! End-to-end tests of the storage stack over the RAM-backed IDE device:
//! boot enumeration, partition discovery, the driver's register protocol,
//! and filesystem durability across a re-mount.

use std::sync::Arc;
use std::thread;

use fs_lib::{BootSector, PartitionTableEntry, SECTOR_SIZE};
use kernel::driver::ramdisk::RamDisk;
use kernel::{FdTable, Hal, OpenFlags, Storage};

const SYS_DISK_SECTORS: usize = 64;
const DATA_DISK_SECTORS: usize = 16 * 1024;

const CMD_READ: u8 = 0x20;
const CMD_WRITE: u8 = 0x30;

fn boot_sector(entries: &[(usize, PartitionTableEntry)]) -> Vec<u8> {
    let mut table = [PartitionTableEntry::default(); 4];
    for (slot, entry) in entries {
        table[*slot] = *entry;
    }
    let mut sector = vec![0u8; SECTOR_SIZE];
    BootSector::new(table).encode(&mut sector);
    sector
}

fn data_entry(fs_type: u8, start_lba: u32, sec_cnt: u32) -> PartitionTableEntry {
    PartitionTableEntry {
        fs_type,
        start_lba,
        sec_cnt,
        ..PartitionTableEntry::default()
    }
}

/// Two drives on one channel; the data disk carries one primary
/// partition.
fn fresh_machine() -> Arc<RamDisk> {
    let ramdisk = RamDisk::new(&[SYS_DISK_SECTORS, DATA_DISK_SECTORS]);
    let mbr = boot_sector(&[(0, data_entry(0x83, 256, DATA_DISK_SECTORS as u32 - 256))]);
    ramdisk.load(1, 0, &mbr);
    ramdisk
}

fn boot(ramdisk: &Arc<RamDisk>) -> Storage {
    let hal: Arc<dyn Hal> = ramdisk.clone();
    Storage::init(hal, 2)
}

#[test]
fn identify_reports_drive_geometry() {
    let ramdisk = fresh_machine();
    let storage = boot(&ramdisk);
    assert_eq!(storage.disks.len(), 2);
    assert_eq!(storage.disks[0].name, "sda");
    assert_eq!(storage.disks[0].sectors as usize, SYS_DISK_SECTORS);
    assert_eq!(storage.disks[1].name, "sdb");
    assert_eq!(storage.disks[1].sectors as usize, DATA_DISK_SECTORS);
}

#[test]
fn sector_io_round_trips_and_chunks_at_256() {
    let ramdisk = fresh_machine();
    let storage = boot(&ramdisk);
    let disk = &storage.disks[1];

    let mut pattern = vec![0u8; 300 * SECTOR_SIZE];
    for (i, byte) in pattern.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    ramdisk.clear_outb_log();
    disk.write_sectors(4096, &pattern);
    assert_eq!(
        ramdisk.command_count(CMD_WRITE),
        2,
        "300 sectors is one full 256 chunk plus a 44-sector tail"
    );

    let mut readback = vec![0u8; 300 * SECTOR_SIZE];
    disk.read_sectors(4096, &mut readback);
    assert_eq!(ramdisk.command_count(CMD_READ), 2);
    assert_eq!(pattern, readback);

    // writing the same bytes again and re-reading them is idempotent
    disk.write_sectors(4096, &readback);
    let mut again = vec![0u8; 300 * SECTOR_SIZE];
    disk.read_sectors(4096, &mut again);
    assert_eq!(readback, again);
}

#[test]
fn partition_scan_walks_the_extended_chain() {
    let ramdisk = RamDisk::new(&[SYS_DISK_SECTORS, DATA_DISK_SECTORS]);
    let ext_base = 8192u32;

    let mbr = boot_sector(&[
        (0, data_entry(0x83, 256, 2048)),
        (1, data_entry(0x83, 4096, 2048)),
        (2, data_entry(0x05, ext_base, 8192)),
    ]);
    ramdisk.load(1, 0, &mbr);

    // first EBR: one logical partition and a link to the next EBR,
    // both relative to the extended base
    let ebr1 = boot_sector(&[
        (0, data_entry(0x83, 64, 512)),
        (1, data_entry(0x05, 1024, 1024)),
    ]);
    ramdisk.load(1, ext_base as usize * SECTOR_SIZE, &ebr1);

    // second EBR, at ext_base + 1024: the final logical partition
    let ebr2 = boot_sector(&[(0, data_entry(0x83, 64, 512))]);
    ramdisk.load(1, (ext_base + 1024) as usize * SECTOR_SIZE, &ebr2);

    let storage = boot(&ramdisk);
    let names: Vec<&str> = storage
        .partitions
        .iter()
        .map(|part| part.name.as_str())
        .collect();
    assert_eq!(names, ["sdb1", "sdb2", "sdb5", "sdb6"]);

    let by_name = |name: &str| {
        storage
            .partitions
            .iter()
            .find(|part| part.name == name)
            .unwrap()
    };
    assert_eq!(by_name("sdb1").start_lba, 256);
    assert_eq!(by_name("sdb2").start_lba, 4096);
    // logical partitions sit 64 sectors into their EBR's slice
    assert_eq!(by_name("sdb5").start_lba, ext_base + 64);
    assert_eq!(by_name("sdb6").start_lba, ext_base + 1024 + 64);
}

#[test]
fn logical_partitions_stop_at_eight() {
    let ramdisk = RamDisk::new(&[SYS_DISK_SECTORS, DATA_DISK_SECTORS]);
    let ext_base = 2048u32;

    let mbr = boot_sector(&[(0, data_entry(0x05, ext_base, 12 * 1024))]);
    ramdisk.load(1, 0, &mbr);

    // a chain of ten EBRs, each carrying one logical partition
    for i in 0..10u32 {
        let ebr_lba = ext_base + i * 128;
        let mut entries = vec![(0, data_entry(0x83, 64, 32))];
        if i < 9 {
            entries.push((1, data_entry(0x05, (i + 1) * 128, 128)));
        }
        let ebr = boot_sector(&entries);
        ramdisk.load(1, ebr_lba as usize * SECTOR_SIZE, &ebr);
    }

    let storage = boot(&ramdisk);
    assert_eq!(storage.partitions.len(), 8);
    assert_eq!(storage.partitions.first().unwrap().name, "sdb5");
    assert_eq!(storage.partitions.last().unwrap().name, "sdb12");
}

#[test]
fn format_happens_once_and_survives_reboot() {
    let ramdisk = fresh_machine();

    let mut storage = boot(&ramdisk);
    storage.filesys_init();
    let mut fd_table = FdTable::new();
    let fd = storage
        .sys_open("/boot.cfg", OpenFlags::CREATE, &mut fd_table)
        .unwrap();
    assert_eq!(fd, 3);
    let fd = storage
        .sys_open("/initrd", OpenFlags::CREATE, &mut fd_table)
        .unwrap();
    assert_eq!(fd, 4);
    drop(storage);

    // second boot on the same disk: the filesystem is detected, not
    // rebuilt, and the created files are still there
    let writes_after_first_boot = ramdisk.command_count(CMD_WRITE);
    let mut storage = boot(&ramdisk);
    storage.filesys_init();
    assert_eq!(
        ramdisk.command_count(CMD_WRITE),
        writes_after_first_boot,
        "re-probing a formatted partition must not write"
    );

    let part = storage.cur_part.as_ref().unwrap();
    let entry = part
        .search_dir_entry(part.root_dir(), "boot.cfg")
        .expect("file must survive remount");
    assert_eq!(entry.i_no, 1);
    assert!(part.search_dir_entry(part.root_dir(), "initrd").is_some());
    assert!(part.search_dir_entry(part.root_dir(), "vmlinuz").is_none());
}

#[test]
fn channel_register_programming_is_serialized() {
    let ramdisk = fresh_machine();
    let storage = boot(&ramdisk);
    let sys_disk = Arc::clone(&storage.disks[0]);
    let data_disk = Arc::clone(&storage.disks[1]);

    ramdisk.clear_outb_log();
    let reader = thread::spawn(move || {
        let mut buf = vec![0u8; SECTOR_SIZE];
        for lba in 0..40 {
            sys_disk.read_sectors(lba, &mut buf);
        }
    });
    let writer = thread::spawn(move || {
        let buf = vec![0xEEu8; SECTOR_SIZE];
        for lba in 1024..1064 {
            data_disk.write_sectors(lba, &buf);
        }
    });
    reader.join().unwrap();
    writer.join().unwrap();

    // both drives share channel 0; a sector-count write must always be
    // followed by its own LBA/device/command sequence, never another
    // thread's registers
    let log = ramdisk.outb_log();
    let base = 0x1F0u16;
    let mut commands = 0;
    let mut i = 0;
    while i < log.len() {
        if log[i].0 == base + 2 {
            let ports: Vec<u16> = log[i + 1..i + 6].iter().map(|(port, _)| *port).collect();
            assert_eq!(
                ports,
                [base + 3, base + 4, base + 5, base + 6, base + 7],
                "interleaved register programming at log index {}",
                i
            );
            commands += 1;
            i += 6;
        } else {
            i += 1;
        }
    }
    assert_eq!(commands, 80);
}
