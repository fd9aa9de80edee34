//! MBR/EBR partition discovery.
//!
//! The boot sector at LBA 0 carries up to four entries; a type-0x05 entry
//! points into the extended partition, whose EBRs chain with offsets
//! relative to the first extended base. Discovery walks that chain with an
//! explicit scan state instead of mutable globals, and budgets the number
//! of boot sectors it will read so a corrupt chain cannot loop forever.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::{info, warn};

use fs_lib::{BootSector, SECTOR_SIZE};

use super::ide::Disk;

/// Primary partition slots in the MBR.
const MAX_PRIM_PARTS: usize = 4;

/// Logical partitions accepted per disk.
const MAX_LOGIC_PARTS: usize = 8;

/// Boot sectors one scan may read: the MBR plus a generous allowance for
/// the EBR chain.
const SCAN_BUDGET: usize = 1 + 2 * MAX_LOGIC_PARTS;

/// A contiguous LBA range with its own filesystem.
pub struct Partition {
    pub name: String,
    pub start_lba: u32,
    pub sec_cnt: u32,
    pub disk: Arc<Disk>,
}

struct ScanState {
    /// Base LBA of the whole extended partition; fixed by the first
    /// type-0x05 entry of the MBR, zero until then.
    ext_lba_base: u32,
    primaries: usize,
    logicals: usize,
    boot_sectors_left: usize,
}

/// Discovers every primary and logical partition of `disk`.
///
/// Primaries are named `<disk>1..4`, logicals `<disk>5..12`, matching the
/// slot they landed in.
pub fn partition_scan(disk: &Arc<Disk>) -> Vec<Arc<Partition>> {
    let mut state = ScanState {
        ext_lba_base: 0,
        primaries: 0,
        logicals: 0,
        boot_sectors_left: SCAN_BUDGET,
    };
    let mut found = Vec::new();
    scan_boot_sector(disk, 0, &mut state, &mut found);
    found
}

fn scan_boot_sector(
    disk: &Arc<Disk>,
    ext_lba: u32,
    state: &mut ScanState,
    found: &mut Vec<Arc<Partition>>,
) {
    if state.boot_sectors_left == 0 {
        warn!("{}: partition chain too long, scan stopped", disk.name);
        return;
    }
    state.boot_sectors_left -= 1;

    let mut buf = vec![0u8; SECTOR_SIZE];
    disk.read_sectors(ext_lba, &mut buf);
    let boot_sector = BootSector::decode(&buf);
    if !boot_sector.is_valid() {
        warn!("{}: sector {} carries no partition table", disk.name, ext_lba);
        return;
    }

    for entry in boot_sector.partition_table.iter() {
        if entry.is_extended() {
            if state.ext_lba_base != 0 {
                // an EBR link: relative to the extended base
                scan_boot_sector(disk, entry.start_lba + state.ext_lba_base, state, found);
            } else {
                // the MBR's extended entry fixes the base every later
                // offset is measured from
                state.ext_lba_base = entry.start_lba;
                scan_boot_sector(disk, entry.start_lba, state, found);
            }
        } else if entry.is_used() {
            if ext_lba == 0 {
                assert!(state.primaries < MAX_PRIM_PARTS);
                let name = format!("{}{}", disk.name, state.primaries + 1);
                found.push(Arc::new(Partition {
                    name,
                    start_lba: entry.start_lba,
                    sec_cnt: entry.sec_cnt,
                    disk: Arc::clone(disk),
                }));
                state.primaries += 1;
            } else {
                let name = format!("{}{}", disk.name, state.logicals + 5);
                found.push(Arc::new(Partition {
                    name,
                    start_lba: ext_lba + entry.start_lba,
                    sec_cnt: entry.sec_cnt,
                    disk: Arc::clone(disk),
                }));
                state.logicals += 1;
                if state.logicals >= MAX_LOGIC_PARTS {
                    return;
                }
            }
        }
    }
}

/// Logs one line per discovered partition, like the boot banner does.
pub fn report_partitions(partitions: &[Arc<Partition>]) {
    for part in partitions {
        info!(
            "  {} start_lba {:#x}, sec_cnt {:#x}",
            part.name, part.start_lba, part.sec_cnt
        );
    }
}
