//! IDE channel driver: programs the ATA command register file over PIO and
//! parks the calling thread on the channel's completion semaphore until the
//! controller's interrupt arrives.
//!
//! One channel serializes both attached drives behind a single lock; the
//! only timeout is the bounded readiness poll after a command, and running
//! it dry is treated as an unrecoverable controller failure.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use core::cmp::min;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use log::info;

use fs_lib::{MAX_LBA, SECTOR_SIZE};

use crate::hal::Hal;
use crate::lock::{Semaphore, SleepLock};

/// Base I/O ports of the primary and secondary channel.
pub(crate) const CHANNEL_PORTS: [u16; 2] = [0x1F0, 0x0170];

/// Interrupt vectors of the two channels: IRQ 14 and IRQ 15 behind the
/// 0x20 remap.
pub(crate) const CHANNEL_INTRS: [u8; 2] = [0x20 + 14, 0x20 + 15];

// register offsets from the channel base port
pub(crate) const REG_DATA: u16 = 0;
pub(crate) const REG_SECT_CNT: u16 = 2;
pub(crate) const REG_LBA_L: u16 = 3;
pub(crate) const REG_LBA_M: u16 = 4;
pub(crate) const REG_LBA_H: u16 = 5;
pub(crate) const REG_DEV: u16 = 6;
pub(crate) const REG_STATUS: u16 = 7;
pub(crate) const REG_CMD: u16 = 7;

bitflags! {
    /// Status register bits.
    pub struct Status: u8 {
        const BSY  = 0x80;
        const DRDY = 0x40;
        const DRQ  = 0x08;
    }
}

// drive/head register bits
pub(crate) const BIT_DEV_MBS: u8 = 0xA0; // reserved bits, always set
pub(crate) const BIT_DEV_LBA: u8 = 0x40;
pub(crate) const BIT_DEV_DEV: u8 = 0x10; // selects the slave drive

// command codes
pub(crate) const CMD_IDENTIFY: u8 = 0xEC;
pub(crate) const CMD_READ_SECTOR: u8 = 0x20;
pub(crate) const CMD_WRITE_SECTOR: u8 = 0x30;

/// Readiness poll budget after a command, in milliseconds.
const BUSY_WAIT_MS: u32 = 30 * 1000;

/// Largest sector count one ATA command can carry; the count register
/// encodes it as 0.
pub(crate) const MAX_SECS_PER_CMD: usize = 256;

/// One ATA command/status register set, shared by up to two drives.
pub struct IdeChannel {
    pub name: String,
    port_base: u16,
    intr_no: u8,
    /// Serializes register programming and data transfers for both drives.
    lock: SleepLock<()>,
    /// True only between command issue and the completion interrupt.
    expecting_intr: AtomicBool,
    /// Raised once per command by the interrupt handler.
    disk_done: Semaphore,
    hal: Arc<dyn Hal>,
}

impl IdeChannel {
    /// Creates channel `channel_no` and hooks its interrupt vector.
    pub fn new(channel_no: usize, hal: Arc<dyn Hal>) -> Arc<Self> {
        assert!(channel_no < CHANNEL_PORTS.len());
        let channel = Arc::new(Self {
            name: format!("ide{}", channel_no),
            port_base: CHANNEL_PORTS[channel_no],
            intr_no: CHANNEL_INTRS[channel_no],
            lock: SleepLock::new((), "ide_channel"),
            expecting_intr: AtomicBool::new(false),
            disk_done: Semaphore::new(0, "disk_done"),
            hal,
        });
        let intr_channel = Arc::clone(&channel);
        channel
            .hal
            .register_intr(channel.intr_no, Box::new(move || intr_channel.handle_intr()));
        channel
    }

    /// Completion interrupt for this channel.
    ///
    /// Signals the waiter exactly once per issued command. An interrupt
    /// outside an expecting window is stale (or spurious) and is dropped
    /// without touching the semaphore.
    pub fn handle_intr(&self) {
        if self.expecting_intr.swap(false, Ordering::AcqRel) {
            self.disk_done.up();
            // reading the status register lets the controller accept the
            // next command
            self.hal.inb(self.port_base + REG_STATUS);
        }
    }

    /// Issues `cmd`. The expecting flag must be visible before the command
    /// register is written: the interrupt can fire before `outb` returns.
    fn cmd_out(&self, cmd: u8) {
        self.expecting_intr.store(true, Ordering::Release);
        self.hal.outb(self.port_base + REG_CMD, cmd);
    }

    fn reg(&self, offset: u16) -> u16 {
        self.port_base + offset
    }
}

/// Serial number, model string and usable sector count reported by
/// IDENTIFY.
#[derive(Debug)]
pub struct DiskIdent {
    pub serial: String,
    pub model: String,
    pub sectors: u32,
}

/// One physical drive on a channel.
pub struct Disk {
    pub name: String,
    channel: Arc<IdeChannel>,
    /// 0 = master, 1 = slave.
    dev_no: u8,
    /// Usable sector count from IDENTIFY.
    pub sectors: u32,
}

impl Disk {
    /// Creates the drive and identifies it once.
    pub fn new(name: String, channel: Arc<IdeChannel>, dev_no: u8) -> Arc<Self> {
        assert!(dev_no < 2);
        let mut disk = Self {
            name,
            channel,
            dev_no,
            sectors: 0,
        };
        let ident = disk.identify();
        info!(
            "disk {}: SN {}, MODEL {}, {} sectors ({} MiB)",
            disk.name,
            ident.serial,
            ident.model,
            ident.sectors,
            ident.sectors as usize * SECTOR_SIZE / 1024 / 1024
        );
        disk.sectors = ident.sectors;
        Arc::new(disk)
    }

    /// Selects this drive on its channel and enables LBA addressing.
    fn select(&self) {
        let mut device = BIT_DEV_MBS | BIT_DEV_LBA;
        if self.dev_no == 1 {
            device |= BIT_DEV_DEV;
        }
        self.hal().outb(self.channel.reg(REG_DEV), device);
    }

    /// Programs the start sector and sector count of the next command.
    /// A count of [`MAX_SECS_PER_CMD`] is encoded as 0.
    fn select_sector(&self, lba: u32, sec_cnt: u8) {
        assert!(lba <= MAX_LBA);
        let channel = &self.channel;
        let hal = self.hal();
        hal.outb(channel.reg(REG_SECT_CNT), sec_cnt);
        hal.outb(channel.reg(REG_LBA_L), lba as u8);
        hal.outb(channel.reg(REG_LBA_M), (lba >> 8) as u8);
        hal.outb(channel.reg(REG_LBA_H), (lba >> 16) as u8);
        // bits 24..28 of the LBA share the drive/head register
        let mut device = BIT_DEV_MBS | BIT_DEV_LBA | ((lba >> 24) as u8 & 0x0F);
        if self.dev_no == 1 {
            device |= BIT_DEV_DEV;
        }
        hal.outb(channel.reg(REG_DEV), device);
    }

    /// Polls the status register until the busy bit clears, sleeping 10 ms
    /// per round, for at most 30 seconds. Returns whether the drive then
    /// asserts data-request.
    fn busy_wait(&self) -> bool {
        let hal = self.hal();
        let status_port = self.channel.reg(REG_STATUS);
        let mut time_left = BUSY_WAIT_MS;
        while time_left > 0 {
            let status = Status::from_bits_truncate(hal.inb(status_port));
            if !status.contains(Status::BSY) {
                let status = Status::from_bits_truncate(hal.inb(status_port));
                return status.contains(Status::DRQ);
            }
            hal.sleep_ms(10);
            time_left -= 10;
        }
        false
    }

    /// Reads `buf.len() / SECTOR_SIZE` sectors starting at `lba`.
    ///
    /// Per chunk: program address, issue READ, block until the interrupt
    /// signals completion, check readiness, then pull the data words in.
    pub fn read_sectors(&self, lba: u32, buf: &mut [u8]) {
        assert!(buf.len() % SECTOR_SIZE == 0);
        let sec_cnt = buf.len() / SECTOR_SIZE;
        assert!(sec_cnt > 0);
        assert!(lba + sec_cnt as u32 - 1 <= MAX_LBA);

        let hal = self.hal();
        let _guard = self.channel.lock.lock(hal);
        self.select();

        let mut secs_done = 0;
        while secs_done < sec_cnt {
            let secs_op = min(MAX_SECS_PER_CMD, sec_cnt - secs_done);
            self.select_sector(lba + secs_done as u32, secs_op as u8);
            self.channel.cmd_out(CMD_READ_SECTOR);

            // the drive is seeking; give the processor away until its
            // interrupt wakes us
            self.channel.disk_done.down(hal);

            if !self.busy_wait() {
                panic!("{}: read sector {} failed", self.name, lba + secs_done as u32);
            }
            let chunk = &mut buf[secs_done * SECTOR_SIZE..(secs_done + secs_op) * SECTOR_SIZE];
            hal.insw(self.channel.reg(REG_DATA), chunk);
            secs_done += secs_op;
        }
    }

    /// Writes `buf.len() / SECTOR_SIZE` sectors starting at `lba`.
    ///
    /// The write protocol is not the mirror image of the read protocol:
    /// the drive wants the data words right after it reports ready, and its
    /// interrupt comes once the transfer has been accepted.
    pub fn write_sectors(&self, lba: u32, buf: &[u8]) {
        assert!(buf.len() % SECTOR_SIZE == 0);
        let sec_cnt = buf.len() / SECTOR_SIZE;
        assert!(sec_cnt > 0);
        assert!(lba + sec_cnt as u32 - 1 <= MAX_LBA);

        let hal = self.hal();
        let _guard = self.channel.lock.lock(hal);
        self.select();

        let mut secs_done = 0;
        while secs_done < sec_cnt {
            let secs_op = min(MAX_SECS_PER_CMD, sec_cnt - secs_done);
            self.select_sector(lba + secs_done as u32, secs_op as u8);
            self.channel.cmd_out(CMD_WRITE_SECTOR);

            if !self.busy_wait() {
                panic!("{}: write sector {} failed", self.name, lba + secs_done as u32);
            }
            let chunk = &buf[secs_done * SECTOR_SIZE..(secs_done + secs_op) * SECTOR_SIZE];
            hal.outsw(self.channel.reg(REG_DATA), chunk);

            self.channel.disk_done.down(hal);
            secs_done += secs_op;
        }
    }

    /// Issues IDENTIFY and decodes the drive parameters.
    pub fn identify(&self) -> DiskIdent {
        let hal = self.hal();
        let _guard = self.channel.lock.lock(hal);

        self.select();
        self.channel.cmd_out(CMD_IDENTIFY);
        self.channel.disk_done.down(hal);
        if !self.busy_wait() {
            panic!("{}: identify failed", self.name);
        }

        let mut id_info = [0u8; SECTOR_SIZE];
        hal.insw(self.channel.reg(REG_DATA), &mut id_info);

        // serial number: word 10, 20 bytes; model: word 27, 40 bytes;
        // both stored with the bytes of every word swapped
        let serial = swap_pairs_bytes(&id_info[10 * 2..10 * 2 + 20]);
        let model = swap_pairs_bytes(&id_info[27 * 2..27 * 2 + 40]);
        // usable sector count: word 60, one u32
        let mut sectors = [0u8; 4];
        sectors.copy_from_slice(&id_info[60 * 2..60 * 2 + 4]);

        DiskIdent {
            serial,
            model,
            sectors: u32::from_le_bytes(sectors),
        }
    }

    fn hal(&self) -> &dyn Hal {
        &*self.channel.hal
    }
}

/// Un-swaps an IDENTIFY string field and trims the space padding.
fn swap_pairs_bytes(field: &[u8]) -> String {
    let mut out = String::with_capacity(field.len());
    for pair in field.chunks_exact(2) {
        out.push(pair[1] as char);
        out.push(pair[0] as char);
    }
    out.trim_matches(|c: char| c == ' ' || c == '\0').into()
}
