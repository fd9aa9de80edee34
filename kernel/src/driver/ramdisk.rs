//! RAM-backed IDE device.
//!
//! Implements [`Hal`] by emulating the ATA register file of both channels
//! over in-memory drives: it decodes the drive/head and LBA registers,
//! serves READ/WRITE/IDENTIFY with the sector-count-0-means-256 encoding,
//! and raises the channel interrupt exactly once per command. `mkfs` runs
//! the real driver and filesystem against it to build disk images, and the
//! tests use its register log to check programming order.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use fs_lib::SECTOR_SIZE;

use super::ide::{
    CHANNEL_INTRS, CHANNEL_PORTS, CMD_IDENTIFY, CMD_READ_SECTOR, CMD_WRITE_SECTOR, REG_CMD,
    REG_DATA, REG_DEV, REG_LBA_H, REG_LBA_L, REG_LBA_M, REG_SECT_CNT, REG_STATUS, Status,
    BIT_DEV_DEV, MAX_SECS_PER_CMD,
};
use crate::hal::{Hal, IntrHandler};

/// Offset of the alternate status register from the channel base.
const ALT_STATUS_OFFSET: u16 = 0x206;

/// Drives an emulated controller can carry: two channels, two drives each.
const MAX_DRIVES: usize = 4;

enum Op {
    /// Device to host (READ, IDENTIFY); `buf` is prefilled.
    DataIn,
    /// Host to device (WRITE); `buf` accumulates until `byte_len`.
    DataOut,
}

struct Transfer {
    op: Op,
    drive: usize,
    lba: u32,
    byte_len: usize,
    buf: Vec<u8>,
    pos: usize,
}

#[derive(Default)]
struct ChannelState {
    sec_cnt: u8,
    lba_low: u8,
    lba_mid: u8,
    lba_high: u8,
    device: u8,
    transfer: Option<Transfer>,
}

pub struct RamDisk {
    channels: [Mutex<ChannelState>; 2],
    handlers: Mutex<[Option<IntrHandler>; 2]>,
    drives: Vec<Mutex<Vec<u8>>>,
    outb_log: Mutex<Vec<(u16, u8)>>,
}

impl RamDisk {
    /// One emulated drive per entry of `sector_counts`, attached in channel
    /// order (channel 0 master, channel 0 slave, channel 1 master, ...).
    pub fn new(sector_counts: &[usize]) -> Arc<Self> {
        assert!(!sector_counts.is_empty() && sector_counts.len() <= MAX_DRIVES);
        let drives = sector_counts
            .iter()
            .map(|count| Mutex::new(vec![0u8; count * SECTOR_SIZE]))
            .collect();
        Arc::new(Self {
            channels: [Mutex::new(ChannelState::default()), Mutex::new(ChannelState::default())],
            handlers: Mutex::new([None, None]),
            drives,
            outb_log: Mutex::new(Vec::new()),
        })
    }

    /// Seeds drive content directly, bypassing the register protocol.
    /// Image tools use this to lay down a boot sector before the driver
    /// ever sees the disk.
    pub fn load(&self, drive: usize, offset: usize, bytes: &[u8]) {
        let mut data = self.drives[drive].lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Clones out the full byte image of a drive.
    pub fn dump(&self, drive: usize) -> Vec<u8> {
        self.drives[drive].lock().clone()
    }

    /// Every `outb` seen so far, in order.
    pub fn outb_log(&self) -> Vec<(u16, u8)> {
        self.outb_log.lock().clone()
    }

    pub fn clear_outb_log(&self) {
        self.outb_log.lock().clear();
    }

    /// How many times `cmd` was written to either command register.
    pub fn command_count(&self, cmd: u8) -> usize {
        let cmd_ports = [CHANNEL_PORTS[0] + REG_CMD, CHANNEL_PORTS[1] + REG_CMD];
        self.outb_log
            .lock()
            .iter()
            .filter(|(port, value)| cmd_ports.contains(port) && *value == cmd)
            .count()
    }

    fn decode_port(&self, port: u16) -> (usize, u16) {
        for (channel, base) in CHANNEL_PORTS.iter().enumerate() {
            if port >= *base && port <= *base + REG_STATUS {
                return (channel, port - base);
            }
            if port == *base + ALT_STATUS_OFFSET {
                return (channel, REG_STATUS);
            }
        }
        panic!("ramdisk: access to unmapped port {:#x}", port);
    }

    fn raise_intr(&self, channel: usize) {
        let handlers = self.handlers.lock();
        if let Some(handler) = &handlers[channel] {
            handler();
        }
    }

    /// Executes the command just written to `channel`'s command register.
    /// Returns whether to raise the completion interrupt now.
    fn start_command(&self, channel: usize, state: &mut ChannelState, cmd: u8) -> bool {
        let drive = channel * 2 + ((state.device & BIT_DEV_DEV) != 0) as usize;
        let lba = (state.lba_low as u32)
            | (state.lba_mid as u32) << 8
            | (state.lba_high as u32) << 16
            | ((state.device & 0x0F) as u32) << 24;
        let sec_cnt = if state.sec_cnt == 0 {
            MAX_SECS_PER_CMD
        } else {
            state.sec_cnt as usize
        };
        let byte_len = sec_cnt * SECTOR_SIZE;

        match cmd {
            CMD_READ_SECTOR => {
                let data = self.drives[drive].lock();
                let start = lba as usize * SECTOR_SIZE;
                assert!(start + byte_len <= data.len(), "read past end of drive");
                state.transfer = Some(Transfer {
                    op: Op::DataIn,
                    drive,
                    lba,
                    byte_len,
                    buf: data[start..start + byte_len].to_vec(),
                    pos: 0,
                });
                true
            }
            CMD_WRITE_SECTOR => {
                let data = self.drives[drive].lock();
                let start = lba as usize * SECTOR_SIZE;
                assert!(start + byte_len <= data.len(), "write past end of drive");
                drop(data);
                state.transfer = Some(Transfer {
                    op: Op::DataOut,
                    drive,
                    lba,
                    byte_len,
                    buf: Vec::with_capacity(byte_len),
                    pos: 0,
                });
                // the interrupt comes once the data words have arrived
                false
            }
            CMD_IDENTIFY => {
                state.transfer = Some(Transfer {
                    op: Op::DataIn,
                    drive,
                    lba: 0,
                    byte_len: SECTOR_SIZE,
                    buf: self.identify_data(drive),
                    pos: 0,
                });
                true
            }
            _ => panic!("ramdisk: unknown command {:#x}", cmd),
        }
    }

    fn identify_data(&self, drive: usize) -> Vec<u8> {
        let mut data = vec![0u8; SECTOR_SIZE];
        let serial = format!("{: <20}", format!("RD-{:04}", drive));
        let model = format!("{: <40}", "RAM VIRTUAL DISK");
        store_swapped(&mut data[10 * 2..10 * 2 + 20], serial.as_bytes());
        store_swapped(&mut data[27 * 2..27 * 2 + 40], model.as_bytes());
        let sectors = (self.drives[drive].lock().len() / SECTOR_SIZE) as u32;
        data[60 * 2..60 * 2 + 4].copy_from_slice(&sectors.to_le_bytes());
        data
    }

    fn status(&self, state: &ChannelState) -> u8 {
        let mut status = Status::DRDY;
        if let Some(transfer) = &state.transfer {
            let pending = match transfer.op {
                Op::DataIn => transfer.pos < transfer.byte_len,
                Op::DataOut => transfer.buf.len() < transfer.byte_len,
            };
            if pending {
                status |= Status::DRQ;
            }
        }
        status.bits()
    }
}

impl Hal for RamDisk {
    fn outb(&self, port: u16, data: u8) {
        self.outb_log.lock().push((port, data));
        let (channel, offset) = self.decode_port(port);
        let mut raise = false;
        {
            let mut state = self.channels[channel].lock();
            match offset {
                REG_SECT_CNT => state.sec_cnt = data,
                REG_LBA_L => state.lba_low = data,
                REG_LBA_M => state.lba_mid = data,
                REG_LBA_H => state.lba_high = data,
                REG_DEV => state.device = data,
                REG_CMD => raise = self.start_command(channel, &mut state, data),
                _ => panic!("ramdisk: byte write to register {}", offset),
            }
        }
        if raise {
            self.raise_intr(channel);
        }
    }

    fn inb(&self, port: u16) -> u8 {
        let (channel, offset) = self.decode_port(port);
        let state = self.channels[channel].lock();
        match offset {
            REG_STATUS => self.status(&state),
            // error register: never any failure to report
            1 => 0,
            _ => panic!("ramdisk: byte read from register {}", offset),
        }
    }

    fn insw(&self, port: u16, buf: &mut [u8]) {
        let (channel, offset) = self.decode_port(port);
        assert_eq!(offset, REG_DATA);
        let mut state = self.channels[channel].lock();
        let transfer = state.transfer.as_mut().expect("data-in without a command");
        assert!(matches!(transfer.op, Op::DataIn));
        buf.copy_from_slice(&transfer.buf[transfer.pos..transfer.pos + buf.len()]);
        transfer.pos += buf.len();
        if transfer.pos == transfer.byte_len {
            state.transfer = None;
        }
    }

    fn outsw(&self, port: u16, buf: &[u8]) {
        let (channel, offset) = self.decode_port(port);
        assert_eq!(offset, REG_DATA);
        let mut raise = false;
        {
            let mut state = self.channels[channel].lock();
            let transfer = state.transfer.as_mut().expect("data-out without a command");
            assert!(matches!(transfer.op, Op::DataOut));
            transfer.buf.extend_from_slice(buf);
            assert!(transfer.buf.len() <= transfer.byte_len);
            if transfer.buf.len() == transfer.byte_len {
                let mut data = self.drives[transfer.drive].lock();
                let start = transfer.lba as usize * SECTOR_SIZE;
                data[start..start + transfer.byte_len].copy_from_slice(&transfer.buf);
                drop(data);
                state.transfer = None;
                raise = true;
            }
        }
        if raise {
            self.raise_intr(channel);
        }
    }

    fn register_intr(&self, intr_no: u8, handler: IntrHandler) {
        let channel = CHANNEL_INTRS
            .iter()
            .position(|no| *no == intr_no)
            .expect("ramdisk: not an IDE interrupt vector");
        self.handlers.lock()[channel] = Some(handler);
    }

    fn sleep_ms(&self, _ms: u32) {
        // commands complete synchronously; nothing to wait out
        core::hint::spin_loop();
    }

    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

/// Stores `src` with each byte pair swapped, the way IDENTIFY string
/// fields are laid out on the wire.
fn store_swapped(dst: &mut [u8], src: &[u8]) {
    for (pair, bytes) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        pair[0] = bytes[1];
        pair[1] = bytes[0];
    }
}
