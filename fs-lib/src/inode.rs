use static_assertions::const_assert;

use crate::{read_u32, write_u32, NDIRECT, SECTOR_SIZE};

/// On-disk inode record.
///
/// `i_sectors[0..12]` are direct block pointers (absolute LBAs),
/// `i_sectors[12]` points at the single indirect table. A pointer value of
/// zero means "no block".
///
/// The record also reserves room for the fields that only matter in memory
/// (open count, write-deny flag, cache-list linkage); they are written to
/// disk as zeros and ignored when read back. That keeps the record at
/// [`DiskInode::SIZE`] bytes, which does not divide the sector size, so
/// an inode may straddle two sectors.
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    pub i_no: u32,
    /// File size in bytes; for a directory, the byte total of its entries.
    pub i_size: u32,
    pub i_sectors: [u32; NDIRECT + 1],
}

const_assert!(DiskInode::SIZE < SECTOR_SIZE);

impl DiskInode {
    /// i_no + i_size + open count + write-deny + 13 pointers + 2 list words.
    pub const SIZE: usize = 4 + 4 + 4 + 4 + (NDIRECT + 1) * 4 + 8;

    pub fn new(i_no: u32) -> Self {
        Self {
            i_no,
            i_size: 0,
            i_sectors: [0; NDIRECT + 1],
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= Self::SIZE);
        for byte in buf[..Self::SIZE].iter_mut() {
            *byte = 0;
        }
        write_u32(buf, 0, self.i_no);
        write_u32(buf, 4, self.i_size);
        // bytes 8..16: open count and write-deny, memory-only
        for (i, sector) in self.i_sectors.iter().enumerate() {
            write_u32(buf, 16 + i * 4, *sector);
        }
        // bytes 68..76: cache-list linkage, memory-only
    }

    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= Self::SIZE);
        let mut i_sectors = [0u32; NDIRECT + 1];
        for (i, sector) in i_sectors.iter_mut().enumerate() {
            *sector = read_u32(buf, 16 + i * 4);
        }
        Self {
            i_no: read_u32(buf, 0),
            i_size: read_u32(buf, 4),
            i_sectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_only_fields_are_zero_on_disk() {
        let mut inode = DiskInode::new(7);
        inode.i_size = 42;
        inode.i_sectors[0] = 0x1234;
        inode.i_sectors[NDIRECT] = 0x5678;

        let mut buf = [0xFFu8; DiskInode::SIZE];
        inode.encode(&mut buf);

        // open count / write-deny and the trailing list words
        assert!(buf[8..16].iter().all(|b| *b == 0));
        assert!(buf[68..76].iter().all(|b| *b == 0));

        let back = DiskInode::decode(&buf);
        assert_eq!(back.i_no, 7);
        assert_eq!(back.i_sectors[NDIRECT], 0x5678);
    }

    #[test]
    fn records_straddle_sectors() {
        // 512 is not a multiple of 76, so some record must cross a sector
        // boundary; the kernel's locate logic depends on that being real.
        let per_sector = SECTOR_SIZE / DiskInode::SIZE;
        assert!(per_sector * DiskInode::SIZE + DiskInode::SIZE > SECTOR_SIZE);
    }
}
