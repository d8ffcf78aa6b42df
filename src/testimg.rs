//! In-memory block device and volume fixtures shared by the unit tests.

use crate::access::{put_u16, put_u32, put_u64};
use crate::device::BlockDevice;
use crate::direntry::{ATTR_ARCHIVE, ATTR_DIRECTORY, build_file_set};
use crate::error::ExfatError;
use crate::fat::EOC;
use crate::fs::ExFatVolume;
use crate::superblock::SuperBlock;
use crate::times::{EntryTime, EntryTimes};
use crate::upcase::{UpcaseTable, upcase_checksum};
use std::io;

/// A RAM-backed block device with 512-byte sectors.
pub struct RamDisk {
    data: Vec<u8>,
    read_only: bool,
    closed: bool,
}

impl RamDisk {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            read_only: false,
            closed: false,
        }
    }

    pub fn with_boot(size: usize, boot: &[u8]) -> Self {
        let mut d = Self::new(size);
        d.fill(0, boot);
        d
    }

    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data,
            read_only: true,
            closed: false,
        }
    }

    /// Test-side poke that bypasses the device interface entirely.
    pub fn fill(&mut self, offset: u64, bytes: &[u8]) {
        let o = offset as usize;
        self.data[o..o + bytes.len()].copy_from_slice(bytes);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    /// Undoes a `close`, so one backing buffer can be mounted again.
    pub fn reopen(&mut self) {
        self.closed = false;
    }
}

impl BlockDevice for RamDisk {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn sector_size(&self) -> u64 {
        512
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ExfatError> {
        if self.closed {
            return Err(ExfatError::Closed("device is closed".into()));
        }
        let o = offset as usize;
        let end = o
            .checked_add(buf.len())
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                ExfatError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past device end",
                ))
            })?;
        buf.copy_from_slice(&self.data[o..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), ExfatError> {
        if self.closed {
            return Err(ExfatError::Closed("device is closed".into()));
        }
        if self.read_only {
            return Err(ExfatError::ReadOnly("device is read-only".into()));
        }
        let o = offset as usize;
        let end = o
            .checked_add(buf.len())
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                ExfatError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "write past device end",
                ))
            })?;
        self.data[o..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ExfatError> {
        if self.closed {
            return Err(ExfatError::Closed("device is closed".into()));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ExfatError> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// A minimal boot block with the given geometry, revision 1.0, one FAT
/// and valid signatures.
pub fn boot_block(
    block_count: u64,
    fat_start: u32,
    fat_count: u32,
    heap_start: u32,
    cluster_count: u32,
    root_cluster: u32,
    serial: u32,
    block_shift: u8,
    cluster_shift: u8,
) -> [u8; 512] {
    let mut b = [0u8; 512];
    b[0] = 0xEB;
    b[1] = 0x76;
    b[2] = 0x90;
    b[3..11].copy_from_slice(b"EXFAT   ");
    put_u64(&mut b, 0x48, block_count);
    put_u32(&mut b, 0x50, fat_start);
    put_u32(&mut b, 0x54, fat_count);
    put_u32(&mut b, 0x58, heap_start);
    put_u32(&mut b, 0x5C, cluster_count);
    put_u32(&mut b, 0x60, root_cluster);
    put_u32(&mut b, 0x64, serial);
    b[0x69] = 1;
    b[0x6C] = block_shift;
    b[0x6D] = cluster_shift;
    b[0x6E] = 1;
    b[0x6F] = 0x80;
    put_u16(&mut b, 510, 0xAA55);
    b
}

/// Small well-formed geometry: 512-byte blocks, 2 KiB clusters, 256
/// clusters, root at cluster 4. The heap ends exactly at the device end.
pub fn toy_superblock() -> SuperBlock {
    SuperBlock {
        fs_name: *b"EXFAT   ",
        block_start: 0,
        block_count: 1056,
        fat_block_start: 24,
        fat_block_count: 8,
        cluster_block_start: 32,
        cluster_count: 256,
        root_dir_cluster: 4,
        volume_serial: 0x1234_5678,
        fs_version_minor: 0,
        fs_version_major: 1,
        volume_state: 0,
        block_size_shift: 9,
        blocks_per_cluster_shift: 2,
        num_fats: 1,
        drive_select: 0x80,
        percent_in_use: 0,
    }
}

/// Compressed upcase stream covering code points 0x00..=0xFF: identity
/// runs everywhere except a-z and the Latin-1 letters ä, ö and ü, which
/// fold to their upper-case forms.
pub fn upcase_stream() -> Vec<u8> {
    let mut units: Vec<u16> = Vec::new();
    units.extend([0xFFFF, 0x0061]); // identity 0x00..=0x60
    units.extend(0x41u16..=0x5A); // a..z fold to A..Z
    units.extend([0xFFFF, 0x0069]); // identity 0x7B..=0xE3
    units.push(0x00C4); // ä
    units.extend([0xFFFF, 0x0011]); // identity 0xE5..=0xF5
    units.push(0x00D6); // ö
    units.extend([0xFFFF, 0x0005]); // identity 0xF7..=0xFB
    units.push(0x00DC); // ü
    units.extend([0xFFFF, 0x0003]); // identity 0xFD..=0xFF
    units.iter().flat_map(|u| u.to_le_bytes()).collect()
}

/// The same mapping as `upcase_stream`, already decoded.
fn decoded_upcase() -> Vec<u16> {
    let mut t: Vec<u16> = (0x00u16..=0x60).collect();
    t.extend(0x41u16..=0x5A);
    t.extend(0x7Bu16..=0xE3);
    t.push(0xC4);
    t.extend(0xE5u16..=0xF5);
    t.push(0xD6);
    t.extend(0xF7u16..=0xFB);
    t.push(0xDC);
    t.extend(0xFDu16..=0xFF);
    t
}

pub fn test_upcase() -> UpcaseTable {
    UpcaseTable::from_table(decoded_upcase())
}

/// A fixed, even-second UTC instant that survives the packed timestamp
/// round trip bit for bit: 2020-01-01T12:30:08Z.
pub fn fixed_times() -> EntryTimes {
    let t = EntryTime {
        unix_secs: 1_577_881_808,
        centis: 0,
        tz_offset_quarters: Some(0),
    };
    EntryTimes {
        created: t,
        modified: t,
        accessed: t,
    }
}

pub const BIG_LEN: usize = 4196;

fn label_entry(label: &str) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[0] = 0x83;
    let units: Vec<u16> = label.encode_utf16().collect();
    e[1] = units.len() as u8;
    for (i, &u) in units.iter().enumerate() {
        put_u16(&mut e, 2 + i * 2, u);
    }
    e
}

fn bitmap_entry(first_cluster: u32, size: u64) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[0] = 0x81;
    put_u32(&mut e, 20, first_cluster);
    put_u64(&mut e, 24, size);
    e
}

fn upcase_entry(checksum: u32, first_cluster: u32, size: u64) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[0] = 0x82;
    put_u32(&mut e, 4, checksum);
    put_u32(&mut e, 20, first_cluster);
    put_u64(&mut e, 24, size);
    e
}

/// A complete volume on the toy geometry:
///
/// cluster 2: allocation bitmap (clusters 2..=10 marked used)
/// cluster 3: upcase table
/// cluster 4: root directory (label TESTVOL, bitmap, upcase, 3 files)
/// cluster 5: "readme.txt", 11 bytes
/// cluster 6: "data" directory holding "inner.txt"
/// cluster 7: "inner.txt", 10 bytes
/// clusters 8 -> 9 -> 10: "big.bin", 4196 bytes on a FAT chain
pub fn default_volume() -> RamDisk {
    let sb = toy_superblock();
    let cs = sb.bytes_per_cluster();
    let mut disk = RamDisk::new(sb.block_count as usize * 512);

    let mut boot = boot_block(
        sb.block_count,
        sb.fat_block_start,
        sb.fat_block_count,
        sb.cluster_block_start,
        sb.cluster_count,
        sb.root_dir_cluster,
        sb.volume_serial,
        sb.block_size_shift,
        sb.blocks_per_cluster_shift,
    );
    boot[0x70] = 0;
    disk.fill(0, &boot);

    // FAT head plus the chains. Only FAT-linked files get entries.
    let fat_off = |c: u32| sb.fat_start_byte() + u64::from(c) * 4;
    disk.fill(fat_off(0), &0xFFFF_FFF8u32.to_le_bytes());
    disk.fill(fat_off(1), &EOC.to_le_bytes());
    disk.fill(fat_off(2), &EOC.to_le_bytes());
    disk.fill(fat_off(3), &EOC.to_le_bytes());
    disk.fill(fat_off(4), &EOC.to_le_bytes());
    disk.fill(fat_off(5), &EOC.to_le_bytes());
    disk.fill(fat_off(6), &EOC.to_le_bytes());
    disk.fill(fat_off(7), &EOC.to_le_bytes());
    disk.fill(fat_off(8), &9u32.to_le_bytes());
    disk.fill(fat_off(9), &10u32.to_le_bytes());
    disk.fill(fat_off(10), &EOC.to_le_bytes());

    // Allocation bitmap: bits 0..=8 cover clusters 2..=10.
    disk.fill(sb.cluster_to_byte_offset(2), &[0xFF, 0x01]);

    let stream = upcase_stream();
    disk.fill(sb.cluster_to_byte_offset(3), &stream);

    disk.fill(sb.cluster_to_byte_offset(5), b"hello exfat");
    disk.fill(sb.cluster_to_byte_offset(7), b"inner data");
    let big: Vec<u8> = (0..BIG_LEN).map(|i| (i % 251) as u8).collect();
    disk.fill(sb.cluster_to_byte_offset(8), &big);

    let up = test_upcase();
    let times = fixed_times();
    let mut root: Vec<u8> = Vec::new();
    root.extend_from_slice(&label_entry("TESTVOL"));
    root.extend_from_slice(&bitmap_entry(2, u64::from(sb.cluster_count).div_ceil(8)));
    root.extend_from_slice(&upcase_entry(
        upcase_checksum(&stream),
        3,
        stream.len() as u64,
    ));
    for set in [
        build_file_set("readme.txt", ATTR_ARCHIVE, &times, 5, 11, 11, false, &up).unwrap(),
        build_file_set("data", ATTR_DIRECTORY, &times, 6, cs, cs, false, &up).unwrap(),
        build_file_set(
            "big.bin",
            ATTR_ARCHIVE,
            &times,
            8,
            BIG_LEN as u64,
            BIG_LEN as u64,
            false,
            &up,
        )
        .unwrap(),
    ] {
        for e in set {
            root.extend_from_slice(&e.raw);
        }
    }
    disk.fill(sb.cluster_to_byte_offset(4), &root);

    let mut dir: Vec<u8> = Vec::new();
    for e in build_file_set("inner.txt", ATTR_ARCHIVE, &times, 7, 10, 10, false, &up).unwrap() {
        dir.extend_from_slice(&e.raw);
    }
    disk.fill(sb.cluster_to_byte_offset(6), &dir);

    disk
}

/// Takes the device out of a volume, reopens it and mounts it again.
pub fn remount(vol: ExFatVolume<RamDisk>, read_only: bool) -> ExFatVolume<RamDisk> {
    let mut disk = vol.into_device();
    disk.reopen();
    ExFatVolume::read(disk, read_only).unwrap()
}

/// Surfaces driver logs in test output when RUST_LOG is set.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
