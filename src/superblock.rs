use crate::access::{le_u16, le_u32, le_u64};
use crate::device::BlockDevice;
use crate::error::ExfatError;
use log::{debug, warn};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Second FAT is the active one (TexFAT only).
pub const STATE_SECOND_FAT_ACTIVE: u16 = 0x0001;
/// Volume was not cleanly unmounted.
pub const STATE_DIRTY: u16 = 0x0002;

/// Volume geometry, decoded once from the boot block at mount time and
/// immutable afterwards. All byte arithmetic on the volume goes through
/// this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperBlock {
    pub fs_name: [u8; 8],         // 0x03, "EXFAT   "
    pub block_start: u64,         // 0x40, partition offset in blocks (0 for images)
    pub block_count: u64,         // 0x48, volume length in blocks
    pub fat_block_start: u32,     // 0x50
    pub fat_block_count: u32,     // 0x54
    pub cluster_block_start: u32, // 0x58
    pub cluster_count: u32,       // 0x5C
    pub root_dir_cluster: u32,    // 0x60
    pub volume_serial: u32,       // 0x64
    pub fs_version_minor: u8,     // 0x68
    pub fs_version_major: u8,     // 0x69
    pub volume_state: u16,        // 0x6A
    pub block_size_shift: u8,     // 0x6C (2^n bytes per block)
    pub blocks_per_cluster_shift: u8, // 0x6D (2^n)
    pub num_fats: u8,             // 0x6E
    pub drive_select: u8,         // 0x6F
    pub percent_in_use: u8,       // 0x70 (0xFF means unknown)
}

impl SuperBlock {
    /// Mount-time entry point: reads the boot block from the device,
    /// decodes it and validates signature and geometry against the
    /// device size.
    pub fn read<D: BlockDevice + ?Sized>(device: &mut D) -> Result<Self, ExfatError> {
        if device.size() < 512 {
            return Err(ExfatError::Format(
                "device smaller than a boot block".into(),
            ));
        }
        let mut b = [0u8; 512];
        device.read_at(0, &mut b)?;
        let sb = Self::from_bytes(&b)?;
        sb.check_geometry(device.size())?;
        debug!(
            "superblock: {} blocks of {}, {} clusters of {}, fat at {}, heap at {}, root dir cluster {}",
            sb.block_count,
            sb.block_size(),
            sb.cluster_count,
            sb.bytes_per_cluster(),
            sb.fat_block_start,
            sb.cluster_block_start,
            sb.root_dir_cluster
        );
        Ok(sb)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, ExfatError> {
        if b.len() < 512 {
            return Err(ExfatError::Format("boot block too short".into()));
        }
        if le_u16(b, 510) != 0xAA55 {
            return Err(ExfatError::Format(
                "invalid boot signature (0x55AA missing)".into(),
            ));
        }
        let mut fs_name = [0u8; 8];
        fs_name.copy_from_slice(&b[3..11]);
        if &fs_name != b"EXFAT   " {
            return Err(ExfatError::Format("exFAT filesystem name not found".into()));
        }

        let sb = Self {
            fs_name,
            block_start: le_u64(b, 0x40),
            block_count: le_u64(b, 0x48),
            fat_block_start: le_u32(b, 0x50),
            fat_block_count: le_u32(b, 0x54),
            cluster_block_start: le_u32(b, 0x58),
            cluster_count: le_u32(b, 0x5C),
            root_dir_cluster: le_u32(b, 0x60),
            volume_serial: le_u32(b, 0x64),
            fs_version_minor: b[0x68],
            fs_version_major: b[0x69],
            volume_state: le_u16(b, 0x6A),
            block_size_shift: b[0x6C],
            blocks_per_cluster_shift: b[0x6D],
            num_fats: b[0x6E],
            drive_select: b[0x6F],
            percent_in_use: b[0x70],
        };

        if sb.fs_version_major != 1 {
            return Err(ExfatError::Format(format!(
                "unsupported exFAT version {}.{}",
                sb.fs_version_major, sb.fs_version_minor
            )));
        }
        if sb.block_size_shift < 9 || sb.block_size_shift > 12 {
            return Err(ExfatError::Format(format!(
                "implausible block size (2^{} bytes)",
                sb.block_size_shift
            )));
        }
        // Clusters above 32M bytes are not valid exFAT.
        if sb.block_size_shift + sb.blocks_per_cluster_shift > 25 {
            return Err(ExfatError::Format(format!(
                "implausible cluster size (2^{} bytes)",
                sb.block_size_shift + sb.blocks_per_cluster_shift
            )));
        }
        if sb.num_fats == 0 || sb.num_fats > 2 {
            return Err(ExfatError::Format(format!(
                "invalid FAT count {}",
                sb.num_fats
            )));
        }
        if sb.cluster_count == 0 {
            return Err(ExfatError::Format("volume has no clusters".into()));
        }
        // FAT values from 0xFFFFFFF6 up are reserved, so cluster indices
        // 2..2+count must stop short of them.
        if sb.cluster_count > 0xFFFF_FFF5 {
            return Err(ExfatError::Format(format!(
                "cluster count {} above the FAT addressable maximum",
                sb.cluster_count
            )));
        }
        if sb.percent_in_use != 0xFF && sb.percent_in_use > 100 {
            warn!("percent in use {} out of range", sb.percent_in_use);
        }
        Ok(sb)
    }

    fn check_geometry(&self, device_size: u64) -> Result<(), ExfatError> {
        let volume_bytes = self
            .block_count
            .checked_mul(self.block_size())
            .ok_or_else(|| ExfatError::Format("volume length overflows".into()))?;
        if volume_bytes > device_size {
            return Err(ExfatError::Format(format!(
                "volume claims {} bytes but device has {}",
                volume_bytes, device_size
            )));
        }
        let heap_bytes = (self.cluster_count as u64)
            .checked_mul(self.bytes_per_cluster())
            .and_then(|v| v.checked_add(self.cluster_heap_start_byte()))
            .ok_or_else(|| ExfatError::Format("cluster heap overflows".into()))?;
        if heap_bytes > device_size {
            return Err(ExfatError::Format(format!(
                "cluster heap ends at {} past device end {}",
                heap_bytes, device_size
            )));
        }
        if !self.cluster_in_range(self.root_dir_cluster) {
            return Err(ExfatError::Format(format!(
                "root directory cluster {} outside cluster heap",
                self.root_dir_cluster
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_size_shift
    }
    #[inline]
    pub fn blocks_per_cluster(&self) -> u64 {
        1u64 << self.blocks_per_cluster_shift
    }
    #[inline]
    pub fn bytes_per_cluster(&self) -> u64 {
        self.block_size() * self.blocks_per_cluster()
    }

    #[inline]
    pub fn fat_start_byte(&self) -> u64 {
        self.fat_block_start as u64 * self.block_size()
    }

    /// Byte offset of the FAT that is currently active. The second FAT
    /// only exists on TexFAT volumes and is selected by a state bit.
    #[inline]
    pub fn active_fat_start_byte(&self) -> u64 {
        if self.num_fats == 2 && self.volume_state & STATE_SECOND_FAT_ACTIVE != 0 {
            self.fat_start_byte() + self.fat_block_count as u64 * self.block_size()
        } else {
            self.fat_start_byte()
        }
    }

    #[inline]
    pub fn cluster_heap_start_byte(&self) -> u64 {
        self.cluster_block_start as u64 * self.block_size()
    }

    /// First block of a data cluster. Cluster numbering starts at 2.
    #[inline]
    pub fn cluster_to_block(&self, cluster: u32) -> u64 {
        self.cluster_block_start as u64 + (cluster as u64 - 2) * self.blocks_per_cluster()
    }

    #[inline]
    pub fn cluster_to_byte_offset(&self, cluster: u32) -> u64 {
        self.cluster_to_block(cluster) * self.block_size()
    }

    /// Whether `cluster` lies inside the cluster heap.
    #[inline]
    pub fn cluster_in_range(&self, cluster: u32) -> bool {
        cluster >= 2 && u64::from(cluster) < 2 + u64::from(self.cluster_count)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.volume_state & STATE_DIRTY != 0
    }

    /// Occupancy as recorded on disk; `None` when the volume reports it
    /// as unknown (0xFF).
    #[inline]
    pub fn percent_in_use(&self) -> Option<u8> {
        if self.percent_in_use == 0xFF {
            None
        } else {
            Some(self.percent_in_use)
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(Row::new(vec![
            Cell::new("Bytes/block"),
            Cell::new(&self.block_size().to_string()),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Blocks/cluster"),
            Cell::new(&self.blocks_per_cluster().to_string()),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Blocks"),
            Cell::new(&self.block_count.to_string()),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Clusters"),
            Cell::new(&self.cluster_count.to_string()),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("FAT start block"),
            Cell::new(&self.fat_block_start.to_string()),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Cluster heap start block"),
            Cell::new(&self.cluster_block_start.to_string()),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Root dir cluster"),
            Cell::new(&self.root_dir_cluster.to_string()),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Serial"),
            Cell::new(&format!("0x{:08x}", self.volume_serial)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Version"),
            Cell::new(&format!("{}.{}", self.fs_version_major, self.fs_version_minor)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("State"),
            Cell::new(&format!("0x{:04X}", self.volume_state)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Percent in use"),
            Cell::new(&match self.percent_in_use() {
                Some(p) => format!("{}%", p),
                None => "unknown".to_string(),
            }),
        ]));
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testimg::{RamDisk, boot_block};

    // Geometry of a known-good 40 MB reference image.
    fn reference_boot() -> [u8; 512] {
        boot_block(80000, 128, 128, 256, 9968, 5, 0x4ce5_2a96, 9, 3)
    }

    #[test]
    fn reads_reference_geometry() {
        let mut b = reference_boot();
        b[0x70] = 7;
        let mut disk = RamDisk::with_boot(80000 * 512, &b);
        let sb = SuperBlock::read(&mut disk).unwrap();
        assert_eq!(sb.block_start, 0);
        assert_eq!(sb.block_count, 80000);
        assert_eq!(sb.fat_block_start, 128);
        assert_eq!(sb.fat_block_count, 128);
        assert_eq!(sb.cluster_block_start, 256);
        assert_eq!(sb.cluster_count, 9968);
        assert_eq!(sb.root_dir_cluster, 5);
        assert_eq!(sb.volume_serial, 0x4ce5_2a96);
        assert_eq!(sb.fs_version_major, 1);
        assert_eq!(sb.fs_version_minor, 0);
        assert_eq!(sb.volume_state, 0);
        assert_eq!(sb.block_size(), 512);
        assert_eq!(sb.blocks_per_cluster(), 8);
        assert_eq!(sb.percent_in_use(), Some(7));
    }

    #[test]
    fn cluster_arithmetic() {
        let mut disk = RamDisk::with_boot(80000 * 512, &reference_boot());
        let sb = SuperBlock::read(&mut disk).unwrap();
        assert_eq!(sb.bytes_per_cluster(), 4096);
        assert_eq!(sb.cluster_to_block(2), 256);
        assert_eq!(sb.cluster_to_byte_offset(2), 256 * 512);
        assert_eq!(sb.cluster_to_byte_offset(3), 256 * 512 + 4096);
        assert!(sb.cluster_in_range(2));
        assert!(sb.cluster_in_range(9969));
        assert!(!sb.cluster_in_range(9970));
        assert!(!sb.cluster_in_range(1));
    }

    #[test]
    fn rejects_missing_signature() {
        let mut b = reference_boot();
        b[510] = 0;
        let mut disk = RamDisk::with_boot(80000 * 512, &b);
        assert!(matches!(
            SuperBlock::read(&mut disk),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn rejects_wrong_name() {
        let mut b = reference_boot();
        b[3..11].copy_from_slice(b"NTFS    ");
        let mut disk = RamDisk::with_boot(80000 * 512, &b);
        assert!(matches!(
            SuperBlock::read(&mut disk),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut b = reference_boot();
        b[0x69] = 2;
        let mut disk = RamDisk::with_boot(80000 * 512, &b);
        assert!(matches!(
            SuperBlock::read(&mut disk),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn rejects_heap_past_device_end() {
        // Device truncated to half the blocks the volume claims.
        let mut disk = RamDisk::with_boot(40000 * 512, &reference_boot());
        assert!(matches!(
            SuperBlock::read(&mut disk),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn rejects_tiny_block_shift() {
        let mut b = reference_boot();
        b[0x6C] = 8;
        let mut disk = RamDisk::with_boot(80000 * 512, &b);
        assert!(matches!(
            SuperBlock::read(&mut disk),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn rejects_cluster_count_above_fat_maximum() {
        let mut b = reference_boot();
        b[0x5C..0x60].copy_from_slice(&0xFFFF_FFF6u32.to_le_bytes());
        assert!(matches!(
            SuperBlock::from_bytes(&b),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn percent_unknown() {
        let mut b = reference_boot();
        b[0x70] = 0xFF;
        let mut disk = RamDisk::with_boot(80000 * 512, &b);
        let sb = SuperBlock::read(&mut disk).unwrap();
        assert_eq!(sb.percent_in_use(), None);
        assert!(sb.to_string().contains("unknown"));
    }
}
