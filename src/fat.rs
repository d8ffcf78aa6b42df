use crate::device::BlockDevice;
use crate::error::ExfatError;
use crate::superblock::SuperBlock;
use log::{debug, warn};
use std::collections::HashSet;

pub const FREE: u32 = 0;
pub const BAD: u32 = 0xFFFF_FFF7;
pub const EOC: u32 = 0xFFFF_FFFF;

/// exFAT uses full 32-bit FAT entries. End-of-chain markers are >= 0xFFFFFFF8.
#[inline]
pub fn is_eoc(v: u32) -> bool {
    v >= 0xFFFF_FFF8
}

/// View over the active FAT of a volume. Contiguous files have no FAT
/// entries at all; only fragmented chains are linked here.
pub struct Fat<'a, D: BlockDevice + ?Sized> {
    sb: &'a SuperBlock,
    dev: &'a mut D,
}

impl<'a, D: BlockDevice + ?Sized> Fat<'a, D> {
    pub fn new(sb: &'a SuperBlock, dev: &'a mut D) -> Self {
        Self { sb, dev }
    }

    #[inline]
    fn entry_offset(&self, cluster: u32) -> u64 {
        self.sb.active_fat_start_byte() + cluster as u64 * 4
    }

    fn check_index(&self, cluster: u32) -> Result<(), ExfatError> {
        // Entries 0 and 1 are reserved but addressable.
        if u64::from(cluster) >= 2 + u64::from(self.sb.cluster_count) {
            return Err(ExfatError::Format(format!(
                "FAT index {} out of range ({} clusters)",
                cluster, self.sb.cluster_count
            )));
        }
        Ok(())
    }

    pub fn read_entry(&mut self, cluster: u32) -> Result<u32, ExfatError> {
        self.check_index(cluster)?;
        let mut b = [0u8; 4];
        self.dev.read_at(self.entry_offset(cluster), &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_entry(&mut self, cluster: u32, value: u32) -> Result<(), ExfatError> {
        self.check_index(cluster)?;
        self.dev
            .write_at(self.entry_offset(cluster), &value.to_le_bytes())
    }

    /// Next cluster in a FAT-linked chain, `None` at end of chain.
    pub fn next(&mut self, cluster: u32) -> Result<Option<u32>, ExfatError> {
        let v = self.read_entry(cluster)?;
        debug!("FAT[{}] -> {:#x}", cluster, v);
        if is_eoc(v) {
            return Ok(None);
        }
        if v == FREE {
            return Err(ExfatError::Format(format!(
                "cluster {} links to a free cluster",
                cluster
            )));
        }
        if v == BAD {
            return Err(ExfatError::Format(format!(
                "cluster {} links to a bad cluster",
                cluster
            )));
        }
        if !self.sb.cluster_in_range(v) {
            return Err(ExfatError::Format(format!(
                "cluster {} links outside the heap ({})",
                cluster, v
            )));
        }
        Ok(Some(v))
    }

    /// Step `count` links forward from `cluster`.
    pub fn advance(&mut self, cluster: u32, count: u64) -> Result<u32, ExfatError> {
        let mut cur = cluster;
        for _ in 0..count {
            cur = self.next(cur)?.ok_or_else(|| {
                ExfatError::Format(format!(
                    "chain from cluster {} ends {} links early",
                    cluster, count
                ))
            })?;
        }
        Ok(cur)
    }

    /// Follow the chain starting at `first_cluster` and return the
    /// ordered list of clusters. `max` bounds the walk; a chain longer
    /// than that, a cycle or a broken link is corruption.
    pub fn walk_chain(&mut self, first_cluster: u32, max: usize) -> Result<Vec<u32>, ExfatError> {
        if !self.sb.cluster_in_range(first_cluster) {
            return Err(ExfatError::Format(format!(
                "chain starts outside the heap ({})",
                first_cluster
            )));
        }
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = first_cluster;
        loop {
            if !seen.insert(cur) {
                return Err(ExfatError::Format(format!(
                    "FAT chain cycle at cluster {}",
                    cur
                )));
            }
            out.push(cur);
            if out.len() > max {
                return Err(ExfatError::Format(format!(
                    "FAT chain from {} exceeds {} clusters",
                    first_cluster, max
                )));
            }
            match self.next(cur)? {
                Some(n) => cur = n,
                None => break,
            }
        }
        Ok(out)
    }

    /// Mount-time sanity check of the reserved head entries. Deviations
    /// are common on images touched by other tools, so only warn.
    pub fn check_head(&mut self) -> Result<(), ExfatError> {
        let f0 = self.read_entry(0)?;
        let f1 = self.read_entry(1)?;
        if f0 != 0xFFFF_FFF8 {
            warn!("FAT[0] is {:#x}, expected 0xFFFFFFF8", f0);
        }
        if f1 != EOC {
            warn!("FAT[1] is {:#x}, expected 0xFFFFFFFF", f1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testimg::{RamDisk, toy_superblock};

    fn disk_with_fat(entries: &[(u32, u32)]) -> (SuperBlock, RamDisk) {
        let sb = toy_superblock();
        let mut disk = RamDisk::new(sb.block_count as usize * 512);
        for &(cluster, value) in entries {
            let off = sb.fat_start_byte() + cluster as u64 * 4;
            disk.fill(off, &value.to_le_bytes());
        }
        (sb, disk)
    }

    #[test]
    fn walks_linked_chain() {
        let (sb, mut disk) = disk_with_fat(&[(5, 9), (9, 6), (6, EOC)]);
        let mut fat = Fat::new(&sb, &mut disk);
        assert_eq!(fat.walk_chain(5, 16).unwrap(), vec![5, 9, 6]);
        assert_eq!(fat.advance(5, 2).unwrap(), 6);
    }

    #[test]
    fn eoc_range() {
        assert!(is_eoc(0xFFFF_FFFF));
        assert!(is_eoc(0xFFFF_FFF8));
        assert!(!is_eoc(0xFFFF_FFF7));
        assert!(!is_eoc(2));
    }

    #[test]
    fn cycle_is_corruption() {
        let (sb, mut disk) = disk_with_fat(&[(5, 6), (6, 5)]);
        let mut fat = Fat::new(&sb, &mut disk);
        assert!(matches!(
            fat.walk_chain(5, 16),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn free_link_is_corruption() {
        let (sb, mut disk) = disk_with_fat(&[(5, 6)]);
        let mut fat = Fat::new(&sb, &mut disk);
        assert!(matches!(
            fat.walk_chain(5, 16),
            Err(ExfatError::Format(_))
        ));
    }

    #[test]
    fn overlong_chain_is_corruption() {
        let (sb, mut disk) = disk_with_fat(&[(5, 6), (6, 7), (7, EOC)]);
        let mut fat = Fat::new(&sb, &mut disk);
        assert!(matches!(fat.walk_chain(5, 2), Err(ExfatError::Format(_))));
    }

    #[test]
    fn write_entry_round_trip() {
        let (sb, mut disk) = disk_with_fat(&[]);
        let mut fat = Fat::new(&sb, &mut disk);
        fat.write_entry(7, 42).unwrap();
        assert_eq!(fat.read_entry(7).unwrap(), 42);
        assert!(matches!(
            fat.read_entry(2 + sb.cluster_count),
            Err(ExfatError::Format(_))
        ));
    }
}
