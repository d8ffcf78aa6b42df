use crate::device::BlockDevice;
use crate::error::ExfatError;
use crate::superblock::SuperBlock;
use log::{debug, error};

/// Allocation bitmap of the cluster heap: one bit per cluster, bit 0 is
/// cluster 2, least significant bit first within each byte.
pub struct ClusterBitMap {
    data: Vec<u8>,
    cluster_count: u32,
    first_cluster: u32,
    dirty: bool,
}

impl ClusterBitMap {
    /// Loads the bitmap described by a root-directory entry. The entry
    /// declares where the bitmap lives and how many bytes it holds; a
    /// declared size too small to give every cluster its bit is the
    /// classic truncated-bitmap corruption.
    pub fn read<D: BlockDevice + ?Sized>(
        sb: &SuperBlock,
        dev: &mut D,
        first_cluster: u32,
        size_bytes: u64,
    ) -> Result<Self, ExfatError> {
        let needed = (sb.cluster_count as u64).div_ceil(8);
        if size_bytes < needed {
            error!(
                "allocation bitmap holds {} bytes, {} clusters need {}",
                size_bytes, sb.cluster_count, needed
            );
            return Err(ExfatError::Format(format!(
                "allocation bitmap too small ({} bytes for {} clusters)",
                size_bytes, sb.cluster_count
            )));
        }
        if !sb.cluster_in_range(first_cluster) {
            return Err(ExfatError::Format(format!(
                "allocation bitmap cluster {} outside the heap",
                first_cluster
            )));
        }
        let mut data = vec![0u8; needed as usize];
        dev.read_at(sb.cluster_to_byte_offset(first_cluster), &mut data)?;
        debug!(
            "allocation bitmap: {} clusters from cluster {}",
            sb.cluster_count, first_cluster
        );
        Ok(Self {
            data,
            cluster_count: sb.cluster_count,
            first_cluster,
            dirty: false,
        })
    }

    #[inline]
    fn bit(&self, cluster: u32) -> (usize, u8) {
        let index = (cluster - 2) as usize;
        (index / 8, 1u8 << (index % 8))
    }

    /// Allocation state of a heap cluster. Callers stay within
    /// `[2, 2 + cluster_count)`; clusters 0 and 1 do not exist.
    pub fn is_cluster_free(&self, cluster: u32) -> bool {
        let (byte, mask) = self.bit(cluster);
        self.data[byte] & mask == 0
    }

    pub fn set_used(&mut self, cluster: u32) {
        let (byte, mask) = self.bit(cluster);
        self.data[byte] |= mask;
        self.dirty = true;
    }

    pub fn set_free(&mut self, cluster: u32) {
        let (byte, mask) = self.bit(cluster);
        self.data[byte] &= !mask;
        self.dirty = true;
    }

    pub fn count_free(&self) -> u32 {
        let mut free = 0u32;
        for cluster in 2..2 + self.cluster_count {
            if self.is_cluster_free(cluster) {
                free += 1;
            }
        }
        free
    }

    /// First free cluster at or after `hint`, wrapping around the heap
    /// once. `None` means the volume is full.
    pub fn find_free(&self, hint: u32) -> Option<u32> {
        let end = 2 + self.cluster_count;
        let start = if (2..end).contains(&hint) { hint } else { 2 };
        for cluster in (start..end).chain(2..start) {
            if self.is_cluster_free(cluster) {
                return Some(cluster);
            }
        }
        None
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    /// Write the in-memory bitmap back to its backing clusters.
    pub fn write_back<D: BlockDevice + ?Sized>(
        &mut self,
        sb: &SuperBlock,
        dev: &mut D,
    ) -> Result<(), ExfatError> {
        if !self.dirty {
            return Ok(());
        }
        dev.write_at(sb.cluster_to_byte_offset(self.first_cluster), &self.data)?;
        self.dirty = false;
        Ok(())
    }
}
