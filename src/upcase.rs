use crate::device::BlockDevice;
use crate::error::ExfatError;
use crate::superblock::SuperBlock;
use log::{debug, error};

/// Compression escape: the next 16-bit unit is a count of code points
/// that map to themselves.
const ESCAPE: u16 = 0xFFFF;

/// Rolling checksum over the raw 16-bit units of an upcase stream,
/// escapes and run counts included.
pub fn upcase_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for pair in data.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        sum = sum.rotate_left(1).wrapping_add(u32::from(unit));
    }
    sum
}

/// Volume-specific Unicode case-folding table, decoded from its
/// compressed on-disk form at mount time and immutable afterwards.
/// Code points past the end of the loaded table fold to themselves.
pub struct UpcaseTable {
    table: Vec<u16>,
    checksum: u32,
}

impl UpcaseTable {
    pub fn read<D: BlockDevice + ?Sized>(
        sb: &SuperBlock,
        dev: &mut D,
        first_cluster: u32,
        size_bytes: u64,
        expected_checksum: u32,
    ) -> Result<Self, ExfatError> {
        if size_bytes == 0 || size_bytes % 2 != 0 {
            return Err(ExfatError::Format(format!(
                "upcase table size {} is not a positive multiple of 2",
                size_bytes
            )));
        }
        // An uncompressed full table is 0x10000 units.
        if size_bytes > 0x10000 * 2 {
            return Err(ExfatError::Format(format!(
                "upcase table size {} exceeds the largest possible table",
                size_bytes
            )));
        }
        if !sb.cluster_in_range(first_cluster) {
            return Err(ExfatError::Format(format!(
                "upcase table cluster {} outside the heap",
                first_cluster
            )));
        }

        let mut data = vec![0u8; size_bytes as usize];
        dev.read_at(sb.cluster_to_byte_offset(first_cluster), &mut data)?;

        let checksum = upcase_checksum(&data);
        if checksum != expected_checksum {
            error!(
                "upcase table checksum {:#010x} does not match directory entry {:#010x}",
                checksum, expected_checksum
            );
            return Err(ExfatError::Format(
                "upcase table checksum mismatch".into(),
            ));
        }

        let mut table: Vec<u16> = Vec::new();
        let mut units = data
            .chunks_exact(2)
            .map(|p| u16::from_le_bytes([p[0], p[1]]));
        while let Some(unit) = units.next() {
            if unit == ESCAPE {
                let run = units.next().ok_or_else(|| {
                    ExfatError::Format("upcase table ends inside an identity run".into())
                })?;
                for _ in 0..run {
                    if table.len() >= 0x10000 {
                        return Err(ExfatError::Format(
                            "upcase table exceeds 65536 mappings".into(),
                        ));
                    }
                    table.push(table.len() as u16);
                }
            } else {
                if table.len() >= 0x10000 {
                    return Err(ExfatError::Format(
                        "upcase table exceeds 65536 mappings".into(),
                    ));
                }
                table.push(unit);
            }
        }
        debug!(
            "upcase table: {} mappings, checksum {:#010x}",
            table.len(),
            checksum
        );
        Ok(Self { table, checksum })
    }

    #[cfg(test)]
    pub(crate) fn from_table(table: Vec<u16>) -> Self {
        Self { table, checksum: 0 }
    }

    #[inline]
    pub fn to_upper_char(&self, c: u16) -> u16 {
        match self.table.get(c as usize) {
            Some(&up) => up,
            None => c,
        }
    }

    /// Case-folds a string, each UTF-16 unit independently. Used for
    /// name comparison only, never written back to disk.
    pub fn to_upper(&self, s: &str) -> String {
        let folded: Vec<u16> = s.encode_utf16().map(|u| self.to_upper_char(u)).collect();
        String::from_utf16_lossy(&folded)
    }

    pub fn eq_ignore_case(&self, a: &str, b: &str) -> bool {
        let mut ua = a.encode_utf16();
        let mut ub = b.encode_utf16();
        loop {
            match (ua.next(), ub.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    if self.to_upper_char(x) != self.to_upper_char(y) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Number of decoded mappings.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[inline]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}
