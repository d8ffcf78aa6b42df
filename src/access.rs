//! Little-endian field access over fixed-size byte windows.
//!
//! Every on-disk structure in exFAT stores its integers little-endian;
//! these helpers are the single place that byte order is handled.

#[inline]
pub fn le_u16(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes(b[o..o + 2].try_into().unwrap())
}

#[inline]
pub fn le_u32(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes(b[o..o + 4].try_into().unwrap())
}

#[inline]
pub fn le_u64(b: &[u8], o: usize) -> u64 {
    u64::from_le_bytes(b[o..o + 8].try_into().unwrap())
}

#[inline]
pub fn put_u16(b: &mut [u8], o: usize, v: u16) {
    b[o..o + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u32(b: &mut [u8], o: usize, v: u32) {
    b[o..o + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u64(b: &mut [u8], o: usize, v: u64) {
    b[o..o + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut b = [0u8; 16];
        put_u16(&mut b, 0, 0xBEEF);
        put_u32(&mut b, 2, 0xDEAD_BEEF);
        put_u64(&mut b, 6, 0x0123_4567_89AB_CDEF);
        assert_eq!(le_u16(&b, 0), 0xBEEF);
        assert_eq!(le_u32(&b, 2), 0xDEAD_BEEF);
        assert_eq!(le_u64(&b, 6), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn byte_order() {
        let b = [0x34, 0x12, 0x78, 0x56];
        assert_eq!(le_u16(&b, 0), 0x1234);
        assert_eq!(le_u32(&b, 0), 0x5678_1234);
    }
}
