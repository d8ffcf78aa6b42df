use crate::error::ExfatError;

/// Byte-addressable random-access storage a volume is mounted on.
///
/// The driver consumes this contract and never knows which backend is
/// behind it (file, memory, remote). All offsets are absolute byte
/// positions from the start of the volume; callers never touch bytes at
/// or past `size()`. `read_at`/`write_at` transfer the whole buffer or
/// fail, there are no short transfers.
pub trait BlockDevice {
    /// Total device capacity in bytes.
    fn size(&self) -> u64;

    /// Native sector size in bytes.
    fn sector_size(&self) -> u64;

    /// Fill `buf` from the device starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ExfatError>;

    /// Write all of `buf` to the device starting at `offset`.
    /// Fails with `ReadOnly` on a read-only device.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), ExfatError>;

    /// Push any buffered writes down to stable storage.
    fn flush(&mut self) -> Result<(), ExfatError>;

    /// Release the device. Every later operation fails with `Closed`.
    fn close(&mut self) -> Result<(), ExfatError>;

    fn is_closed(&self) -> bool;

    fn is_read_only(&self) -> bool;
}
