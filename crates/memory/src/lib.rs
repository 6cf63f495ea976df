//! Guest-physical memory access traits shared by device models.
//!
//! Devices never hold a reference to guest RAM; they are handed a
//! [`MemoryBus`] for the duration of a DMA operation. Register windows are
//! decoded through [`MmioHandler`] with explicit access sizes so devices can
//! reject or log sub-word accesses themselves.

/// Byte-addressed guest-physical memory.
///
/// Implementations are expected to satisfy ordinary RAM semantics: a
/// `write_physical` followed by a `read_physical` of the same range returns
/// the written bytes, and disjoint ranges do not alias.
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u64, buf: &[u8]);

    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_physical(paddr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_physical(paddr, &mut bytes);
        u64::from_le_bytes(bytes)
    }
}

/// A device register window decoded with explicit access widths.
///
/// `size` is the access width in bytes (1, 2, 4 or 8). Reads return the
/// little-endian value zero-extended to 64 bits.
pub trait MmioHandler {
    fn mmio_read(&mut self, offset: u64, size: usize) -> u64;
    fn mmio_write(&mut self, offset: u64, size: usize, value: u64);
}
