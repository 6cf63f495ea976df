use crate::{DiskError, Result, StorageBackend, VirtualDisk};

/// A raw (headerless) disk image over a byte-level backend.
///
/// Capacity is fixed at creation; the backend may be shorter than the
/// capacity, in which case the tail reads as zero (sparse image).
pub struct RawDisk<B> {
    backend: B,
    capacity: u64,
}

impl<B: StorageBackend> RawDisk<B> {
    pub fn create(backend: B, capacity_bytes: u64) -> Result<Self> {
        Ok(Self {
            backend,
            capacity: capacity_bytes,
        })
    }

    /// Capacity is the backend's current length.
    pub fn open(backend: B) -> Result<Self> {
        let capacity = backend.len();
        Ok(Self { backend, capacity })
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.capacity {
            return Err(DiskError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl<B: StorageBackend> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let backed = self
            .backend
            .len()
            .saturating_sub(offset)
            .min(buf.len() as u64) as usize;
        if backed > 0 {
            self.backend.read_at(offset, &mut buf[..backed])?;
        }
        buf[backed..].fill(0);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}
