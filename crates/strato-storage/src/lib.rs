//! Block storage for device models.
//!
//! Two layers live here. [`StorageBackend`] is byte-level storage
//! ([`MemBackend`], [`FileBackend`]) consumed by [`RawDisk`]; device models
//! see disks only through the [`VirtualDisk`] object trait. On top of that,
//! [`aio::AioEngine`] turns a `VirtualDisk` into the asynchronous
//! submit/poll/cancel interface storage controllers couple to.

pub mod aio;

mod backend;
mod raw;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use raw::RawDisk;

/// Logical sector size assumed by the controllers in this workspace.
pub const SECTOR_SIZE: usize = 512;

pub type Result<T> = std::result::Result<T, DiskError>;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("access out of bounds: offset {offset:#x} len {len} capacity {capacity:#x}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },
    #[error("offset arithmetic overflow")]
    OffsetOverflow,
    #[error("host I/O failure")]
    Io,
    #[error("disk is read-only")]
    ReadOnly,
}

/// A linear block device addressed in bytes.
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Release a range, reading back as zeroes afterwards. The default
    /// implementation writes explicit zeroes in bounded chunks.
    fn discard_range(&mut self, offset: u64, len: u64) -> Result<()> {
        let cap = self.capacity_bytes();
        let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        if end > cap {
            return Err(DiskError::OutOfBounds {
                offset,
                len: usize::try_from(len).unwrap_or(usize::MAX),
                capacity: cap,
            });
        }
        const CHUNK: usize = 64 * 1024;
        let zeroes = [0u8; CHUNK];
        let mut at = offset;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            self.write_at(at, &zeroes[..n])?;
            at += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl VirtualDisk for Box<dyn VirtualDisk> {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn discard_range(&mut self, offset: u64, len: u64) -> Result<()> {
        (**self).discard_range(offset, len)
    }
}
