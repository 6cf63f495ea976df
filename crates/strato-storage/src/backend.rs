use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{DiskError, Result};

/// Byte-level storage behind a [`crate::RawDisk`].
///
/// `len` is how far the backing store currently extends; reads past it are
/// the caller's problem (RawDisk zero-fills for sparse backends).
pub trait StorageBackend {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Growable in-memory backend. Unwritten ranges read as zero.
#[derive(Default)]
pub struct MemBackend {
    buf: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemBackend {
    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(offset).map_err(|_| DiskError::OffsetOverflow)?;
        for (i, out) in buf.iter_mut().enumerate() {
            *out = self.buf.get(offset + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset = usize::try_from(offset).map_err(|_| DiskError::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File-backed storage.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    len: u64,
    read_only: bool,
}

impl FileBackend {
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| host_io_error("create", path.as_ref(), &e))?;
        file.set_len(len)
            .map_err(|e| host_io_error("set_len", path.as_ref(), &e))?;
        Ok(Self {
            file,
            len,
            read_only: false,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(path.as_ref(), false)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(path.as_ref(), true)
    }

    fn open_inner(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| host_io_error("open", path, &e))?;
        let len = file
            .metadata()
            .map_err(|e| host_io_error("metadata", path, &e))?
            .len();
        Ok(Self {
            file,
            len,
            read_only,
        })
    }
}

fn host_io_error(op: &str, path: &Path, err: &std::io::Error) -> DiskError {
    tracing::error!(target: "storage", %op, path = %path.display(), %err, "file backend error");
    DiskError::Io
}

impl StorageBackend for FileBackend {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| DiskError::Io)?;
        self.file.read_exact(buf).map_err(|_| DiskError::Io)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| DiskError::Io)?;
        self.file.write_all(buf).map_err(|_| DiskError::Io)?;
        self.len = self.len.max(offset + buf.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data().map_err(|_| DiskError::Io)
    }
}
