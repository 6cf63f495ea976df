//! Deferred-completion request engine over a [`VirtualDisk`].
//!
//! Storage controllers in this workspace are single-threaded cooperative:
//! they must never observe a completion re-entrantly while dispatching. The
//! engine therefore executes each request when it is submitted but parks the
//! outcome; the controller drains outcomes from its own pump via
//! [`AioEngine::poll_completion`]. Cancellation drops a parked outcome, which
//! is exactly the visible effect of cancelling in-flight I/O here.

use std::collections::VecDeque;

use crate::{Result, VirtualDisk};

/// Caller-chosen request identifier, returned verbatim with the completion.
pub type AioToken = u64;

#[derive(Debug)]
pub enum AioOp {
    Read { offset: u64, len: usize },
    Write { offset: u64, data: Vec<u8> },
    WriteZeroes { offset: u64, len: u64, may_unmap: bool },
    Flush,
}

/// Accounting class, mirroring how block-layer statistics bucket requests
/// (zeroing writes count as writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioKind {
    Read,
    Write,
    Flush,
}

impl AioOp {
    fn kind(&self) -> AioKind {
        match self {
            AioOp::Read { .. } => AioKind::Read,
            AioOp::Write { .. } | AioOp::WriteZeroes { .. } => AioKind::Write,
            AioOp::Flush => AioKind::Flush,
        }
    }
}

#[derive(Debug)]
pub struct AioCompletion {
    pub token: AioToken,
    pub result: Result<()>,
    /// Data produced by a successful read.
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpStats {
    pub done: u64,
    pub failed: u64,
    pub invalid: u64,
}

/// Per-class request accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AioStats {
    pub read: OpStats,
    pub write: OpStats,
    pub flush: OpStats,
}

impl AioStats {
    fn class(&mut self, kind: AioKind) -> &mut OpStats {
        match kind {
            AioKind::Read => &mut self.read,
            AioKind::Write => &mut self.write,
            AioKind::Flush => &mut self.flush,
        }
    }

    /// Record a request rejected before reaching the disk.
    pub fn account_invalid(&mut self, kind: AioKind) {
        self.class(kind).invalid += 1;
    }
}

pub struct AioEngine {
    disk: Box<dyn VirtualDisk>,
    completions: VecDeque<AioCompletion>,
    write_cache: bool,
    stats: AioStats,
}

impl AioEngine {
    pub fn new(disk: Box<dyn VirtualDisk>) -> Self {
        Self {
            disk,
            completions: VecDeque::new(),
            write_cache: true,
            stats: AioStats::default(),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.disk.capacity_bytes()
    }

    pub fn write_cache_enabled(&self) -> bool {
        self.write_cache
    }

    pub fn set_write_cache(&mut self, enabled: bool) {
        self.write_cache = enabled;
    }

    pub fn stats(&self) -> &AioStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut AioStats {
        &mut self.stats
    }

    /// Submit a request. The completion becomes visible on a later
    /// [`Self::poll_completion`], never re-entrantly.
    pub fn submit(&mut self, token: AioToken, op: AioOp) {
        let kind = op.kind();
        let mut data = None;
        let result = match op {
            AioOp::Read { offset, len } => {
                let mut buf = vec![0u8; len];
                let r = self.disk.read_at(offset, &mut buf);
                if r.is_ok() {
                    data = Some(buf);
                }
                r
            }
            AioOp::Write { offset, data } => self.disk.write_at(offset, &data),
            AioOp::WriteZeroes {
                offset,
                len,
                may_unmap,
            } => self.write_zeroes(offset, len, may_unmap),
            AioOp::Flush => self.disk.flush(),
        };
        match &result {
            Ok(()) => self.stats.class(kind).done += 1,
            Err(err) => {
                tracing::warn!(target: "storage", token, ?kind, %err, "aio request failed");
                self.stats.class(kind).failed += 1;
            }
        }
        self.completions.push_back(AioCompletion {
            token,
            result,
            data,
        });
    }

    /// Synchronous zeroing write (the DSM deallocate path).
    pub fn pwrite_zeroes(&mut self, offset: u64, len: u64, may_unmap: bool) -> Result<()> {
        let result = self.write_zeroes(offset, len, may_unmap);
        match &result {
            Ok(()) => self.stats.write.done += 1,
            Err(_) => self.stats.write.failed += 1,
        }
        result
    }

    // `discard_range` guarantees the range reads back as zero, which covers
    // both the unmap hint and the plain zeroing write.
    fn write_zeroes(&mut self, offset: u64, len: u64, _may_unmap: bool) -> Result<()> {
        self.disk.discard_range(offset, len)
    }

    /// Drop the parked completion for `token`. Returns whether one existed.
    pub fn cancel(&mut self, token: AioToken) -> bool {
        let before = self.completions.len();
        self.completions.retain(|c| c.token != token);
        self.completions.len() != before
    }

    pub fn cancel_all(&mut self) {
        self.completions.clear();
    }

    pub fn poll_completion(&mut self) -> Option<AioCompletion> {
        self.completions.pop_front()
    }

    pub fn has_completions(&self) -> bool {
        !self.completions.is_empty()
    }

    pub fn flush_sync(&mut self) -> Result<()> {
        self.disk.flush()
    }
}
