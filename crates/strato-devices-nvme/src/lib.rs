//! Emulated NVM Express controller core.
//!
//! The crate models the command-processing engine of an NVMe 1.2 controller:
//! the register/doorbell MMIO window, admin and I/O queue machinery with
//! phase-bit completion delivery, PRP resolution, and the asynchronous
//! coupling to a block back-end. The PCI container is not here; a host embeds
//! [`NvmeController`] behind its BAR decoding, hands it a
//! [`memory::MemoryBus`] when pumping, and receives interrupts through
//! [`InterruptTarget`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use strato_storage::{MemBackend, RawDisk};
//! use strato_time::{FakeHostClock, TimeSource};
//! use strato_devices_nvme::{NvmeConfig, NvmeController};
//!
//! let disk = RawDisk::create(MemBackend::new(), 1 << 20).unwrap();
//! let time = TimeSource::new(Arc::new(FakeHostClock::new(0)));
//! let mut ctrl =
//!     NvmeController::try_new(disk, NvmeConfig::new("serial-0001"), time).unwrap();
//! ctrl.mmio_write(0x24, 4, 0x000f_000f); // AQA
//! ```

mod admin;
mod cmb;
mod controller;
mod nvm;
mod queues;

pub mod identify;
pub mod logs;
pub mod prp;
pub mod regs;

pub use controller::{
    InterruptTarget, NvmeConfig, NvmeController, QueueTimer, QUEUE_DEFER_NS,
};
pub use nvm::{DsmAttributes, NVME_NUM_MAX_DSM_RANGES};
pub use strato_storage::DiskError;
