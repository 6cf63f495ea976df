#![allow(dead_code)]

use std::sync::Arc;

use memory::MemoryBus;
use strato_devices_nvme::{NvmeConfig, NvmeController};
use strato_storage::{MemBackend, RawDisk, SECTOR_SIZE};
use strato_time::{FakeHostClock, TimeSource};

pub const ASQ: u64 = 0x10000;
pub const ACQ: u64 = 0x20000;
pub const IO_CQ: u64 = 0x40000;
pub const IO_SQ: u64 = 0x50000;
pub const ADMIN_QUEUE_SIZE: u16 = 16;
pub const IO_QUEUE_SIZE: u16 = 16;

/// CC.EN with IOSQES=6 (64-byte SQEs) and IOCQES=4 (16-byte CQEs).
pub const CC_ENABLE: u64 = (4 << 20) | (6 << 16) | 1;

pub struct TestMem {
    pub buf: Vec<u8>,
}

impl TestMem {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
        }
    }
}

impl MemoryBus for TestMem {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        let start = paddr as usize;
        let end = start + buf.len();
        assert!(end <= self.buf.len(), "out-of-bounds DMA read");
        buf.copy_from_slice(&self.buf[start..end]);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        let start = paddr as usize;
        let end = start + buf.len();
        assert!(end <= self.buf.len(), "out-of-bounds DMA write");
        self.buf[start..end].copy_from_slice(buf);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CqEntry {
    pub dw0: u32,
    pub sq_head: u16,
    pub sqid: u16,
    pub cid: u16,
    /// Raw status halfword including the phase bit.
    pub status: u16,
}

impl CqEntry {
    pub fn phase(&self) -> u16 {
        self.status & 1
    }

    /// Status code with phase stripped: `code | DNR` as the dispatchers
    /// produced it.
    pub fn code(&self) -> u16 {
        self.status >> 1
    }
}

pub fn read_cqe(mem: &mut TestMem, addr: u64) -> CqEntry {
    let mut bytes = [0u8; 16];
    mem.read_physical(addr, &mut bytes);
    CqEntry {
        dw0: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        sq_head: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
        sqid: u16::from_le_bytes(bytes[10..12].try_into().unwrap()),
        cid: u16::from_le_bytes(bytes[12..14].try_into().unwrap()),
        status: u16::from_le_bytes(bytes[14..16].try_into().unwrap()),
    }
}

pub fn build_command(opc: u8) -> [u8; 64] {
    let mut cmd = [0u8; 64];
    cmd[0] = opc;
    cmd
}

pub fn set_cid(cmd: &mut [u8; 64], cid: u16) {
    cmd[2..4].copy_from_slice(&cid.to_le_bytes());
}

pub fn set_nsid(cmd: &mut [u8; 64], nsid: u32) {
    cmd[4..8].copy_from_slice(&nsid.to_le_bytes());
}

pub fn set_prp1(cmd: &mut [u8; 64], prp1: u64) {
    cmd[24..32].copy_from_slice(&prp1.to_le_bytes());
}

pub fn set_prp2(cmd: &mut [u8; 64], prp2: u64) {
    cmd[32..40].copy_from_slice(&prp2.to_le_bytes());
}

pub fn set_cdw10(cmd: &mut [u8; 64], val: u32) {
    cmd[40..44].copy_from_slice(&val.to_le_bytes());
}

pub fn set_cdw11(cmd: &mut [u8; 64], val: u32) {
    cmd[44..48].copy_from_slice(&val.to_le_bytes());
}

pub fn set_cdw12(cmd: &mut [u8; 64], val: u32) {
    cmd[48..52].copy_from_slice(&val.to_le_bytes());
}

/// Controller plus guest memory and the fake clock driving its deferrals.
pub struct Bench {
    pub ctrl: NvmeController,
    pub mem: TestMem,
    pub host: Arc<FakeHostClock>,
    next_admin_sqe: u16,
    next_admin_cqe: u16,
    next_io_sqe: u16,
    next_io_cqe: u16,
}

impl Bench {
    pub fn new(sectors: u64) -> Self {
        Self::with_config(sectors, NvmeConfig::new("nvme-test-0001"))
    }

    pub fn with_config(sectors: u64, config: NvmeConfig) -> Self {
        let disk = RawDisk::create(MemBackend::new(), sectors * SECTOR_SIZE as u64).unwrap();
        let host = Arc::new(FakeHostClock::new(0));
        let time = TimeSource::new(host.clone());
        let ctrl = NvmeController::try_new(disk, config, time).unwrap();
        Self {
            ctrl,
            mem: TestMem::new(4 * 1024 * 1024),
            host,
            next_admin_sqe: 0,
            next_admin_cqe: 0,
            next_io_sqe: 0,
            next_io_cqe: 0,
        }
    }

    /// Program the admin queue pair and enable the controller.
    pub fn enable(&mut self) {
        self.ctrl
            .mmio_write(0x24, 4, u64::from(ADMIN_QUEUE_SIZE as u32 - 1) << 16
                | u64::from(ADMIN_QUEUE_SIZE as u32 - 1));
        self.ctrl.mmio_write(0x28, 8, ASQ);
        self.ctrl.mmio_write(0x30, 8, ACQ);
        self.ctrl.mmio_write(0x14, 4, CC_ENABLE);
    }

    pub fn csts(&mut self) -> u32 {
        self.ctrl.mmio_read(0x1c, 4) as u32
    }

    /// Advance the virtual clock past the 500 ns deferrals and run the pump
    /// until all scheduled work has drained.
    pub fn pump(&mut self) {
        for _ in 0..8 {
            self.host.advance_ns(1_000);
            self.ctrl.process(&mut self.mem);
        }
    }

    /// Push one admin SQE, ring the doorbell, pump, and consume the CQE.
    pub fn submit_admin(&mut self, cmd: [u8; 64]) -> CqEntry {
        let slot = self.next_admin_sqe % ADMIN_QUEUE_SIZE;
        self.mem.write_physical(ASQ + u64::from(slot) * 64, &cmd);
        self.next_admin_sqe = (slot + 1) % ADMIN_QUEUE_SIZE;
        self.ctrl
            .mmio_write(0x1000, 4, u64::from(self.next_admin_sqe));
        self.pump();

        let cq_slot = self.next_admin_cqe % ADMIN_QUEUE_SIZE;
        let cqe = read_cqe(&mut self.mem, ACQ + u64::from(cq_slot) * 16);
        self.next_admin_cqe = (cq_slot + 1) % ADMIN_QUEUE_SIZE;
        self.ctrl
            .mmio_write(0x1004, 4, u64::from(self.next_admin_cqe));
        cqe
    }

    /// Create the I/O queue pair (qid 1, interrupts enabled, vector 0).
    pub fn create_io_queues(&mut self) {
        let mut cmd = build_command(0x05);
        set_cid(&mut cmd, 0x701);
        set_prp1(&mut cmd, IO_CQ);
        set_cdw10(&mut cmd, u32::from(IO_QUEUE_SIZE - 1) << 16 | 1);
        set_cdw11(&mut cmd, 0x3); // PC | IEN, vector 0
        let cqe = self.submit_admin(cmd);
        assert_eq!(cqe.code(), 0, "create I/O CQ failed: {:#x}", cqe.code());

        let mut cmd = build_command(0x01);
        set_cid(&mut cmd, 0x702);
        set_prp1(&mut cmd, IO_SQ);
        set_cdw10(&mut cmd, u32::from(IO_QUEUE_SIZE - 1) << 16 | 1);
        set_cdw11(&mut cmd, 1 << 16 | 1); // CQID 1, PC
        let cqe = self.submit_admin(cmd);
        assert_eq!(cqe.code(), 0, "create I/O SQ failed: {:#x}", cqe.code());
    }

    /// Push one SQE to I/O queue 1, ring its doorbell, pump, consume the CQE.
    pub fn submit_io(&mut self, cmd: [u8; 64]) -> CqEntry {
        let slot = self.next_io_sqe % IO_QUEUE_SIZE;
        self.mem.write_physical(IO_SQ + u64::from(slot) * 64, &cmd);
        self.next_io_sqe = (slot + 1) % IO_QUEUE_SIZE;
        self.ctrl.mmio_write(0x1008, 4, u64::from(self.next_io_sqe));
        self.pump();

        let cq_slot = self.next_io_cqe % IO_QUEUE_SIZE;
        let cqe = read_cqe(&mut self.mem, IO_CQ + u64::from(cq_slot) * 16);
        self.next_io_cqe = (cq_slot + 1) % IO_QUEUE_SIZE;
        self.ctrl.mmio_write(0x100c, 4, u64::from(self.next_io_cqe));
        cqe
    }
}
