//! The controller proper: register file lifecycle, doorbell decoding,
//! submission queue draining, completion posting and interrupt policy.
//!
//! Everything runs serialised on the caller's thread. MMIO writes only
//! update state and arm timers; all DMA happens inside
//! [`NvmeController::process`], which the host pumps after advancing the
//! virtual clock. Doorbell-triggered work is deferred by
//! [`QUEUE_DEFER_NS`] so a doorbell storm collapses into one draining pass.

use std::path::PathBuf;

use memory::{MemoryBus, MmioHandler};
use strato_storage::aio::{AioEngine, AioStats};
use strato_storage::{DiskError, VirtualDisk, SECTOR_SIZE};
use strato_time::{TimeSource, TimerQueue};

use crate::cmb::Cmb;
use crate::identify::{IdentifyController, IdentifyNamespace};
use crate::logs::{ErrorLogEntry, SmartLog, NUM_ERROR_LOG};
use crate::prp;
use crate::queues::{CompQueue, SubQueue};
use crate::regs::{
    aqa, cap, cc, cmb as cmbreg, Bar, Command, CSTS_FAILED, CSTS_NSSRO, CSTS_READY,
    CSTS_SHST_COMPLETE, DOORBELL_BASE, NSSR_MAGIC, NVME_INTERNAL_DEV_ERROR, NVME_REG_ACQ,
    NVME_REG_ACQ_HI, NVME_REG_AQA, NVME_REG_ASQ, NVME_REG_ASQ_HI, NVME_REG_CC, NVME_REG_CMBLOC,
    NVME_REG_CMBSZ, NVME_REG_CSTS, NVME_REG_INTMC, NVME_REG_INTMS, NVME_REG_NSSR, NVME_SUCCESS,
    REG_IMAGE_LEN,
};

/// Doorbell-to-drain coalescing window on the virtual clock.
pub const QUEUE_DEFER_NS: u64 = 500;

/// Deferred work token: drain an SQ or post a CQ's pending completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTimer {
    Sq(u16),
    Cq(u16),
}

/// Interrupt surface of the PCI container.
///
/// When MSI-X is enabled the per-CQ vector is signalled directly and the pin
/// level is left alone; otherwise the controller drives the INTx level from
/// its masked per-CQ status bits.
pub trait InterruptTarget {
    fn msix_enabled(&self) -> bool {
        false
    }

    fn msix_notify(&mut self, vector: u16);

    fn intx_set(&mut self, level: bool);
}

struct NullInterrupts;

impl InterruptTarget for NullInterrupts {
    fn msix_notify(&mut self, _vector: u16) {}

    fn intx_set(&mut self, _level: bool) {}
}

#[derive(Debug, Clone)]
pub struct NvmeConfig {
    pub serial: String,
    /// CMB size in MiB; 0 disables the CMB.
    pub cmb_size_mb: u32,
    /// Queue slots including the admin pair.
    pub num_queues: u32,
    pub smart_log_path: PathBuf,
}

impl NvmeConfig {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            cmb_size_mb: 0,
            num_queues: 64,
            smart_log_path: PathBuf::from("smartlog.bin"),
        }
    }
}

pub(crate) struct Namespace {
    pub id_ns: IdentifyNamespace,
}

pub(crate) const NUM_NAMESPACES: u32 = 1;

pub struct NvmeController {
    pub(crate) bar: Bar,
    pub(crate) config: NvmeConfig,
    pub(crate) page_bits: u32,
    pub(crate) page_size: u64,
    pub(crate) max_prp_ents: usize,
    pub(crate) cqe_size: u64,
    pub(crate) sqe_size: u64,
    pub(crate) sq: Vec<Option<SubQueue>>,
    pub(crate) cq: Vec<Option<CompQueue>>,
    pub(crate) namespace: Namespace,
    pub(crate) id_ctrl: IdentifyController,
    pub(crate) smart: SmartLog,
    pub(crate) error_log: Vec<ErrorLogEntry>,
    pub(crate) cmb: Option<Cmb>,
    pub(crate) engine: AioEngine,
    pub(crate) time: TimeSource,
    pub(crate) timers: TimerQueue<QueueTimer>,
    pub(crate) host_timestamp: u64,
    pub(crate) timestamp_set_ms: u64,
    irq: Box<dyn InterruptTarget>,
    irq_status: u64,
    intx_level: bool,
}

impl NvmeController {
    pub fn try_new<D: VirtualDisk + 'static>(
        disk: D,
        config: NvmeConfig,
        time: TimeSource,
    ) -> Result<Self, DiskError> {
        Self::try_new_from_virtual_disk(Box::new(disk), config, time)
    }

    pub fn try_new_from_virtual_disk(
        disk: Box<dyn VirtualDisk>,
        config: NvmeConfig,
        time: TimeSource,
    ) -> Result<Self, DiskError> {
        if config.serial.is_empty() {
            tracing::error!(target: "nvme", "serial must be set");
            return Err(DiskError::Io);
        }
        if config.num_queues < 2 {
            tracing::error!(target: "nvme", num_queues = config.num_queues, "need the admin pair plus at least one I/O queue");
            return Err(DiskError::Io);
        }
        let capacity = disk.capacity_bytes();
        if capacity == 0 || capacity % SECTOR_SIZE as u64 != 0 {
            tracing::error!(target: "nvme", capacity, "capacity must be a non-zero multiple of the sector size");
            return Err(DiskError::Io);
        }

        let engine = AioEngine::new(disk);
        let lba_shift = SECTOR_SIZE.trailing_zeros() as u8;
        let namespace = Namespace {
            id_ns: IdentifyNamespace::new(capacity >> lba_shift, lba_shift),
        };
        let id_ctrl = IdentifyController::new(
            &config.serial,
            engine.write_cache_enabled(),
            NUM_NAMESPACES,
            NUM_ERROR_LOG as u8,
        );
        let mut smart = SmartLog::load(&config.smart_log_path);
        smart.install_fixed_fields();

        let mut bar = Bar::default();
        cap::set_mqes(&mut bar.cap, 0x7ff);
        cap::set_cqr(&mut bar.cap, true);
        cap::set_to(&mut bar.cap, 0xf);
        cap::set_css_nvm(&mut bar.cap);
        cap::set_mpsmax(&mut bar.cap, 4);
        bar.vs = 0x0001_0200;

        let cmb = (config.cmb_size_mb > 0).then(|| Cmb::new(config.cmb_size_mb));
        if cmb.is_some() {
            bar.cmbloc = cmbreg::loc(2);
            bar.cmbsz = cmbreg::sz(config.cmb_size_mb);
        }

        let queues = config.num_queues as usize;
        Ok(Self {
            bar,
            page_bits: 0,
            page_size: 0,
            max_prp_ents: 0,
            cqe_size: 0,
            sqe_size: 0,
            sq: (0..queues).map(|_| None).collect(),
            cq: (0..queues).map(|_| None).collect(),
            namespace,
            id_ctrl,
            smart,
            error_log: vec![ErrorLogEntry::unused(); NUM_ERROR_LOG],
            cmb,
            engine,
            time,
            timers: TimerQueue::new(),
            host_timestamp: 0,
            timestamp_set_ms: 0,
            irq: Box::new(NullInterrupts),
            irq_status: 0,
            intx_level: false,
            config,
        })
    }

    pub fn set_irq_target(&mut self, target: Option<Box<dyn InterruptTarget>>) {
        self.irq = target.unwrap_or_else(|| Box::new(NullInterrupts));
    }

    /// Current legacy pin level.
    pub fn irq_asserted(&self) -> bool {
        self.intx_level
    }

    pub fn aio_stats(&self) -> &AioStats {
        self.engine.stats()
    }

    /// Earliest deadline of any armed queue timer.
    pub fn next_wakeup_ns(&self) -> Option<u64> {
        self.timers.next_deadline_ns()
    }

    pub fn has_cmb(&self) -> bool {
        self.cmb.is_some()
    }

    pub fn cmb_len(&self) -> usize {
        self.cmb.as_ref().map_or(0, Cmb::len)
    }

    /// Install the guest-physical base of the CMB window once the host has
    /// mapped its BAR.
    pub fn set_cmb_base(&mut self, base: u64) {
        if let Some(cmb) = self.cmb.as_mut() {
            cmb.set_base(base);
        }
    }

    pub fn cmb_read(&self, offset: usize, buf: &mut [u8]) {
        if let Some(cmb) = self.cmb.as_ref() {
            cmb.read(offset, buf);
        }
    }

    pub fn cmb_write(&mut self, offset: usize, data: &[u8]) {
        if let Some(cmb) = self.cmb.as_mut() {
            cmb.write(offset, data);
        }
    }

    // ---- MMIO ----

    pub fn mmio_read(&mut self, offset: u64, size: usize) -> u64 {
        if offset % 4 != 0 {
            tracing::warn!(target: "nvme", offset, "MMIO read not 32-bit aligned, returning 0");
            return 0;
        }
        if size < 4 {
            tracing::warn!(target: "nvme", offset, size, "MMIO read smaller than 32 bits, returning 0");
            return 0;
        }

        if offset < REG_IMAGE_LEN && offset + size as u64 <= REG_IMAGE_LEN {
            let img = self.bar.image();
            let mut val = 0u64;
            for i in 0..size.min(8) {
                val |= (img[offset as usize + i] as u64) << (8 * i);
            }
            val
        } else {
            tracing::warn!(target: "nvme", offset, "MMIO read beyond last register, returning 0");
            0
        }
    }

    pub fn mmio_write(&mut self, offset: u64, size: usize, value: u64) {
        if offset < REG_IMAGE_LEN {
            self.write_bar(offset, size, value);
        } else if offset >= DOORBELL_BASE {
            self.process_doorbell(offset, value);
        }
    }

    fn write_bar(&mut self, offset: u64, size: usize, data: u64) {
        if offset % 4 != 0 {
            tracing::warn!(target: "nvme", offset, "MMIO write not 32-bit aligned, ignoring");
            return;
        }
        if size < 4 {
            tracing::warn!(target: "nvme", offset, size, "MMIO write smaller than 32 bits, ignoring");
            return;
        }

        match offset {
            NVME_REG_INTMS => {
                if self.irq.msix_enabled() {
                    // Undefined while MSI-X is active; the write is still applied.
                    tracing::warn!(target: "nvme", "access to interrupt mask set while MSI-X is enabled");
                }
                self.bar.intms |= data as u32;
                self.bar.intmc = self.bar.intms;
                tracing::trace!(target: "nvme", mask = self.bar.intms, "INTMS set");
                self.irq_check();
            }
            NVME_REG_INTMC => {
                if self.irq.msix_enabled() {
                    tracing::warn!(target: "nvme", "access to interrupt mask clear while MSI-X is enabled");
                }
                self.bar.intms &= !(data as u32);
                self.bar.intmc = self.bar.intms;
                tracing::trace!(target: "nvme", mask = self.bar.intms, "INTMC cleared");
                self.irq_check();
            }
            NVME_REG_CC => self.write_cc(data as u32),
            NVME_REG_CSTS => {
                if data as u32 & CSTS_NSSRO != 0 {
                    tracing::warn!(target: "nvme", "attempted to W1C CSTS.NSSRO but CAP.NSSRS is zero");
                } else if data != 0 {
                    tracing::warn!(target: "nvme", "attempted to set a read-only bit of controller status");
                }
            }
            NVME_REG_NSSR => {
                if data as u32 == NSSR_MAGIC {
                    tracing::warn!(target: "nvme", "NVM subsystem reset is not supported");
                }
                // Writes of other values have no effect.
            }
            NVME_REG_AQA => {
                self.bar.aqa = data as u32;
                tracing::trace!(target: "nvme", aqa = self.bar.aqa, "admin queue attributes");
            }
            NVME_REG_ASQ => {
                self.bar.asq = data;
                tracing::trace!(target: "nvme", asq = self.bar.asq, "admin SQ base");
            }
            NVME_REG_ASQ_HI => {
                self.bar.asq |= data << 32;
            }
            NVME_REG_ACQ => {
                self.bar.acq = data;
                tracing::trace!(target: "nvme", acq = self.bar.acq, "admin CQ base");
            }
            NVME_REG_ACQ_HI => {
                self.bar.acq |= data << 32;
            }
            NVME_REG_CMBLOC => {
                tracing::warn!(target: "nvme", "invalid write to reserved CMBLOC, ignored");
            }
            NVME_REG_CMBSZ => {
                tracing::warn!(target: "nvme", "invalid write to read-only CMBSZ, ignored");
            }
            _ => {
                tracing::warn!(target: "nvme", offset, data, "invalid MMIO write");
            }
        }
    }

    fn write_cc(&mut self, data: u32) {
        tracing::trace!(target: "nvme", cc = data, "CC write");

        // Windows writes the configuration dwords first and the enable bit
        // in a separate access; store edge-free writes verbatim.
        if !cc::en(data) && !cc::en(self.bar.cc) && cc::shn(data) == 0 && cc::shn(self.bar.cc) == 0
        {
            self.bar.cc = data;
        }

        if cc::en(data) && !cc::en(self.bar.cc) {
            self.bar.cc = data;
            if self.start_ctrl().is_err() {
                tracing::warn!(target: "nvme", "controller enable failed");
                self.bar.csts = CSTS_FAILED;
            } else {
                tracing::debug!(target: "nvme", "controller enabled");
                self.bar.csts = CSTS_READY;
            }
        } else if !cc::en(data) && cc::en(self.bar.cc) {
            tracing::debug!(target: "nvme", "controller disabled");
            self.clear_ctrl();
            self.bar.csts &= !CSTS_READY;
        }

        if cc::shn(data) != 0 && cc::shn(self.bar.cc) == 0 {
            tracing::debug!(target: "nvme", "shutdown requested");
            self.clear_ctrl();
            self.bar.cc = data;
            self.bar.csts |= CSTS_SHST_COMPLETE;
            self.smart.increment_power_cycles();
            self.smart.save(&self.config.smart_log_path);
        } else if cc::shn(data) == 0 && cc::shn(self.bar.cc) != 0 {
            tracing::debug!(target: "nvme", "shutdown cleared");
            self.bar.csts &= !CSTS_SHST_COMPLETE;
            self.bar.cc = data;
        }
    }

    fn start_ctrl(&mut self) -> Result<(), ()> {
        let ctrl_cc = self.bar.cc;
        let page_bits = cc::mps(ctrl_cc) as u32 + 12;
        let page_size = 1u64 << page_bits;

        let fail = |what: &str| {
            tracing::warn!(target: "nvme", what, "enable precondition failed");
            Err(())
        };

        if self.cq[0].is_some() {
            return fail("admin CQ already present");
        }
        if self.sq[0].is_some() {
            return fail("admin SQ already present");
        }
        if self.bar.asq == 0 {
            return fail("ASQ is zero");
        }
        if self.bar.acq == 0 {
            return fail("ACQ is zero");
        }
        if self.bar.asq & (page_size - 1) != 0 {
            return fail("ASQ not page aligned");
        }
        if self.bar.acq & (page_size - 1) != 0 {
            return fail("ACQ not page aligned");
        }
        if cc::mps(ctrl_cc) < cap::mpsmin(self.bar.cap) {
            return fail("page size too small");
        }
        if cc::mps(ctrl_cc) > cap::mpsmax(self.bar.cap) {
            return fail("page size too large");
        }
        let (cqes_min, cqes_max) = self.id_ctrl.cqes_range();
        if cc::iocqes(ctrl_cc) < cqes_min {
            return fail("CQ entry size too small");
        }
        if cc::iocqes(ctrl_cc) > cqes_max {
            return fail("CQ entry size too large");
        }
        let (sqes_min, sqes_max) = self.id_ctrl.sqes_range();
        if cc::iosqes(ctrl_cc) < sqes_min {
            return fail("SQ entry size too small");
        }
        if cc::iosqes(ctrl_cc) > sqes_max {
            return fail("SQ entry size too large");
        }
        if aqa::asqs(self.bar.aqa) == 0 {
            return fail("admin SQ size is zero");
        }
        if aqa::acqs(self.bar.aqa) == 0 {
            return fail("admin CQ size is zero");
        }

        self.page_bits = page_bits;
        self.page_size = page_size;
        self.max_prp_ents = (page_size / 8) as usize;
        self.cqe_size = 1 << cc::iocqes(ctrl_cc);
        self.sqe_size = 1 << cc::iosqes(ctrl_cc);

        let mut admin_cq = CompQueue::new(0, self.bar.acq, 0, aqa::acqs(self.bar.aqa) + 1, true);
        admin_cq.attach_sq(0);
        self.cq[0] = Some(admin_cq);
        self.sq[0] = Some(SubQueue::new(0, 0, self.bar.asq, aqa::asqs(self.bar.aqa) + 1));

        self.set_timestamp(0);
        Ok(())
    }

    fn clear_ctrl(&mut self) {
        // Outstanding backend I/O is cancelled; its completions die with the
        // queues they belonged to.
        self.engine.cancel_all();
        for sq in self.sq.iter_mut() {
            *sq = None;
        }
        for cq in self.cq.iter_mut() {
            *cq = None;
        }
        self.timers.clear();
        self.irq_status = 0;
        self.irq_check();
        if let Err(err) = self.engine.flush_sync() {
            tracing::warn!(target: "nvme", %err, "backend flush failed during controller clear");
        }
        self.bar.cc = 0;
    }

    // ---- Doorbells ----

    fn process_doorbell(&mut self, addr: u64, value: u64) {
        if addr % 4 != 0 {
            tracing::warn!(target: "nvme", addr, "doorbell write not 32-bit aligned, ignoring");
            return;
        }

        let val = (value & 0xffff) as u16;
        if ((addr - DOORBELL_BASE) >> 2) & 1 == 1 {
            // Completion queue head doorbell.
            let qid = ((addr - (DOORBELL_BASE + 4)) >> 3) as usize;
            let Some(cq) = self.cq.get_mut(qid).and_then(Option::as_mut) else {
                tracing::warn!(target: "nvme", qid, "completion queue doorbell for nonexistent queue, ignoring");
                return;
            };
            if val >= cq.size {
                tracing::warn!(target: "nvme", qid, new_head = val, "completion queue doorbell beyond queue size, ignoring");
                return;
            }

            let start_sqs = cq.is_full();
            cq.head = val;
            if start_sqs {
                // Freed CQ slots unblock every bound SQ; rearm them and the
                // CQ itself.
                let deadline = self.time.now_ns() + QUEUE_DEFER_NS;
                let sqids = cq.bound_sqs().to_vec();
                for sqid in sqids {
                    self.timers.schedule(QueueTimer::Sq(sqid), deadline);
                }
                self.timers.schedule(QueueTimer::Cq(qid as u16), deadline);
            }

            let cq = self.cq[qid].as_ref().unwrap();
            if cq.tail == cq.head {
                self.irq_deassert(qid as u16);
            }
        } else {
            // Submission queue tail doorbell.
            let qid = ((addr - DOORBELL_BASE) >> 3) as usize;
            let Some(sq) = self.sq.get_mut(qid).and_then(Option::as_mut) else {
                tracing::warn!(target: "nvme", qid, "submission queue doorbell for nonexistent queue, ignoring");
                return;
            };
            if val >= sq.size {
                tracing::warn!(target: "nvme", qid, new_tail = val, "submission queue doorbell beyond queue size, ignoring");
                return;
            }

            sq.tail = val;
            self.timers
                .schedule(QueueTimer::Sq(qid as u16), self.time.now_ns() + QUEUE_DEFER_NS);
        }
    }

    // ---- Pump ----

    /// Drain backend completions and run queue work that has come due on the
    /// virtual clock.
    pub fn process(&mut self, mem: &mut dyn MemoryBus) {
        self.drain_aio(mem);
        let now = self.time.now_ns();
        while let Some(ev) = self.timers.pop_due(now) {
            match ev.payload {
                QueueTimer::Sq(qid) => self.process_sq(qid, mem),
                QueueTimer::Cq(qid) => self.post_cqes(qid, mem),
            }
            self.drain_aio(mem);
        }
    }

    fn drain_aio(&mut self, mem: &mut dyn MemoryBus) {
        while let Some(completion) = self.engine.poll_completion() {
            let sqid = (completion.token >> 16) as u16;
            let slot = (completion.token & 0xffff) as u16;

            let Some(sq) = self.sq.get_mut(sqid as usize).and_then(Option::as_mut) else {
                // Queue deleted while the request was outstanding.
                continue;
            };

            let status = match completion.result {
                Ok(()) => NVME_SUCCESS,
                Err(_) => NVME_INTERNAL_DEV_ERROR,
            };
            let req = sq.slot_mut(slot);
            req.status = status;
            req.aio_token = None;
            let scatter = if req.is_read && status == NVME_SUCCESS {
                req.mapping.take().zip(completion.data)
            } else {
                req.mapping = None;
                None
            };

            if let Some((mapping, data)) = scatter {
                self.copy_to_mapping(mem, &mapping, &data);
            }
            self.enqueue_req_completion(sqid, slot);
        }
    }

    fn process_sq(&mut self, qid: u16, mem: &mut dyn MemoryBus) {
        loop {
            let (dma_addr, head) = match self.sq.get(qid as usize).and_then(Option::as_ref) {
                Some(sq) if !sq.is_empty() && sq.has_free_slot() => (sq.dma_addr, sq.head),
                _ => break,
            };

            let mut raw = [0u8; 64];
            let addr = dma_addr + head as u64 * self.sqe_size;
            prp::addr_read(self.cmb.as_ref(), mem, addr, &mut raw);
            let cmd = Command::parse(&raw);

            let sq = self.sq[qid as usize].as_mut().unwrap();
            sq.advance_head();
            let slot = sq.take_free_slot().expect("free slot checked above");
            sq.slot_mut(slot).reset(cmd.cid);

            let status = if qid == 0 {
                self.admin_cmd(mem, &cmd, qid, slot)
            } else {
                self.io_cmd(mem, &cmd, qid, slot)
            };

            if let Some(status) = status {
                self.sq[qid as usize].as_mut().unwrap().slot_mut(slot).status = status;
                self.enqueue_req_completion(qid, slot);
            }
        }
    }

    /// Move a finished request onto its CQ's pending list and rearm the CQ.
    pub(crate) fn enqueue_req_completion(&mut self, sqid: u16, slot: u16) {
        let sq = self.sq[sqid as usize].as_mut().expect("live SQ");
        sq.remove_in_flight(slot);
        let cqid = sq.cqid;
        let cq = self.cq[cqid as usize].as_mut().expect("SQ is bound to a live CQ");
        cq.pending.push_back((sqid, slot));
        self.timers
            .schedule(QueueTimer::Cq(cqid), self.time.now_ns() + QUEUE_DEFER_NS);
    }

    /// Write pending completion entries to guest memory until the CQ fills.
    pub(crate) fn post_cqes(&mut self, cqid: u16, mem: &mut dyn MemoryBus) {
        let cqe_size = self.cqe_size;
        let sqs = &mut self.sq;
        let Some(cq) = self.cq.get_mut(cqid as usize).and_then(Option::as_mut) else {
            return;
        };

        while !cq.is_full() {
            let Some(&(sqid, slot)) = cq.pending.front() else {
                break;
            };
            let sq = sqs[sqid as usize]
                .as_mut()
                .expect("pending completion references a live SQ");

            let req = sq.slot(slot);
            let mut cqe = [0u8; 16];
            cqe[0..4].copy_from_slice(&req.result.to_le_bytes());
            cqe[8..10].copy_from_slice(&sq.head.to_le_bytes());
            cqe[10..12].copy_from_slice(&sqid.to_le_bytes());
            cqe[12..14].copy_from_slice(&req.cid.to_le_bytes());
            let status = (req.status << 1) | cq.phase as u16;
            cqe[14..16].copy_from_slice(&status.to_le_bytes());

            let addr = cq.dma_addr + cq.tail as u64 * cqe_size;
            cq.advance_tail();
            mem.write_physical(addr, &cqe);

            cq.pending.pop_front();
            sq.release_slot(slot);
        }

        if cq.tail != cq.head {
            self.irq_assert(cqid);
        }
    }

    // ---- Interrupts ----

    fn irq_check(&mut self) {
        if self.irq.msix_enabled() {
            return;
        }
        let level = (!(self.bar.intms as u64) & self.irq_status) != 0;
        self.intx_level = level;
        self.irq.intx_set(level);
    }

    pub(crate) fn irq_assert(&mut self, cqid: u16) {
        let Some(cq) = self.cq[cqid as usize].as_ref() else {
            return;
        };
        if !cq.irq_enabled {
            tracing::trace!(target: "nvme", cqid, "interrupt masked per-queue");
            return;
        }
        let vector = cq.vector;
        if self.irq.msix_enabled() {
            tracing::trace!(target: "nvme", vector, "raising MSI-X");
            self.irq.msix_notify(vector);
        } else {
            debug_assert!(cqid < 64);
            self.irq_status |= 1u64 << cqid;
            self.irq_check();
        }
    }

    pub(crate) fn irq_deassert(&mut self, cqid: u16) {
        let Some(cq) = self.cq[cqid as usize].as_ref() else {
            return;
        };
        if !cq.irq_enabled || self.irq.msix_enabled() {
            return;
        }
        debug_assert!(cqid < 64);
        self.irq_status &= !(1u64 << cqid);
        self.irq_check();
    }

    // ---- Timestamp feature ----

    pub(crate) fn set_timestamp(&mut self, ts: u64) {
        tracing::trace!(target: "nvme", ts, "timestamp anchored");
        self.host_timestamp = ts;
        self.timestamp_set_ms = self.time.now_ms();
    }

    pub(crate) fn get_timestamp(&self) -> u64 {
        let elapsed = self.time.now_ms() - self.timestamp_set_ms;
        let stamp = (self.host_timestamp.wrapping_add(elapsed)) & 0xffff_ffff_ffff;
        // Origin 01b: set by the host via Set Features.
        let origin = if self.host_timestamp != 0 { 1u64 } else { 0 };
        stamp | origin << 49
    }

    // ---- Queue lookups shared with the dispatchers ----

    pub(crate) fn sq_exists(&self, qid: u16) -> bool {
        self.sq
            .get(qid as usize)
            .is_some_and(|slot| slot.is_some())
    }

    pub(crate) fn cq_exists(&self, qid: u16) -> bool {
        self.cq
            .get(qid as usize)
            .is_some_and(|slot| slot.is_some())
    }

    pub(crate) fn num_queues(&self) -> u32 {
        self.config.num_queues
    }
}

impl MmioHandler for NvmeController {
    fn mmio_read(&mut self, offset: u64, size: usize) -> u64 {
        NvmeController::mmio_read(self, offset, size)
    }

    fn mmio_write(&mut self, offset: u64, size: usize, value: u64) {
        NvmeController::mmio_write(self, offset, size, value)
    }
}
