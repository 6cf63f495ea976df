//! Admin command dispatch: queue management, log pages, identify and
//! features.

use memory::MemoryBus;

use crate::controller::{NvmeController, QueueTimer, NUM_NAMESPACES};
use crate::identify::FIRMWARE_REV;
use crate::logs::{
    self, encode_error_log, CMD_EFFECTS_LOG_LEN, ERROR_LOG_ENTRY_LEN, FW_SLOT_LOG_LEN,
    NUM_ERROR_LOG, SMART_LOG_LEN, TELEMETRY_HEADER_LEN,
};
use crate::queues::{CompQueue, SubQueue};
use crate::regs::{
    cap, Command, ADM_CMD_CREATE_CQ, ADM_CMD_CREATE_SQ, ADM_CMD_DELETE_CQ, ADM_CMD_DELETE_SQ,
    ADM_CMD_GET_FEATURES, ADM_CMD_GET_LOG_PAGE, ADM_CMD_IDENTIFY, ADM_CMD_SET_FEATURES,
    FEAT_NUMBER_OF_QUEUES, FEAT_TIMESTAMP, FEAT_VOLATILE_WRITE_CACHE, LOG_CMD_EFFECTS,
    LOG_ERROR_INFO, LOG_FW_SLOT_INFO, LOG_SMART_INFO, LOG_TELEMETRY_CTRL, LOG_TELEMETRY_HOST,
    NVME_DNR, NVME_INVALID_CQID, NVME_INVALID_FIELD, NVME_INVALID_IRQ_VECTOR, NVME_INVALID_LOG_ID,
    NVME_INVALID_NSID, NVME_INVALID_OPCODE, NVME_INVALID_QID, NVME_INVALID_QUEUE_DEL,
    NVME_MAX_QSIZE_EXCEEDED, NVME_SUCCESS,
};

impl NvmeController {
    pub(crate) fn admin_cmd(
        &mut self,
        mem: &mut dyn MemoryBus,
        cmd: &Command,
        sqid: u16,
        slot: u16,
    ) -> Option<u16> {
        match cmd.opcode {
            ADM_CMD_DELETE_SQ => Some(self.del_sq(mem, cmd)),
            ADM_CMD_CREATE_SQ => Some(self.create_sq(cmd)),
            ADM_CMD_GET_LOG_PAGE => Some(self.get_log_page(mem, cmd)),
            ADM_CMD_DELETE_CQ => Some(self.del_cq(cmd)),
            ADM_CMD_CREATE_CQ => Some(self.create_cq(cmd)),
            ADM_CMD_IDENTIFY => Some(self.identify(mem, cmd)),
            ADM_CMD_SET_FEATURES => Some(self.set_feature(mem, cmd, sqid, slot)),
            ADM_CMD_GET_FEATURES => Some(self.get_feature(mem, cmd, sqid, slot)),
            opcode => {
                tracing::warn!(target: "nvme", opcode, "invalid admin opcode");
                Some(NVME_INVALID_OPCODE | NVME_DNR)
            }
        }
    }

    // ---- Queue management ----

    fn del_sq(&mut self, mem: &mut dyn MemoryBus, cmd: &Command) -> u16 {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == 0 || !self.sq_exists(qid) {
            tracing::warn!(target: "nvme", qid, "delete of nonexistent submission queue");
            return NVME_INVALID_QID | NVME_DNR;
        }
        tracing::debug!(target: "nvme", qid, "deleting submission queue");

        // Cancel outstanding backend I/O for this queue; the cancelled
        // completions never reach the CQ.
        let sq = self.sq[qid as usize].as_ref().unwrap();
        let cqid = sq.cqid;
        let tokens: Vec<u64> = sq
            .in_flight_slots()
            .iter()
            .filter_map(|&s| sq.slot(s).aio_token)
            .collect();
        for token in tokens {
            self.engine.cancel(token);
        }

        if self.cq_exists(cqid) {
            self.cq[cqid as usize].as_mut().unwrap().detach_sq(qid);
            // Flush what fits, then drop completions stranded by the delete.
            self.post_cqes(cqid, mem);
            self.cq[cqid as usize]
                .as_mut()
                .unwrap()
                .pending
                .retain(|&(s, _)| s != qid);
        }

        self.timers.cancel(&QueueTimer::Sq(qid));
        self.sq[qid as usize] = None;
        NVME_SUCCESS
    }

    fn create_sq(&mut self, cmd: &Command) -> u16 {
        let sqid = (cmd.cdw10 & 0xffff) as u16;
        let qsize = ((cmd.cdw10 >> 16) & 0xffff) as u16;
        let qflags = (cmd.cdw11 & 0xffff) as u16;
        let cqid = ((cmd.cdw11 >> 16) & 0xffff) as u16;
        let prp1 = cmd.prp1;

        tracing::debug!(target: "nvme", sqid, cqid, qsize, qflags, prp1, "create submission queue");

        if cqid == 0 || !self.cq_exists(cqid) {
            tracing::warn!(target: "nvme", cqid, "create SQ references nonexistent CQ");
            return NVME_INVALID_CQID | NVME_DNR;
        }
        if sqid == 0 || sqid as u32 >= self.num_queues() || self.sq_exists(sqid) {
            tracing::warn!(target: "nvme", sqid, "create SQ with invalid queue id");
            return NVME_INVALID_QID | NVME_DNR;
        }
        if qsize == 0 || qsize > cap::mqes(self.bar.cap) {
            tracing::warn!(target: "nvme", qsize, "create SQ size out of range");
            return NVME_MAX_QSIZE_EXCEEDED | NVME_DNR;
        }
        if prp1 == 0 || prp1 & (self.page_size - 1) != 0 {
            tracing::warn!(target: "nvme", prp1, "create SQ base not page aligned");
            return NVME_INVALID_FIELD | NVME_DNR;
        }
        if qflags & 1 == 0 {
            // Only physically contiguous queues are supported (CAP.CQR).
            tracing::warn!(target: "nvme", qflags, "create SQ without PC flag");
            return NVME_INVALID_FIELD | NVME_DNR;
        }

        self.sq[sqid as usize] = Some(SubQueue::new(sqid, cqid, prp1, qsize as u32 + 1));
        self.cq[cqid as usize].as_mut().unwrap().attach_sq(sqid);
        NVME_SUCCESS
    }

    fn del_cq(&mut self, cmd: &Command) -> u16 {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == 0 || !self.cq_exists(qid) {
            tracing::warn!(target: "nvme", qid, "delete of nonexistent completion queue");
            return NVME_INVALID_CQID | NVME_DNR;
        }
        if self.cq[qid as usize].as_ref().unwrap().has_bound_sqs() {
            tracing::warn!(target: "nvme", qid, "delete of completion queue with bound SQs");
            return NVME_INVALID_QUEUE_DEL;
        }
        tracing::debug!(target: "nvme", qid, "deleting completion queue");
        self.irq_deassert(qid);
        self.timers.cancel(&QueueTimer::Cq(qid));
        self.cq[qid as usize] = None;
        NVME_SUCCESS
    }

    fn create_cq(&mut self, cmd: &Command) -> u16 {
        let cqid = (cmd.cdw10 & 0xffff) as u16;
        let qsize = ((cmd.cdw10 >> 16) & 0xffff) as u16;
        let qflags = (cmd.cdw11 & 0xffff) as u16;
        let vector = ((cmd.cdw11 >> 16) & 0xffff) as u16;
        let prp1 = cmd.prp1;
        let irq_enabled = qflags & 0x2 != 0;

        tracing::debug!(target: "nvme", cqid, vector, qsize, qflags, irq_enabled, "create completion queue");

        if cqid == 0 || cqid as u32 >= self.num_queues() || self.cq_exists(cqid) {
            tracing::warn!(target: "nvme", cqid, "create CQ with invalid queue id");
            return NVME_INVALID_CQID | NVME_DNR;
        }
        if qsize == 0 || qsize > cap::mqes(self.bar.cap) {
            tracing::warn!(target: "nvme", qsize, "create CQ size out of range");
            return NVME_MAX_QSIZE_EXCEEDED | NVME_DNR;
        }
        if prp1 == 0 {
            tracing::warn!(target: "nvme", "create CQ with null base address");
            return NVME_INVALID_FIELD | NVME_DNR;
        }
        if vector as u32 > self.num_queues() {
            tracing::warn!(target: "nvme", vector, "create CQ with out-of-range vector");
            return NVME_INVALID_IRQ_VECTOR | NVME_DNR;
        }
        if qflags & 1 == 0 {
            tracing::warn!(target: "nvme", qflags, "create CQ without PC flag");
            return NVME_INVALID_FIELD | NVME_DNR;
        }

        self.cq[cqid as usize] = Some(CompQueue::new(
            cqid,
            prp1,
            vector,
            qsize as u32 + 1,
            irq_enabled,
        ));
        NVME_SUCCESS
    }

    // ---- Get Log Page ----

    fn get_log_page(&mut self, mem: &mut dyn MemoryBus, cmd: &Command) -> u16 {
        let lid = (cmd.cdw10 & 0xff) as u8;
        match lid {
            LOG_ERROR_INFO => {
                let data = encode_error_log(&self.error_log);
                self.log_dma(mem, cmd, &data, NUM_ERROR_LOG * ERROR_LOG_ENTRY_LEN)
            }
            LOG_SMART_INFO => {
                let data = self.smart.encode();
                self.log_dma(mem, cmd, &data, SMART_LOG_LEN)
            }
            LOG_FW_SLOT_INFO => {
                let data = logs::firmware_slot_log(FIRMWARE_REV);
                self.log_dma(mem, cmd, &data, FW_SLOT_LOG_LEN)
            }
            LOG_CMD_EFFECTS => {
                let data = logs::command_effects_log();
                self.log_dma(mem, cmd, &data, CMD_EFFECTS_LOG_LEN)
            }
            LOG_TELEMETRY_HOST | LOG_TELEMETRY_CTRL => self.get_telemetry(mem, cmd, lid),
            _ => {
                tracing::warn!(target: "nvme", lid, "invalid log page id");
                NVME_INVALID_LOG_ID | NVME_DNR
            }
        }
    }

    fn get_telemetry(&mut self, mem: &mut dyn MemoryBus, cmd: &Command, lid: u8) -> u16 {
        let create = (cmd.cdw10 >> 8) & 1 != 0;
        tracing::debug!(
            target: "nvme",
            lid,
            create,
            rae = (cmd.cdw10 >> 15) & 1,
            numdl = (cmd.cdw10 >> 16) & 0xffff,
            numdu = cmd.cdw11 & 0xffff,
            lpol = cmd.cdw12,
            lpou = cmd.cdw13,
            "telemetry log requested"
        );

        // The create bit asks for the Windows device-internal-log layout
        // rather than the NVMe telemetry header.
        let data = if create {
            logs::telemetry_internal_status_block()
        } else {
            logs::telemetry_log_header(lid)
        };
        self.log_dma(mem, cmd, &data, TELEMETRY_HEADER_LEN)
    }

    /// Transfer `(NUMD + 1) << 2` bytes of a log image, rejecting reads past
    /// the end of the structure.
    fn log_dma(&mut self, mem: &mut dyn MemoryBus, cmd: &Command, data: &[u8], max: usize) -> u16 {
        let numd = ((cmd.cdw10 >> 16) & 0x0fff) as usize;
        let len = (numd + 1) << 2;
        if len > max {
            return NVME_INVALID_FIELD | NVME_DNR;
        }
        self.dma_read_prp(mem, &data[..len], cmd.prp1, cmd.prp2)
    }

    // ---- Identify ----

    fn identify(&mut self, mem: &mut dyn MemoryBus, cmd: &Command) -> u16 {
        match cmd.cdw10 {
            0x00 => {
                tracing::debug!(target: "nvme", nsid = cmd.nsid, "identify namespace");
                if cmd.nsid == 0 || cmd.nsid > NUM_NAMESPACES {
                    tracing::warn!(target: "nvme", nsid = cmd.nsid, "identify of invalid namespace");
                    return NVME_INVALID_NSID | NVME_DNR;
                }
                let data = self.namespace.id_ns.encode();
                self.dma_read_prp(mem, &data, cmd.prp1, cmd.prp2)
            }
            0x01 => {
                tracing::debug!(target: "nvme", "identify controller");
                let data = self.id_ctrl.encode();
                self.dma_read_prp(mem, &data, cmd.prp1, cmd.prp2)
            }
            0x02 => {
                tracing::debug!(target: "nvme", min_nsid = cmd.nsid, "identify namespace list");
                let mut data = [0u8; 4096];
                let mut j = 0;
                for i in 0..NUM_NAMESPACES {
                    if i < cmd.nsid {
                        continue;
                    }
                    data[j * 4..j * 4 + 4].copy_from_slice(&(i + 1).to_le_bytes());
                    j += 1;
                    if j == data.len() / 4 {
                        break;
                    }
                }
                self.dma_read_prp(mem, &data, cmd.prp1, cmd.prp2)
            }
            cns => {
                tracing::warn!(target: "nvme", cns, "invalid identify CNS");
                NVME_INVALID_FIELD | NVME_DNR
            }
        }
    }

    // ---- Features ----

    fn get_feature(
        &mut self,
        mem: &mut dyn MemoryBus,
        cmd: &Command,
        sqid: u16,
        slot: u16,
    ) -> u16 {
        let result = match cmd.cdw10 {
            FEAT_VOLATILE_WRITE_CACHE => {
                let enabled = self.engine.write_cache_enabled();
                tracing::debug!(target: "nvme", enabled, "get feature: volatile write cache");
                enabled as u32
            }
            FEAT_NUMBER_OF_QUEUES => {
                let n = self.num_queues() - 2;
                tracing::debug!(target: "nvme", n, "get feature: number of queues");
                n | (n << 16)
            }
            FEAT_TIMESTAMP => {
                let ts = self.get_timestamp();
                return self.dma_read_prp(mem, &ts.to_le_bytes(), cmd.prp1, cmd.prp2);
            }
            fid => {
                tracing::warn!(target: "nvme", fid, "invalid get-features id");
                return NVME_INVALID_FIELD | NVME_DNR;
            }
        };
        self.sq[sqid as usize].as_mut().unwrap().slot_mut(slot).result = result;
        NVME_SUCCESS
    }

    fn set_feature(
        &mut self,
        mem: &mut dyn MemoryBus,
        cmd: &Command,
        sqid: u16,
        slot: u16,
    ) -> u16 {
        match cmd.cdw10 {
            FEAT_VOLATILE_WRITE_CACHE => {
                self.engine.set_write_cache(cmd.cdw11 & 1 != 0);
                NVME_SUCCESS
            }
            FEAT_NUMBER_OF_QUEUES => {
                // The guest-requested counts are acknowledged but the queue
                // complement is fixed at realize time.
                tracing::debug!(
                    target: "nvme",
                    req_sqs = (cmd.cdw11 & 0xffff) + 1,
                    req_cqs = ((cmd.cdw11 >> 16) & 0xffff) + 1,
                    have = self.num_queues() - 1,
                    "set feature: number of queues"
                );
                let n = self.num_queues() - 2;
                self.sq[sqid as usize].as_mut().unwrap().slot_mut(slot).result = n | (n << 16);
                NVME_SUCCESS
            }
            FEAT_TIMESTAMP => {
                let mut buf = [0u8; 8];
                let status = self.dma_write_prp(mem, &mut buf, cmd.prp1, cmd.prp2);
                if status != NVME_SUCCESS {
                    return status;
                }
                self.set_timestamp(u64::from_le_bytes(buf));
                NVME_SUCCESS
            }
            fid => {
                tracing::warn!(target: "nvme", fid, "invalid set-features id");
                NVME_INVALID_FIELD | NVME_DNR
            }
        }
    }
}
