//! NVM (I/O) command dispatch on the namespace: flush, read, write,
//! write zeroes and dataset management.

use memory::MemoryBus;
use strato_storage::aio::{AioKind, AioOp};

use crate::controller::{NvmeController, NUM_NAMESPACES};
use crate::regs::{
    Command, NVME_DNR, NVME_INTERNAL_DEV_ERROR, NVME_INVALID_NSID, NVME_INVALID_OPCODE,
    NVME_LBA_RANGE, NVME_SUCCESS, NVM_CMD_DSM, NVM_CMD_FLUSH, NVM_CMD_READ, NVM_CMD_WRITE,
    NVM_CMD_WRITE_ZEROES,
};

pub const NVME_NUM_MAX_DSM_RANGES: usize = 256;

const DSM_RANGE_LEN: usize = 16;

bitflags::bitflags! {
    /// Dataset Management attributes (CDW11).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DsmAttributes: u32 {
        const IDR = 1 << 0;
        const IDW = 1 << 1;
        const AD = 1 << 2;
    }
}

fn aio_token(sqid: u16, slot: u16) -> u64 {
    (sqid as u64) << 16 | slot as u64
}

impl NvmeController {
    pub(crate) fn io_cmd(
        &mut self,
        mem: &mut dyn MemoryBus,
        cmd: &Command,
        sqid: u16,
        slot: u16,
    ) -> Option<u16> {
        if cmd.nsid == 0 || cmd.nsid > NUM_NAMESPACES {
            tracing::warn!(target: "nvme", nsid = cmd.nsid, "I/O command for invalid namespace");
            return Some(NVME_INVALID_NSID | NVME_DNR);
        }

        match cmd.opcode {
            NVM_CMD_FLUSH => self.nvm_flush(sqid, slot),
            NVM_CMD_WRITE_ZEROES => self.nvm_write_zeroes(cmd, sqid, slot),
            NVM_CMD_WRITE | NVM_CMD_READ => self.nvm_rw(mem, cmd, sqid, slot),
            NVM_CMD_DSM => Some(self.nvm_dsm(mem, cmd)),
            opcode => {
                tracing::warn!(target: "nvme", opcode, "invalid I/O opcode");
                Some(NVME_INVALID_OPCODE | NVME_DNR)
            }
        }
    }

    fn nvm_flush(&mut self, sqid: u16, slot: u16) -> Option<u16> {
        let token = aio_token(sqid, slot);
        self.sq[sqid as usize].as_mut().unwrap().slot_mut(slot).aio_token = Some(token);
        self.engine.submit(token, AioOp::Flush);
        None
    }

    fn nvm_write_zeroes(&mut self, cmd: &Command, sqid: u16, slot: u16) -> Option<u16> {
        let data_shift = self.namespace.id_ns.lba_shift;
        let slba = cmd.cdw10 as u64 | (cmd.cdw11 as u64) << 32;
        let nlb = (cmd.cdw12 & 0xffff) as u64 + 1;

        if out_of_range(slba, nlb, self.namespace.id_ns.nsze) {
            tracing::warn!(target: "nvme", slba, nlb, nsze = self.namespace.id_ns.nsze, "write zeroes out of range");
            self.engine.stats_mut().account_invalid(AioKind::Write);
            return Some(NVME_LBA_RANGE | NVME_DNR);
        }

        let token = aio_token(sqid, slot);
        self.sq[sqid as usize].as_mut().unwrap().slot_mut(slot).aio_token = Some(token);
        self.engine.submit(
            token,
            AioOp::WriteZeroes {
                offset: slba << data_shift,
                len: nlb << data_shift,
                may_unmap: true,
            },
        );
        None
    }

    fn nvm_rw(
        &mut self,
        mem: &mut dyn MemoryBus,
        cmd: &Command,
        sqid: u16,
        slot: u16,
    ) -> Option<u16> {
        let is_write = cmd.opcode == NVM_CMD_WRITE;
        let kind = if is_write { AioKind::Write } else { AioKind::Read };
        let data_shift = self.namespace.id_ns.lba_shift;
        let slba = cmd.cdw10 as u64 | (cmd.cdw11 as u64) << 32;
        let nlb = (cmd.cdw12 & 0xffff) as u64 + 1;
        let data_size = nlb << data_shift;
        let data_offset = slba << data_shift;

        tracing::trace!(
            target: "nvme",
            op = if is_write { "write" } else { "read" },
            slba,
            nlb,
            data_size,
            "rw command"
        );

        if out_of_range(slba, nlb, self.namespace.id_ns.nsze) {
            tracing::warn!(target: "nvme", slba, nlb, nsze = self.namespace.id_ns.nsze, "LBA out of range");
            self.engine.stats_mut().account_invalid(kind);
            return Some(NVME_LBA_RANGE | NVME_DNR);
        }

        let mapping = match self.map_prp_cmd(mem, cmd.prp1, cmd.prp2, data_size) {
            Ok(mapping) => mapping,
            Err(status) => {
                self.engine.stats_mut().account_invalid(kind);
                return Some(status);
            }
        };
        debug_assert_eq!(mapping.total_len(), data_size);

        let token = aio_token(sqid, slot);
        if is_write {
            let mut data = vec![0u8; data_size as usize];
            self.copy_from_mapping(mem, &mapping, &mut data);
            let req = self.sq[sqid as usize].as_mut().unwrap().slot_mut(slot);
            req.aio_token = Some(token);
            self.engine.submit(
                token,
                AioOp::Write {
                    offset: data_offset,
                    data,
                },
            );
        } else {
            let req = self.sq[sqid as usize].as_mut().unwrap().slot_mut(slot);
            req.aio_token = Some(token);
            req.is_read = true;
            req.mapping = Some(mapping);
            self.engine.submit(
                token,
                AioOp::Read {
                    offset: data_offset,
                    len: data_size as usize,
                },
            );
        }
        None
    }

    fn nvm_dsm(&mut self, mem: &mut dyn MemoryBus, cmd: &Command) -> u16 {
        let data_shift = self.namespace.id_ns.lba_shift;
        let nsze = self.namespace.id_ns.nsze;
        let nr = (cmd.cdw10 & 0xff) as usize + 1;
        let attr = DsmAttributes::from_bits_truncate(cmd.cdw11 & 0x7);
        debug_assert!(nr <= NVME_NUM_MAX_DSM_RANGES);

        let mut ranges = vec![0u8; nr * DSM_RANGE_LEN];
        let status = self.dma_write_prp(mem, &mut ranges, cmd.prp1, cmd.prp2);
        if status != NVME_SUCCESS {
            return status;
        }

        for range in ranges.chunks_exact(DSM_RANGE_LEN) {
            let nlb = u32::from_le_bytes(range[4..8].try_into().unwrap()) as u64;
            let slba = u64::from_le_bytes(range[8..16].try_into().unwrap());

            if out_of_range(slba, nlb, nsze) {
                tracing::warn!(target: "nvme", slba, nlb, nsze, "DSM range out of bounds");
                return NVME_LBA_RANGE | NVME_DNR;
            }

            // IDR/IDW are accepted as hints and ignored.
            if attr.contains(DsmAttributes::AD) {
                if let Err(err) =
                    self.engine
                        .pwrite_zeroes(slba << data_shift, nlb << data_shift, true)
                {
                    tracing::warn!(target: "nvme", %err, "DSM deallocate failed");
                    return NVME_INTERNAL_DEV_ERROR;
                }
            }
        }
        NVME_SUCCESS
    }
}

fn out_of_range(slba: u64, nlb: u64, nsze: u64) -> bool {
    slba.checked_add(nlb).map_or(true, |end| end > nsze)
}
