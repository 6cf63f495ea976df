//! Controller register image, field accessors and wire constants.
//!
//! The register window follows NVM Express 1.2: 0x40 bytes of controller
//! registers, then doorbells from [`DOORBELL_BASE`] with a stride-8 pair per
//! queue (SQ tail, then CQ head).

pub const NVME_REG_CAP: u64 = 0x00;
pub const NVME_REG_VS: u64 = 0x08;
pub const NVME_REG_INTMS: u64 = 0x0c;
pub const NVME_REG_INTMC: u64 = 0x10;
pub const NVME_REG_CC: u64 = 0x14;
pub const NVME_REG_CSTS: u64 = 0x1c;
pub const NVME_REG_NSSR: u64 = 0x20;
pub const NVME_REG_AQA: u64 = 0x24;
pub const NVME_REG_ASQ: u64 = 0x28;
pub const NVME_REG_ASQ_HI: u64 = 0x2c;
pub const NVME_REG_ACQ: u64 = 0x30;
pub const NVME_REG_ACQ_HI: u64 = 0x34;
pub const NVME_REG_CMBLOC: u64 = 0x38;
pub const NVME_REG_CMBSZ: u64 = 0x3c;

/// Size of the serialised register image.
pub const REG_IMAGE_LEN: u64 = 0x40;

pub const DOORBELL_BASE: u64 = 0x1000;
pub const DOORBELL_STRIDE: u64 = 8;

/// Magic value recognised (and rejected as unsupported) by the NSSR register.
pub const NSSR_MAGIC: u32 = 0x4E56_4D65; // "NVMe"

// CSTS bits.
pub const CSTS_READY: u32 = 1 << 0;
pub const CSTS_FAILED: u32 = 1 << 1;
pub const CSTS_SHST_COMPLETE: u32 = 2 << 2;
pub const CSTS_NSSRO: u32 = 1 << 4;

/// Flat controller register file. Reads serialise this image little-endian.
#[derive(Debug, Default, Clone)]
pub struct Bar {
    pub cap: u64,
    pub vs: u32,
    pub intms: u32,
    pub intmc: u32,
    pub cc: u32,
    pub csts: u32,
    pub nssr: u32,
    pub aqa: u32,
    pub asq: u64,
    pub acq: u64,
    pub cmbloc: u32,
    pub cmbsz: u32,
}

impl Bar {
    pub fn image(&self) -> [u8; REG_IMAGE_LEN as usize] {
        let mut img = [0u8; REG_IMAGE_LEN as usize];
        img[0x00..0x08].copy_from_slice(&self.cap.to_le_bytes());
        img[0x08..0x0c].copy_from_slice(&self.vs.to_le_bytes());
        img[0x0c..0x10].copy_from_slice(&self.intms.to_le_bytes());
        img[0x10..0x14].copy_from_slice(&self.intmc.to_le_bytes());
        img[0x14..0x18].copy_from_slice(&self.cc.to_le_bytes());
        img[0x1c..0x20].copy_from_slice(&self.csts.to_le_bytes());
        img[0x20..0x24].copy_from_slice(&self.nssr.to_le_bytes());
        img[0x24..0x28].copy_from_slice(&self.aqa.to_le_bytes());
        img[0x28..0x30].copy_from_slice(&self.asq.to_le_bytes());
        img[0x30..0x38].copy_from_slice(&self.acq.to_le_bytes());
        img[0x38..0x3c].copy_from_slice(&self.cmbloc.to_le_bytes());
        img[0x3c..0x40].copy_from_slice(&self.cmbsz.to_le_bytes());
        img
    }
}

// CAP field encoding.
pub mod cap {
    pub fn set_mqes(cap: &mut u64, mqes: u16) {
        *cap |= mqes as u64;
    }

    pub fn set_cqr(cap: &mut u64, cqr: bool) {
        *cap |= (cqr as u64) << 16;
    }

    pub fn set_to(cap: &mut u64, to: u8) {
        *cap |= (to as u64) << 24;
    }

    pub fn set_css_nvm(cap: &mut u64) {
        *cap |= 1 << 37;
    }

    pub fn set_mpsmin(cap: &mut u64, mps: u8) {
        *cap |= ((mps & 0xf) as u64) << 48;
    }

    pub fn set_mpsmax(cap: &mut u64, mps: u8) {
        *cap |= ((mps & 0xf) as u64) << 52;
    }

    pub fn mqes(cap: u64) -> u16 {
        (cap & 0xffff) as u16
    }

    pub fn mpsmin(cap: u64) -> u8 {
        ((cap >> 48) & 0xf) as u8
    }

    pub fn mpsmax(cap: u64) -> u8 {
        ((cap >> 52) & 0xf) as u8
    }
}

// CC field decoding.
pub mod cc {
    pub fn en(cc: u32) -> bool {
        cc & 1 != 0
    }

    pub fn mps(cc: u32) -> u8 {
        ((cc >> 7) & 0xf) as u8
    }

    pub fn shn(cc: u32) -> u8 {
        ((cc >> 14) & 0x3) as u8
    }

    pub fn iosqes(cc: u32) -> u8 {
        ((cc >> 16) & 0xf) as u8
    }

    pub fn iocqes(cc: u32) -> u8 {
        ((cc >> 20) & 0xf) as u8
    }
}

// AQA field decoding (sizes are zero-based).
pub mod aqa {
    pub fn asqs(aqa: u32) -> u32 {
        aqa & 0xfff
    }

    pub fn acqs(aqa: u32) -> u32 {
        (aqa >> 16) & 0xfff
    }
}

// CMBLOC / CMBSZ encoding.
pub mod cmb {
    pub fn loc(bir: u8) -> u32 {
        (bir & 0x7) as u32
    }

    /// SQS+RDS+WDS, size unit = MiB.
    pub fn sz(size_mb: u32) -> u32 {
        const SQS: u32 = 1 << 0;
        const RDS: u32 = 1 << 3;
        const WDS: u32 = 1 << 4;
        const SZU_MB: u32 = 2 << 8;
        SQS | RDS | WDS | SZU_MB | (size_mb << 12)
    }
}

// Completion status codes; the CQE status halfword is `(code << 1) | phase`.
pub const NVME_SUCCESS: u16 = 0x0000;
pub const NVME_INVALID_OPCODE: u16 = 0x0001;
pub const NVME_INVALID_FIELD: u16 = 0x0002;
pub const NVME_INTERNAL_DEV_ERROR: u16 = 0x0006;
pub const NVME_INVALID_NSID: u16 = 0x000b;
pub const NVME_LBA_RANGE: u16 = 0x0080;
pub const NVME_INVALID_CQID: u16 = 0x0100;
pub const NVME_INVALID_QID: u16 = 0x0101;
pub const NVME_MAX_QSIZE_EXCEEDED: u16 = 0x0102;
pub const NVME_INVALID_IRQ_VECTOR: u16 = 0x0108;
pub const NVME_INVALID_LOG_ID: u16 = 0x0109;
pub const NVME_INVALID_QUEUE_DEL: u16 = 0x010c;
pub const NVME_DNR: u16 = 0x4000;

// Admin opcodes.
pub const ADM_CMD_DELETE_SQ: u8 = 0x00;
pub const ADM_CMD_CREATE_SQ: u8 = 0x01;
pub const ADM_CMD_GET_LOG_PAGE: u8 = 0x02;
pub const ADM_CMD_DELETE_CQ: u8 = 0x04;
pub const ADM_CMD_CREATE_CQ: u8 = 0x05;
pub const ADM_CMD_IDENTIFY: u8 = 0x06;
pub const ADM_CMD_SET_FEATURES: u8 = 0x09;
pub const ADM_CMD_GET_FEATURES: u8 = 0x0a;

// NVM (I/O) opcodes.
pub const NVM_CMD_FLUSH: u8 = 0x00;
pub const NVM_CMD_WRITE: u8 = 0x01;
pub const NVM_CMD_READ: u8 = 0x02;
pub const NVM_CMD_WRITE_ZEROES: u8 = 0x08;
pub const NVM_CMD_DSM: u8 = 0x09;

// Feature identifiers.
pub const FEAT_VOLATILE_WRITE_CACHE: u32 = 0x06;
pub const FEAT_NUMBER_OF_QUEUES: u32 = 0x07;
pub const FEAT_TIMESTAMP: u32 = 0x0e;

// Log page identifiers.
pub const LOG_ERROR_INFO: u8 = 0x01;
pub const LOG_SMART_INFO: u8 = 0x02;
pub const LOG_FW_SLOT_INFO: u8 = 0x03;
pub const LOG_CMD_EFFECTS: u8 = 0x05;
pub const LOG_TELEMETRY_HOST: u8 = 0x07;
pub const LOG_TELEMETRY_CTRL: u8 = 0x08;

/// A parsed 64-byte submission queue entry.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub opcode: u8,
    pub cid: u16,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Command {
    pub fn parse(raw: &[u8; 64]) -> Self {
        let dw = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            opcode: raw[0],
            cid: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
            nsid: dw(1),
            prp1: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
            prp2: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            cdw10: dw(10),
            cdw11: dw(11),
            cdw12: dw(12),
            cdw13: dw(13),
            cdw14: dw(14),
            cdw15: dw(15),
        }
    }
}
