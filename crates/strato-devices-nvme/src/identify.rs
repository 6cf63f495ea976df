//! Identify data structures (controller and namespace), encoded on demand
//! into their 4096-byte wire form.

/// PCI identity the controller reports in Identify; chosen to match the
/// de-facto QEMU NVMe device so guest driver quirk tables apply.
pub const IDENTIFY_VID: u16 = 0x8086;
pub const IDENTIFY_SSVID: u16 = 0x8086;
pub const MODEL_NUMBER: &str = "QEMU NVMe Ctrl";
pub const FIRMWARE_REV: &str = "1.0";

fn put_padded(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..].fill(b' ');
}

// ONCS bits.
pub const ONCS_WRITE_ZEROES: u16 = 1 << 3;
pub const ONCS_DSM: u16 = 1 << 2;
pub const ONCS_TIMESTAMP: u16 = 1 << 6;

// LPA bits.
pub const LPA_CMD_EFFECTS: u8 = 1 << 1;
pub const LPA_TELEMETRY: u8 = 1 << 3;

#[derive(Debug, Clone)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub serial: String,
    pub model: String,
    pub firmware_rev: String,
    pub rab: u8,
    pub ieee: [u8; 3],
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    pub wctemp: u16,
    pub cctemp: u16,
    pub sqes: u8,
    pub cqes: u8,
    pub nn: u32,
    pub oncs: u16,
    pub vwc: u8,
    /// Power state 0 descriptor: max power, entry latency, exit latency.
    pub psd0: (u16, u32, u32),
}

impl IdentifyController {
    pub fn new(serial: &str, write_cache: bool, num_namespaces: u32, error_log_entries: u8) -> Self {
        Self {
            vid: IDENTIFY_VID,
            ssvid: IDENTIFY_SSVID,
            serial: serial.to_owned(),
            model: MODEL_NUMBER.to_owned(),
            firmware_rev: FIRMWARE_REV.to_owned(),
            rab: 6,
            ieee: [0x00, 0x02, 0xb3],
            ver: 0x0001_0300,
            rtd3r: 1000,
            rtd3e: 1000,
            // Reset to activate, seven slots, slot 1 read/write.
            frmw: 7 << 1,
            lpa: LPA_CMD_EFFECTS | LPA_TELEMETRY,
            elpe: error_log_entries - 1,
            wctemp: 363,
            cctemp: 373,
            sqes: (0x6 << 4) | 0x6,
            cqes: (0x4 << 4) | 0x4,
            nn: num_namespaces,
            oncs: ONCS_WRITE_ZEROES | ONCS_TIMESTAMP | ONCS_DSM,
            vwc: write_cache as u8,
            psd0: (0x9c4, 0x10, 0x4),
        }
    }

    /// Minimum/maximum I/O SQ entry size exponents advertised via SQES.
    pub fn sqes_range(&self) -> (u8, u8) {
        (self.sqes & 0xf, self.sqes >> 4)
    }

    pub fn cqes_range(&self) -> (u8, u8) {
        (self.cqes & 0xf, self.cqes >> 4)
    }

    pub fn encode(&self) -> [u8; 4096] {
        let mut b = [0u8; 4096];
        b[0..2].copy_from_slice(&self.vid.to_le_bytes());
        b[2..4].copy_from_slice(&self.ssvid.to_le_bytes());
        put_padded(&mut b[4..24], &self.serial);
        put_padded(&mut b[24..64], &self.model);
        put_padded(&mut b[64..72], &self.firmware_rev);
        b[72] = self.rab;
        b[73..76].copy_from_slice(&self.ieee);
        // cmic, mdts, cntlid stay zero.
        b[80..84].copy_from_slice(&self.ver.to_le_bytes());
        b[84..88].copy_from_slice(&self.rtd3r.to_le_bytes());
        b[88..92].copy_from_slice(&self.rtd3e.to_le_bytes());
        b[260] = self.frmw;
        b[261] = self.lpa;
        b[262] = self.elpe;
        b[266..268].copy_from_slice(&self.wctemp.to_le_bytes());
        b[268..270].copy_from_slice(&self.cctemp.to_le_bytes());
        b[512] = self.sqes;
        b[513] = self.cqes;
        b[516..520].copy_from_slice(&self.nn.to_le_bytes());
        b[520..522].copy_from_slice(&self.oncs.to_le_bytes());
        b[525] = self.vwc;
        let (mp, enlat, exlat) = self.psd0;
        b[2048..2050].copy_from_slice(&mp.to_le_bytes());
        b[2052..2056].copy_from_slice(&enlat.to_le_bytes());
        b[2056..2060].copy_from_slice(&exlat.to_le_bytes());
        b
    }
}

#[derive(Debug, Clone)]
pub struct IdentifyNamespace {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    /// Data-size exponent of the only supported LBA format.
    pub lba_shift: u8,
}

impl IdentifyNamespace {
    pub fn new(blocks: u64, lba_shift: u8) -> Self {
        Self {
            nsze: blocks,
            ncap: blocks,
            nuse: blocks,
            lba_shift,
        }
    }

    pub fn encode(&self) -> [u8; 4096] {
        let mut b = [0u8; 4096];
        b[0..8].copy_from_slice(&self.nsze.to_le_bytes());
        b[8..16].copy_from_slice(&self.ncap.to_le_bytes());
        b[16..24].copy_from_slice(&self.nuse.to_le_bytes());
        // nsfeat, nlbaf, flbas, mc, dpc, dps stay zero; LBA format 0 only.
        b[130] = self.lba_shift;
        b
    }
}
