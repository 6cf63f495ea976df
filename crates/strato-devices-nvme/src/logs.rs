//! Log page state: SMART/Health (with shutdown persistence), error
//! information, firmware slots, command effects and telemetry.

use std::path::Path;

use crate::regs::{
    ADM_CMD_CREATE_CQ, ADM_CMD_CREATE_SQ, ADM_CMD_DELETE_CQ, ADM_CMD_DELETE_SQ,
    ADM_CMD_GET_FEATURES, ADM_CMD_GET_LOG_PAGE, ADM_CMD_IDENTIFY, ADM_CMD_SET_FEATURES,
    NVM_CMD_DSM, NVM_CMD_FLUSH, NVM_CMD_READ, NVM_CMD_WRITE, NVM_CMD_WRITE_ZEROES,
};

pub const NUM_ERROR_LOG: usize = 1;
pub const SMART_LOG_LEN: usize = 512;
pub const ERROR_LOG_ENTRY_LEN: usize = 64;
pub const FW_SLOT_LOG_LEN: usize = 512;
pub const CMD_EFFECTS_LOG_LEN: usize = 4096;
pub const TELEMETRY_HEADER_LEN: usize = 512;

/// SMART / Health Information (log page 02h), 512 bytes on the wire.
/// The counter fields are 16-byte integers on the wire, held as `u128`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmartLog {
    pub critical_warning: u8,
    pub temperature: u16,
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    pub data_units_read: u128,
    pub data_units_written: u128,
    pub host_read_commands: u128,
    pub host_write_commands: u128,
    pub controller_busy_time: u128,
    pub power_cycles: u128,
    pub power_on_hours: u128,
    pub unsafe_shutdowns: u128,
    pub media_errors: u128,
    pub number_of_error_log_entries: u128,
    pub warning_temp_time: u32,
    pub critical_temp_time: u32,
    pub temperature_sensor: [u16; 8],
}

impl SmartLog {
    /// Values reported by a freshly realized controller; persistent counters
    /// come from [`SmartLog::load`].
    pub fn install_fixed_fields(&mut self) {
        self.temperature = 273 + 30;
        self.available_spare = 100;
        self.available_spare_threshold = 10;
        self.temperature_sensor[0] = 273 + 30;
    }

    pub fn increment_power_cycles(&mut self) {
        self.power_cycles = self.power_cycles.wrapping_add(1);
    }

    pub fn encode(&self) -> [u8; SMART_LOG_LEN] {
        let mut b = [0u8; SMART_LOG_LEN];
        b[0] = self.critical_warning;
        b[1..3].copy_from_slice(&self.temperature.to_le_bytes());
        b[3] = self.available_spare;
        b[4] = self.available_spare_threshold;
        b[5] = self.percentage_used;
        b[32..48].copy_from_slice(&self.data_units_read.to_le_bytes());
        b[48..64].copy_from_slice(&self.data_units_written.to_le_bytes());
        b[64..80].copy_from_slice(&self.host_read_commands.to_le_bytes());
        b[80..96].copy_from_slice(&self.host_write_commands.to_le_bytes());
        b[96..112].copy_from_slice(&self.controller_busy_time.to_le_bytes());
        b[112..128].copy_from_slice(&self.power_cycles.to_le_bytes());
        b[128..144].copy_from_slice(&self.power_on_hours.to_le_bytes());
        b[144..160].copy_from_slice(&self.unsafe_shutdowns.to_le_bytes());
        b[160..176].copy_from_slice(&self.media_errors.to_le_bytes());
        b[176..192].copy_from_slice(&self.number_of_error_log_entries.to_le_bytes());
        b[192..196].copy_from_slice(&self.warning_temp_time.to_le_bytes());
        b[196..200].copy_from_slice(&self.critical_temp_time.to_le_bytes());
        for (i, t) in self.temperature_sensor.iter().enumerate() {
            b[200 + i * 2..202 + i * 2].copy_from_slice(&t.to_le_bytes());
        }
        b
    }

    pub fn decode(b: &[u8; SMART_LOG_LEN]) -> Self {
        let u128_at = |o: usize| u128::from_le_bytes(b[o..o + 16].try_into().unwrap());
        let mut temperature_sensor = [0u16; 8];
        for (i, t) in temperature_sensor.iter_mut().enumerate() {
            *t = u16::from_le_bytes(b[200 + i * 2..202 + i * 2].try_into().unwrap());
        }
        Self {
            critical_warning: b[0],
            temperature: u16::from_le_bytes(b[1..3].try_into().unwrap()),
            available_spare: b[3],
            available_spare_threshold: b[4],
            percentage_used: b[5],
            data_units_read: u128_at(32),
            data_units_written: u128_at(48),
            host_read_commands: u128_at(64),
            host_write_commands: u128_at(80),
            controller_busy_time: u128_at(96),
            power_cycles: u128_at(112),
            power_on_hours: u128_at(128),
            unsafe_shutdowns: u128_at(144),
            media_errors: u128_at(160),
            number_of_error_log_entries: u128_at(176),
            warning_temp_time: u32::from_le_bytes(b[192..196].try_into().unwrap()),
            critical_temp_time: u32::from_le_bytes(b[196..200].try_into().unwrap()),
            temperature_sensor,
        }
    }

    /// Load the persisted image; a missing or short file yields a zeroed log.
    /// Failures are logged and non-fatal.
    pub fn load(path: &Path) -> Self {
        let mut image = [0u8; SMART_LOG_LEN];
        match std::fs::read(path) {
            Ok(bytes) => {
                if bytes.len() != SMART_LOG_LEN {
                    tracing::error!(
                        target: "nvme",
                        path = %path.display(),
                        len = bytes.len(),
                        "short SMART log file"
                    );
                }
                let n = bytes.len().min(SMART_LOG_LEN);
                image[..n].copy_from_slice(&bytes[..n]);
            }
            Err(err) => {
                tracing::error!(target: "nvme", path = %path.display(), %err, "failed to read SMART log file");
            }
        }
        Self::decode(&image)
    }

    pub fn save(&self, path: &Path) {
        if let Err(err) = std::fs::write(path, self.encode()) {
            tracing::error!(target: "nvme", path = %path.display(), %err, "failed to write SMART log file");
        }
    }
}

/// Error Information log entry (log page 01h), 64 bytes on the wire.
#[derive(Debug, Clone)]
pub struct ErrorLogEntry {
    pub error_count: u64,
    pub sqid: u16,
    pub cid: u16,
    pub status_field: u16,
    pub param_error_location: u16,
    pub lba: u64,
    pub nsid: u32,
    pub vs: u8,
    pub cmd_specific_info: u64,
}

impl ErrorLogEntry {
    /// An unused entry: sqid/cid all-ones, everything else zero.
    pub fn unused() -> Self {
        Self {
            error_count: 0,
            sqid: 0xffff,
            cid: 0xffff,
            status_field: 0,
            param_error_location: 0,
            lba: 0,
            nsid: 0,
            vs: 0,
            cmd_specific_info: 0,
        }
    }

    pub fn encode(&self) -> [u8; ERROR_LOG_ENTRY_LEN] {
        let mut b = [0u8; ERROR_LOG_ENTRY_LEN];
        b[0..8].copy_from_slice(&self.error_count.to_le_bytes());
        b[8..10].copy_from_slice(&self.sqid.to_le_bytes());
        b[10..12].copy_from_slice(&self.cid.to_le_bytes());
        b[12..14].copy_from_slice(&self.status_field.to_le_bytes());
        b[14..16].copy_from_slice(&self.param_error_location.to_le_bytes());
        b[16..24].copy_from_slice(&self.lba.to_le_bytes());
        b[24..28].copy_from_slice(&self.nsid.to_le_bytes());
        b[28] = self.vs;
        b[32..40].copy_from_slice(&self.cmd_specific_info.to_le_bytes());
        b
    }
}

pub fn encode_error_log(entries: &[ErrorLogEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ERROR_LOG_ENTRY_LEN);
    for e in entries {
        out.extend_from_slice(&e.encode());
    }
    out
}

/// Firmware Slot Information (log page 03h): slot 1 active, revision "1.0".
pub fn firmware_slot_log(revision: &str) -> [u8; FW_SLOT_LOG_LEN] {
    let mut b = [0u8; FW_SLOT_LOG_LEN];
    b[0] = 1; // AFI: firmware in slot 1 is running
    let frs1 = &mut b[8..16];
    let bytes = revision.as_bytes();
    let n = bytes.len().min(8);
    frs1[..n].copy_from_slice(&bytes[..n]);
    frs1[n..].fill(b' ');
    b
}

// Command effects dwords.
const CED_CSUPP: u32 = 1 << 0;
const CED_LBCC: u32 = 1 << 1;

/// Commands Supported and Effects (log page 05h): 256 admin dwords, then
/// 256 I/O dwords, zero-padded to the 4 KiB page.
pub fn command_effects_log() -> [u8; CMD_EFFECTS_LOG_LEN] {
    let mut admin = [0u32; 256];
    for opc in [
        ADM_CMD_DELETE_SQ,
        ADM_CMD_CREATE_SQ,
        ADM_CMD_GET_LOG_PAGE,
        ADM_CMD_DELETE_CQ,
        ADM_CMD_CREATE_CQ,
        ADM_CMD_IDENTIFY,
        ADM_CMD_SET_FEATURES,
        ADM_CMD_GET_FEATURES,
    ] {
        admin[opc as usize] = CED_CSUPP;
    }

    let mut io = [0u32; 256];
    io[NVM_CMD_FLUSH as usize] = CED_CSUPP;
    io[NVM_CMD_WRITE as usize] = CED_CSUPP | CED_LBCC;
    io[NVM_CMD_READ as usize] = CED_CSUPP;
    io[NVM_CMD_WRITE_ZEROES as usize] = CED_CSUPP | CED_LBCC;
    io[NVM_CMD_DSM as usize] = CED_CSUPP | CED_LBCC;

    let mut b = [0u8; CMD_EFFECTS_LOG_LEN];
    for (i, dw) in admin.iter().enumerate() {
        b[i * 4..i * 4 + 4].copy_from_slice(&dw.to_le_bytes());
    }
    for (i, dw) in io.iter().enumerate() {
        b[1024 + i * 4..1024 + i * 4 + 4].copy_from_slice(&dw.to_le_bytes());
    }
    b
}

/// Telemetry log header (pages 07h/08h), all-zero apart from the log id.
pub fn telemetry_log_header(log_id: u8) -> [u8; TELEMETRY_HEADER_LEN] {
    let mut b = [0u8; TELEMETRY_HEADER_LEN];
    b[0] = log_id;
    b
}

/// The vendor block returned when the "create telemetry data" bit is set.
///
/// Windows requests this layout through
/// IOCTL_STORAGE_GET_DEVICE_INTERNAL_LOG; of the T10VendorId placements
/// tried against its validator, only this exact value passes. Do not
/// rearrange.
pub fn telemetry_internal_status_block() -> [u8; TELEMETRY_HEADER_LEN] {
    let mut b = [0u8; TELEMETRY_HEADER_LEN];
    b[8..16].copy_from_slice(&0x0000_0001_0000_0000u64.to_le_bytes());
    b
}
