use std::fmt;

use crate::DfuError;

pub(crate) const DFU_STATUS_LEN: u16 = 6;

/// Device state (`bState`), DFU 1.1 section 6.1.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnbusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
}

impl DfuState {
    pub const ALL: [DfuState; 11] = [
        DfuState::AppIdle,
        DfuState::AppDetach,
        DfuState::DfuIdle,
        DfuState::DfuDnloadSync,
        DfuState::DfuDnbusy,
        DfuState::DfuDnloadIdle,
        DfuState::DfuManifestSync,
        DfuState::DfuManifest,
        DfuState::DfuManifestWaitReset,
        DfuState::DfuUploadIdle,
        DfuState::DfuError,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Name as used in the DFU specification
    pub fn name(&self) -> &'static str {
        match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DfuDnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DfuDnbusy => "dfuDNBUSY",
            DfuState::DfuDnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::DfuManifestSync => "dfuMANIFEST-SYNC",
            DfuState::DfuManifest => "dfuMANIFEST",
            DfuState::DfuManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::DfuUploadIdle => "dfuUPLOAD-IDLE",
            DfuState::DfuError => "dfuERROR",
        }
    }

    /// Device is running its application firmware
    pub fn is_runtime(&self) -> bool {
        matches!(self, DfuState::AppIdle | DfuState::AppDetach)
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of the last request (`bStatus`), DFU 1.1 section 6.1.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DfuStatusCode {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0a,
    ErrVendor = 0x0b,
    ErrUsbr = 0x0c,
    ErrPor = 0x0d,
    ErrUnknown = 0x0e,
    ErrStalledPkt = 0x0f,
}

impl DfuStatusCode {
    /// Codes outside the defined range decode to [DfuStatusCode::ErrUnknown].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DfuStatusCode::Ok,
            0x01 => DfuStatusCode::ErrTarget,
            0x02 => DfuStatusCode::ErrFile,
            0x03 => DfuStatusCode::ErrWrite,
            0x04 => DfuStatusCode::ErrErase,
            0x05 => DfuStatusCode::ErrCheckErased,
            0x06 => DfuStatusCode::ErrProg,
            0x07 => DfuStatusCode::ErrVerify,
            0x08 => DfuStatusCode::ErrAddress,
            0x09 => DfuStatusCode::ErrNotDone,
            0x0a => DfuStatusCode::ErrFirmware,
            0x0b => DfuStatusCode::ErrVendor,
            0x0c => DfuStatusCode::ErrUsbr,
            0x0d => DfuStatusCode::ErrPor,
            0x0f => DfuStatusCode::ErrStalledPkt,
            _ => DfuStatusCode::ErrUnknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DfuStatusCode::Ok => "No error condition is present",
            DfuStatusCode::ErrTarget => {
                "File is not targeted for use by this device"
            }
            DfuStatusCode::ErrFile => {
                "File is for this device but fails some vendor-specific test"
            }
            DfuStatusCode::ErrWrite => "Device is unable to write memory",
            DfuStatusCode::ErrErase => "Memory erase function failed",
            DfuStatusCode::ErrCheckErased => {
                "Memory erase check failed"
            }
            DfuStatusCode::ErrProg => "Program memory function failed",
            DfuStatusCode::ErrVerify => {
                "Programmed memory failed verification"
            }
            DfuStatusCode::ErrAddress => {
                "Cannot program memory due to received address that is out of range"
            }
            DfuStatusCode::ErrNotDone => {
                "Received zero-length download but data is incomplete"
            }
            DfuStatusCode::ErrFirmware => {
                "Device's firmware is corrupt. It cannot return to run-time operations"
            }
            DfuStatusCode::ErrVendor => "iString indicates a vendor specific error",
            DfuStatusCode::ErrUsbr => "Device detected unexpected USB reset signalling",
            DfuStatusCode::ErrPor => "Device detected unexpected power on reset",
            DfuStatusCode::ErrUnknown => "Something went wrong, but the device does not know what it was",
            DfuStatusCode::ErrStalledPkt => "Device stalled an unexpected request",
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Decoded `DFU_GETSTATUS` response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    /// `bwPollTimeout` in milliseconds (24 bit)
    pub poll_timeout: u32,
    pub state: DfuState,
    /// `iString`, when non-zero
    pub string_index: Option<u8>,
}

impl DfuStatus {
    pub fn new(status: DfuStatusCode, poll_timeout: u32, state: DfuState) -> Self {
        DfuStatus {
            status,
            poll_timeout: poll_timeout & 0x00ff_ffff,
            state,
            string_index: None,
        }
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::UnexpectedResponse(format!(
                "GETSTATUS returned {} bytes",
                data.len()
            )));
        }
        let state = DfuState::from_u8(data[4]).ok_or_else(|| {
            DfuError::UnexpectedResponse(format!("unknown DFU state {}", data[4]))
        })?;
        Ok(DfuStatus {
            status: DfuStatusCode::from_u8(data[0]),
            poll_timeout: (data[3] as u32) << 16
                | (data[2] as u32) << 8
                | (data[1] as u32),
            state,
            string_index: (data[5] != 0).then_some(data[5]),
        })
    }

    pub fn to_raw(&self) -> [u8; DFU_STATUS_LEN as usize] {
        [
            self.status as u8,
            self.poll_timeout as u8,
            (self.poll_timeout >> 8) as u8,
            (self.poll_timeout >> 16) as u8,
            self.state as u8,
            self.string_index.unwrap_or(0),
        ]
    }

    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::Ok
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        self.ret(())
    }

    pub fn ret<T>(&self, t: T) -> Result<T, DfuError> {
        if self.is_ok() {
            Ok(t)
        } else {
            Err(DfuError::from(self))
        }
    }
}

impl From<&DfuStatus> for DfuError {
    fn from(st: &DfuStatus) -> Self {
        DfuError::Device {
            status: st.status,
            state: st.state,
        }
    }
}

/// State the host tracks after a `DFU_GETSTATUS` response.
///
/// A non-OK status always puts the device in `dfuERROR`. An OK status never
/// does: a device reporting `dfuERROR` with an OK status is inconsistent and
/// the tracked state stays where it was.
pub fn next_state(current: DfuState, status: &DfuStatus) -> DfuState {
    if !status.is_ok() {
        return DfuState::DfuError;
    }
    if status.state == DfuState::DfuError {
        log::warn!(
            "Device reports {} with status OK, keeping {current}",
            status.state
        );
        return current;
    }
    status.state
}
