//! Simulated DFU device for engine tests

use std::collections::VecDeque;

use super::DfuTransport;
use crate::{
    DfuState, DfuStatus, DfuStatusCode, TransportError,
    connection::{
        DFU_ABORT, DFU_CLRSTATUS, DFU_DETACH, DFU_DNLOAD, DFU_GETSTATE,
        DFU_GETSTATUS, DFU_UPLOAD,
    },
};

/// Request seen by the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Detach { timeout: u16 },
    Dnload { block: u16, data: Vec<u8> },
    Upload { block: u16, length: u16 },
    GetStatus,
    ClrStatus,
    GetState,
    Abort,
    Reset,
    SetAltSetting(u8),
}

/// What the device does once it has received the final zero length block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManifestBehavior {
    /// Back to `dfuIDLE`
    Idle,
    /// Stays in `dfuMANIFEST-WAIT-RESET`
    WaitReset,
    /// Drops off the bus
    Disconnect,
}

pub(crate) struct MockTransport {
    pub log: Vec<Request>,
    pub state: DfuState,
    status: DfuStatusCode,
    /// `dfuDNBUSY` responses after each download request
    pub busy_polls: u32,
    pub poll_timeout: u32,
    pub manifest: ManifestBehavior,
    /// Interpret block 0 downloads as DfuSe commands
    pub dfuse: bool,
    pub address: u32,
    pub erased: Vec<u32>,
    pub mass_erased: bool,
    pub unprotected: bool,
    /// DfuSe data writes as (address, data)
    pub written: Vec<(u32, Vec<u8>)>,
    /// Plain DFU download data
    pub downloaded: Vec<u8>,
    /// Device memory served by uploads
    pub upload_data: Vec<u8>,
    pub upload_base: u32,
    upload_offset: usize,
    /// Responses returned by GETSTATUS before the simulation takes over
    pub status_queue: VecDeque<Result<DfuStatus, TransportError>>,
    fail_next_download: Option<DfuStatusCode>,
    pending_busy: u32,
    manifest_polls: u32,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            log: Vec::new(),
            state: DfuState::DfuIdle,
            status: DfuStatusCode::Ok,
            busy_polls: 1,
            poll_timeout: 10,
            manifest: ManifestBehavior::Idle,
            dfuse: false,
            address: 0,
            erased: Vec::new(),
            mass_erased: false,
            unprotected: false,
            written: Vec::new(),
            downloaded: Vec::new(),
            upload_data: Vec::new(),
            upload_base: 0,
            upload_offset: 0,
            status_queue: VecDeque::new(),
            fail_next_download: None,
            pending_busy: 0,
            manifest_polls: 0,
        }
    }

    pub fn dfuse() -> Self {
        MockTransport {
            dfuse: true,
            ..MockTransport::new()
        }
    }

    pub fn in_state(mut self, state: DfuState) -> Self {
        self.state = state;
        self
    }

    pub fn fail_next_download(&mut self, status: DfuStatusCode) {
        self.fail_next_download = Some(status);
    }

    pub fn requests(&self, pred: impl Fn(&Request) -> bool) -> Vec<&Request> {
        self.log.iter().filter(|r| pred(r)).collect()
    }

    /// Data blocks, DfuSe commands excluded
    pub fn data_blocks(&self) -> Vec<(u16, usize)> {
        self.log
            .iter()
            .filter_map(|r| match r {
                Request::Dnload { block, data } if !(self.dfuse && *block == 0) => {
                    Some((*block, data.len()))
                }
                _ => None,
            })
            .collect()
    }

    /// DfuSe commands, as raw payloads
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.log
            .iter()
            .filter_map(|r| match r {
                Request::Dnload { block: 0, data } if self.dfuse => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn stall(&mut self) -> TransportError {
        self.state = DfuState::DfuError;
        self.status = DfuStatusCode::ErrStalledPkt;
        TransportError::Stall
    }

    fn dnload(&mut self, block: u16, data: &[u8]) -> Result<usize, TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuDnloadIdle) {
            return Err(self.stall());
        }

        if data.is_empty() {
            self.state = DfuState::DfuManifestSync;
            self.manifest_polls = 0;
            return Ok(0);
        }

        if self.dfuse && block == 0 {
            match data {
                [0x21, a @ ..] if a.len() == 4 => {
                    self.address = u32::from_le_bytes([a[0], a[1], a[2], a[3]]);
                }
                [0x41, a @ ..] if a.len() == 4 => {
                    self.erased.push(u32::from_le_bytes([a[0], a[1], a[2], a[3]]));
                }
                [0x41] => self.mass_erased = true,
                [0x92] => self.unprotected = true,
                _ => return Err(self.stall()),
            }
        } else if self.dfuse {
            let offset = (block as u32 - 2) * data.len() as u32;
            self.written.push((self.address + offset, data.to_vec()));
        } else {
            self.downloaded.extend_from_slice(data);
        }

        self.state = DfuState::DfuDnloadSync;
        self.pending_busy = self.busy_polls;
        Ok(data.len())
    }

    fn upload(&mut self, block: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuUploadIdle) {
            return Err(self.stall());
        }
        let start = if self.dfuse {
            if block < 2 {
                return Err(self.stall());
            }
            (self.address - self.upload_base) as usize
                + (block as usize - 2) * length as usize
        } else {
            self.upload_offset
        };
        let start = start.min(self.upload_data.len());
        let end = (start + length as usize).min(self.upload_data.len());
        self.upload_offset = end;

        self.state = if end - start < length as usize {
            DfuState::DfuIdle
        } else {
            DfuState::DfuUploadIdle
        };
        Ok(self.upload_data[start..end].to_vec())
    }

    fn status(&mut self) -> Result<DfuStatus, TransportError> {
        if let Some(queued) = self.status_queue.pop_front() {
            if let Ok(st) = &queued {
                self.state = st.state;
            }
            return queued;
        }

        let reported = match self.state {
            DfuState::DfuDnloadSync | DfuState::DfuDnbusy => {
                if self.pending_busy > 0 {
                    self.pending_busy -= 1;
                    self.state = DfuState::DfuDnbusy;
                } else if let Some(code) = self.fail_next_download.take() {
                    self.state = DfuState::DfuError;
                    self.status = code;
                } else {
                    self.state = DfuState::DfuDnloadIdle;
                }
                self.state
            }
            DfuState::DfuManifestSync | DfuState::DfuManifest => {
                self.manifest_polls += 1;
                match (self.manifest_polls, self.manifest) {
                    (1, _) => {
                        self.state = DfuState::DfuManifest;
                        DfuState::DfuManifestSync
                    }
                    (_, ManifestBehavior::Idle) => {
                        self.state = DfuState::DfuIdle;
                        self.state
                    }
                    (_, ManifestBehavior::WaitReset) => {
                        self.state = DfuState::DfuManifestWaitReset;
                        self.state
                    }
                    (_, ManifestBehavior::Disconnect) => {
                        return Err(TransportError::Disconnected);
                    }
                }
            }
            state => state,
        };

        let busy = matches!(reported, DfuState::DfuDnbusy | DfuState::DfuManifestSync);
        Ok(DfuStatus::new(
            self.status,
            if busy { self.poll_timeout } else { 0 },
            reported,
        ))
    }
}

impl DfuTransport for MockTransport {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        match request {
            DFU_DETACH => {
                self.log.push(Request::Detach { timeout: value });
                if !self.state.is_runtime() {
                    return Err(self.stall());
                }
                self.state = DfuState::AppDetach;
                Ok(0)
            }
            DFU_DNLOAD => {
                self.log.push(Request::Dnload {
                    block: value,
                    data: data.to_vec(),
                });
                self.dnload(value, data)
            }
            DFU_CLRSTATUS => {
                self.log.push(Request::ClrStatus);
                if self.state == DfuState::DfuError {
                    self.state = DfuState::DfuIdle;
                    self.status = DfuStatusCode::Ok;
                }
                Ok(0)
            }
            DFU_ABORT => {
                self.log.push(Request::Abort);
                if self.state == DfuState::DfuError || self.state.is_runtime() {
                    return Err(self.stall());
                }
                self.state = DfuState::DfuIdle;
                Ok(0)
            }
            other => panic!("unexpected OUT request {other}"),
        }
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        match request {
            DFU_UPLOAD => {
                self.log.push(Request::Upload {
                    block: value,
                    length,
                });
                self.upload(value, length)
            }
            DFU_GETSTATUS => {
                self.log.push(Request::GetStatus);
                Ok(self.status()?.to_raw().to_vec())
            }
            DFU_GETSTATE => {
                self.log.push(Request::GetState);
                Ok(vec![self.state as u8])
            }
            other => panic!("unexpected IN request {other}"),
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.log.push(Request::Reset);
        self.state = match self.state {
            DfuState::AppDetach => DfuState::DfuIdle,
            DfuState::DfuManifestWaitReset => DfuState::AppIdle,
            state => state,
        };
        Ok(())
    }

    fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), TransportError> {
        self.log.push(Request::SetAltSetting(alt_setting));
        Ok(())
    }
}
