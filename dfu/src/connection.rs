use std::time::Duration;

use crate::{
    DEFAULT_TRANSFER_SIZE, DfuError, DfuState, DfuStatus, DfuStatusCode,
    DfuseCommand, TransportError,
    clock::{Clock, SystemClock},
    poll::{PollPolicy, PollStep, PollWait},
    quirks::Quirks,
    status::{DFU_STATUS_LEN, next_state},
    transport::{DfuTransport, NusbTransport},
};

pub(crate) const DFU_DETACH: u8 = 0;
pub(crate) const DFU_DNLOAD: u8 = 1;
pub(crate) const DFU_UPLOAD: u8 = 2;
pub(crate) const DFU_GETSTATUS: u8 = 3;
pub(crate) const DFU_CLRSTATUS: u8 = 4;
pub(crate) const DFU_GETSTATE: u8 = 5;
pub(crate) const DFU_ABORT: u8 = 6;

// GETSTATUS stalls tolerated while the device is busy
const MAX_STALLS: u32 = 3;
// Max packet size of a full speed control endpoint
const SHORT_CONTROL_TRANSFER_SIZE: u16 = 64;

/// How a download ended after the final zero length block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifestation {
    /// Device is back in `dfuIDLE`
    Complete,
    /// Firmware is in place but the device needs a USB reset or power
    /// cycle before it runs
    WaitReset,
}

/// DFU protocol engine bound to one claimed interface
pub struct DfuConnection<T: DfuTransport = NusbTransport> {
    transport: T,
    xfer_size: u16,
    quirks: Quirks,
    poll: PollPolicy,
    clock: Box<dyn Clock>,
    state: Option<DfuState>,
    manifestation_tolerant: bool,
    will_reset: bool,
}

impl<T: DfuTransport> DfuConnection<T> {
    pub fn new(transport: T, xfer_size: u16, quirks: Quirks) -> Self {
        let mut xfer_size = if xfer_size > 0 {
            xfer_size
        } else {
            DEFAULT_TRANSFER_SIZE
        };
        if quirks.contains(Quirks::FORCE_SHORT_CONTROL) {
            xfer_size = xfer_size.min(SHORT_CONTROL_TRANSFER_SIZE);
        }
        DfuConnection {
            transport,
            xfer_size,
            quirks,
            poll: PollPolicy::for_quirks(quirks),
            clock: Box::new(SystemClock),
            state: None,
            manifestation_tolerant: true,
            will_reset: false,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll = policy;
        self
    }

    /// Whether the device still answers after manifestation
    /// (`bitManifestationTolerant`)
    pub fn with_manifestation_tolerant(mut self, tolerant: bool) -> Self {
        self.manifestation_tolerant = tolerant;
        self
    }

    /// Expect the device to reset once the download is complete.
    pub fn set_will_reset(&mut self, will_reset: bool) {
        self.will_reset = will_reset;
    }

    pub fn will_reset(&self) -> bool {
        self.will_reset
    }

    pub fn transfer_size(&self) -> u16 {
        self.xfer_size
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Last state reported by the device, if known
    pub fn state(&self) -> Option<DfuState> {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// `DFU_GETSTATUS`. A non-OK status is returned as is.
    pub fn get_status(&mut self) -> Result<DfuStatus, DfuError> {
        let data =
            self.transport
                .control_in(DFU_GETSTATUS, 0, DFU_STATUS_LEN)?;
        let st = DfuStatus::from_raw(&data)?;
        let current = self.state.unwrap_or(st.state);
        self.state = Some(next_state(current, &st));
        log::trace!(
            "GETSTATUS: state {}, status {:?}, poll timeout {} ms",
            st.state,
            st.status,
            st.poll_timeout
        );
        Ok(st)
    }

    pub fn clear_status(&mut self) -> Result<(), DfuError> {
        self.transport.control_out(DFU_CLRSTATUS, 0, &[])?;
        self.state = Some(DfuState::DfuIdle);
        Ok(())
    }

    pub fn get_state(&mut self) -> Result<DfuState, DfuError> {
        let data = self.transport.control_in(DFU_GETSTATE, 0, 1)?;
        let raw = *data.first().ok_or_else(|| {
            DfuError::UnexpectedResponse("empty GETSTATE response".into())
        })?;
        let state = DfuState::from_u8(raw).ok_or_else(|| {
            DfuError::UnexpectedResponse(format!("unknown DFU state {raw}"))
        })?;
        self.state = Some(state);
        Ok(state)
    }

    pub fn abort(&mut self) -> Result<(), DfuError> {
        self.transport.control_out(DFU_ABORT, 0, &[])?;
        self.state = Some(DfuState::DfuIdle);
        Ok(())
    }

    /// Ask a run-time device to enter DFU mode.
    ///
    /// The device must be in `appIDLE` or `appDETACH`. With `reset`, or when
    /// the device needs it, a USB reset follows the request.
    pub fn detach(&mut self, timeout_ms: u16, reset: bool) -> Result<(), DfuError> {
        let state = match self.state {
            Some(state) => state,
            None => match self.get_state() {
                Ok(state) => state,
                // GETSTATE is optional in run-time mode
                Err(e) if e.is_stall() => DfuState::AppIdle,
                Err(e) => return Err(e),
            },
        };
        if !state.is_runtime() {
            return Err(DfuError::InvalidState {
                got: state,
                expected: "appIDLE or appDETACH",
            });
        }

        log::info!("Sending DFU detach, timeout {timeout_ms} ms");
        self.transport.control_out(DFU_DETACH, timeout_ms, &[])?;
        self.state = Some(DfuState::AppDetach);

        if reset || self.quirks.contains(Quirks::DETACH_RESET) {
            log::info!("Resetting USB to switch to DFU mode");
            match self.transport.reset() {
                Ok(()) | Err(TransportError::Disconnected) => {}
                Err(e) => return Err(e.into()),
            }
            self.state = None;
        }
        Ok(())
    }

    /// Send one block of firmware and wait until the device has processed it.
    ///
    /// An empty block ends the download, see [DfuConnection::finish_download].
    pub fn download_block(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<DfuState, DfuError> {
        if data.is_empty() {
            return Ok(match self.finish_download(block)? {
                Manifestation::Complete => DfuState::DfuIdle,
                Manifestation::WaitReset => DfuState::DfuManifestWaitReset,
            });
        }
        self.check_transfer_len(data.len())?;

        log::trace!("DNLOAD block {block}, {} bytes", data.len());
        self.dnload(block, data)?;
        let st = self.wait_dnload(None)?;
        self.expect_dnload_idle(&st)
    }

    /// Send the zero length block and wait for manifestation.
    pub fn finish_download(
        &mut self,
        block: u16,
    ) -> Result<Manifestation, DfuError> {
        let tolerant = self.manifestation_tolerant && !self.will_reset;
        self.manifest(block, tolerant)
    }

    pub(crate) fn manifest(
        &mut self,
        block: u16,
        tolerant: bool,
    ) -> Result<Manifestation, DfuError> {
        log::debug!("Sending zero length download, block {block}");
        self.dnload(block, &[])?;
        self.state = Some(DfuState::DfuManifestSync);

        let mut wait = PollWait::new(self.poll);
        loop {
            let st = match self.checked_status() {
                Ok(st) => st,
                Err(DfuError::Transport(e)) if !tolerant => {
                    log::info!(
                        "Device stopped answering during manifestation ({e})"
                    );
                    self.state = None;
                    return Ok(Manifestation::WaitReset);
                }
                Err(e) => return Err(e),
            };

            match st.state {
                DfuState::DfuIdle => {
                    log::info!("Manifestation complete");
                    return Ok(Manifestation::Complete);
                }
                DfuState::DfuManifestWaitReset => {
                    log::info!("Device waits for a reset to run the new firmware");
                    return Ok(Manifestation::WaitReset);
                }
                DfuState::DfuManifestSync
                | DfuState::DfuManifest
                | DfuState::DfuDnloadSync
                | DfuState::DfuDnbusy => {
                    if st.state == DfuState::DfuManifest {
                        log::info!("Transitioning to dfuMANIFEST state");
                    }
                    self.poll_step(&mut wait, &st, st.poll_timeout)?;
                }
                other => {
                    return Err(DfuError::InvalidState {
                        got: other,
                        expected: "dfuMANIFEST or dfuIDLE",
                    });
                }
            }
        }
    }

    // Zero length download for devices that leave without a status stage.
    pub(crate) fn send_leave(&mut self, block: u16) {
        if let Err(e) = self.dnload(block, &[]) {
            log::debug!("Leave request: {e}");
        }
        if let Err(e) = self.get_status() {
            log::debug!("Status after leave request: {e}");
        }
        self.state = None;
    }

    /// Read one block. A result shorter than `length` ends the upload.
    pub fn upload_block(
        &mut self,
        block: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        self.check_transfer_len(length as usize)?;
        let data = self.transport.control_in(DFU_UPLOAD, block, length)?;
        log::trace!("UPLOAD block {block}: {} of {length} bytes", data.len());
        if data.len() > length as usize {
            return Err(DfuError::UnexpectedResponse(format!(
                "UPLOAD returned {} bytes, requested {length}",
                data.len()
            )));
        }
        self.state = Some(if data.len() < length as usize {
            DfuState::DfuIdle
        } else {
            DfuState::DfuUploadIdle
        });
        Ok(data)
    }

    /// Bring the device back to `dfuIDLE`, clearing an error at most once.
    pub fn reset_state(&mut self) -> Result<(), DfuError> {
        let mut st = self.get_status()?;
        if !st.is_ok() {
            log::debug!("Clearing status {:?} in state {}", st.status, st.state);
            self.clear_status()?;
            st = self.get_status()?;
        }
        if st.state != DfuState::DfuIdle {
            self.abort()?;
            st = self.get_status()?;
        }
        st.ok()?;
        self.expect_state(&st, DfuState::DfuIdle, "dfuIDLE")
    }

    /// `DFU_ABORT` followed by a check that the device is idle
    pub fn abort_to_idle(&mut self) -> Result<(), DfuError> {
        self.abort()?;
        let st = self.checked_status()?;
        self.expect_state(&st, DfuState::DfuIdle, "dfuIDLE")
    }

    pub fn usb_reset(&mut self) -> Result<(), DfuError> {
        self.transport.reset()?;
        self.state = None;
        Ok(())
    }

    pub fn select_alt(&mut self, alt_setting: u8) -> Result<(), DfuError> {
        self.transport.set_alt_setting(alt_setting)?;
        Ok(())
    }

    /// Run a DfuSe command: a block 0 download followed by polling.
    pub fn vendor_command(
        &mut self,
        command: &DfuseCommand,
    ) -> Result<DfuStatus, DfuError> {
        log::debug!("DfuSe command: {command}");
        self.dnload(0, &command.encode())?;
        let st = self.wait_dnload(Some(command))?;
        if *command == DfuseCommand::ReadUnprotect {
            return Ok(st);
        }
        self.expect_dnload_idle(&st)?;
        Ok(st)
    }

    fn dnload(&mut self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        let written = self.transport.control_out(DFU_DNLOAD, block, data)?;
        if written != data.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: data.len(),
            }
            .into());
        }
        self.state = Some(DfuState::DfuDnloadSync);
        Ok(())
    }

    // Poll after a download request until the device is no longer busy.
    fn wait_dnload(
        &mut self,
        command: Option<&DfuseCommand>,
    ) -> Result<DfuStatus, DfuError> {
        let mut wait = PollWait::new(self.poll);
        let mut stalls = 0;
        let mut last_timeout = 0;
        let mut first = true;

        loop {
            let st = match self.checked_status() {
                Ok(st) => st,
                Err(e) if e.is_stall() && stalls < MAX_STALLS => {
                    stalls += 1;
                    log::debug!(
                        "Device stalled GETSTATUS, reusing last poll timeout"
                    );
                    DfuStatus::new(
                        DfuStatusCode::Ok,
                        last_timeout,
                        DfuState::DfuDnbusy,
                    )
                }
                Err(e) => return Err(e),
            };
            last_timeout = st.poll_timeout;

            let mut timeout = st.poll_timeout;
            if let Some(command) = command {
                if first
                    && !matches!(
                        st.state,
                        DfuState::DfuDnbusy | DfuState::DfuDnloadIdle
                    )
                {
                    return Err(DfuError::InvalidState {
                        got: st.state,
                        expected: "dfuDNBUSY or dfuDNLOAD-IDLE",
                    });
                }
                timeout = command.poll_timeout(timeout, first);
            }
            first = false;

            let busy = matches!(
                st.state,
                DfuState::DfuDnloadSync | DfuState::DfuDnbusy
            );
            if !busy {
                return Ok(st);
            }
            self.poll_step(&mut wait, &st, timeout)?;
            // the device resets instead of finishing the command
            if command == Some(&DfuseCommand::ReadUnprotect) {
                return Ok(st);
            }
        }
    }

    fn poll_step(
        &mut self,
        wait: &mut PollWait,
        st: &DfuStatus,
        timeout_ms: u32,
    ) -> Result<(), DfuError> {
        match wait.step(true, Duration::from_millis(timeout_ms as u64)) {
            PollStep::Ready => Ok(()),
            PollStep::Sleep(d) => {
                self.clock.sleep(d);
                Ok(())
            }
            PollStep::Exceeded { waited } => {
                log::error!("Device stuck in state {} after {waited:?}", st.state);
                Err(DfuError::PollTimeoutExceeded {
                    state: st.state,
                    waited,
                })
            }
        }
    }

    // GETSTATUS, turning a non-OK status into an error after one CLRSTATUS.
    fn checked_status(&mut self) -> Result<DfuStatus, DfuError> {
        let st = self.get_status()?;
        if st.is_ok() {
            return Ok(st);
        }
        log::error!(
            "DFU state({}) = {}, status({}) = {}",
            st.state as u8,
            st.state,
            st.status as u8,
            st.status
        );
        if let Err(e) = self.clear_status() {
            log::warn!("Clearing status failed: {e}");
        }
        Err(DfuError::from(&st))
    }

    fn expect_dnload_idle(&self, st: &DfuStatus) -> Result<DfuState, DfuError> {
        self.expect_state(st, DfuState::DfuDnloadIdle, "dfuDNLOAD-IDLE")?;
        Ok(st.state)
    }

    fn expect_state(
        &self,
        st: &DfuStatus,
        state: DfuState,
        expected: &'static str,
    ) -> Result<(), DfuError> {
        if st.state == state {
            Ok(())
        } else {
            Err(DfuError::InvalidState {
                got: st.state,
                expected,
            })
        }
    }

    fn check_transfer_len(&self, len: usize) -> Result<(), DfuError> {
        if len > self.xfer_size as usize {
            Err(DfuError::TransferTooLarge {
                len,
                max: self.xfer_size as usize,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::MockClock,
        transport::mock::{ManifestBehavior, MockTransport, Request},
    };

    fn connect(mock: MockTransport) -> (DfuConnection<MockTransport>, MockClock) {
        connect_with(mock, Quirks::empty())
    }

    fn connect_with(
        mock: MockTransport,
        quirks: Quirks,
    ) -> (DfuConnection<MockTransport>, MockClock) {
        let clock = MockClock::default();
        let conn = DfuConnection::new(mock, 64, quirks).with_clock(clock.clone());
        (conn, clock)
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_download_block_waits_while_busy() {
        let mut mock = MockTransport::new();
        mock.busy_polls = 2;
        mock.poll_timeout = 25;
        let (mut conn, clock) = connect(mock);

        let state = conn.download_block(0, &[0xaa; 64]).unwrap();
        assert_eq!(state, DfuState::DfuDnloadIdle);
        assert_eq!(conn.state(), Some(DfuState::DfuDnloadIdle));
        assert_eq!(clock.sleeps(), vec![ms(25), ms(25)]);
        assert_eq!(
            conn.transport().log,
            vec![
                Request::Dnload {
                    block: 0,
                    data: vec![0xaa; 64]
                },
                Request::GetStatus,
                Request::GetStatus,
                Request::GetStatus,
            ]
        );
    }

    #[test]
    fn test_block_larger_than_transfer_size() {
        let (mut conn, _) = connect(MockTransport::new());
        assert!(matches!(
            conn.download_block(0, &[0; 65]),
            Err(DfuError::TransferTooLarge { len: 65, max: 64 })
        ));
        assert!(conn.transport().log.is_empty());
    }

    #[test]
    fn test_device_error_clears_once() {
        let mut mock = MockTransport::new();
        mock.fail_next_download(DfuStatusCode::ErrWrite);
        let (mut conn, _) = connect(mock);

        let err = conn.download_block(3, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Device {
                status: DfuStatusCode::ErrWrite,
                state: DfuState::DfuError
            }
        ));
        let clears = conn.transport().requests(|r| *r == Request::ClrStatus);
        assert_eq!(clears.len(), 1);
        assert_eq!(conn.transport().state, DfuState::DfuIdle);
    }

    #[test]
    fn test_ignore_poll_timeout_quirk() {
        let mut mock = MockTransport::new();
        mock.poll_timeout = 2000;
        let (mut conn, clock) = connect_with(mock, Quirks::IGNORE_POLL_TIMEOUT);
        conn.download_block(0, &[0; 8]).unwrap();
        assert_eq!(clock.sleeps(), vec![ms(5)]);
    }

    #[test]
    fn test_poll_timeout_exceeded_after_retries() {
        let mut mock = MockTransport::new();
        mock.busy_polls = u32::MAX;
        mock.poll_timeout = 30_000;
        let (mut conn, clock) = connect(mock);

        let err = conn.download_block(0, &[0; 8]).unwrap_err();
        assert!(matches!(
            err,
            DfuError::PollTimeoutExceeded {
                state: DfuState::DfuDnbusy,
                ..
            }
        ));
        // two 30 s sleeps per 60 s budget, initial budget plus two retries
        assert_eq!(clock.sleeps().len(), 6);
        assert_eq!(clock.total(), Duration::from_secs(180));
    }

    #[test]
    fn test_getstatus_stalls_are_tolerated() {
        let mut mock = MockTransport::new();
        mock.busy_polls = 0;
        for _ in 0..3 {
            mock.status_queue.push_back(Err(TransportError::Stall));
        }
        let (mut conn, _) = connect(mock);
        assert_eq!(
            conn.download_block(0, &[0; 8]).unwrap(),
            DfuState::DfuDnloadIdle
        );

        let mut mock = MockTransport::new();
        for _ in 0..4 {
            mock.status_queue.push_back(Err(TransportError::Stall));
        }
        let (mut conn, _) = connect(mock);
        assert!(conn.download_block(0, &[0; 8]).unwrap_err().is_stall());
    }

    #[test]
    fn test_manifestation() {
        let (mut conn, _) = connect(MockTransport::new());
        conn.download_block(0, &[0; 8]).unwrap();
        assert_eq!(conn.finish_download(1).unwrap(), Manifestation::Complete);
        assert_eq!(conn.state(), Some(DfuState::DfuIdle));

        let mut mock = MockTransport::new();
        mock.manifest = ManifestBehavior::WaitReset;
        let (mut conn, _) = connect(mock);
        assert_eq!(conn.finish_download(0).unwrap(), Manifestation::WaitReset);
        assert_eq!(conn.state(), Some(DfuState::DfuManifestWaitReset));
    }

    #[test]
    fn test_manifestation_disconnect() {
        let mut mock = MockTransport::new();
        mock.manifest = ManifestBehavior::Disconnect;
        let (conn, _) = connect(mock);
        let mut conn = conn.with_manifestation_tolerant(false);
        assert_eq!(conn.finish_download(0).unwrap(), Manifestation::WaitReset);

        let mut mock = MockTransport::new();
        mock.manifest = ManifestBehavior::Disconnect;
        let (mut conn, _) = connect(mock);
        assert!(matches!(
            conn.finish_download(0),
            Err(DfuError::Transport(TransportError::Disconnected))
        ));
    }

    #[test]
    fn test_upload_short_read_ends_upload() {
        let mut mock = MockTransport::new();
        mock.upload_data = vec![7; 100];
        let (mut conn, _) = connect(mock);
        assert_eq!(conn.upload_block(0, 64).unwrap().len(), 64);
        assert_eq!(conn.state(), Some(DfuState::DfuUploadIdle));
        assert_eq!(conn.upload_block(1, 64).unwrap().len(), 36);
        assert_eq!(conn.state(), Some(DfuState::DfuIdle));
    }

    #[test]
    fn test_detach() {
        let (mut conn, _) = connect(MockTransport::new());
        assert!(matches!(
            conn.detach(1000, false),
            Err(DfuError::InvalidState {
                got: DfuState::DfuIdle,
                ..
            })
        ));
        assert!(
            conn.transport()
                .requests(|r| matches!(r, Request::Detach { .. }))
                .is_empty()
        );

        let mock = MockTransport::new().in_state(DfuState::AppIdle);
        let (mut conn, _) = connect(mock);
        conn.detach(1000, false).unwrap();
        assert_eq!(
            conn.transport().log,
            vec![Request::GetState, Request::Detach { timeout: 1000 }]
        );
        assert_eq!(conn.state(), Some(DfuState::AppDetach));

        let mock = MockTransport::new().in_state(DfuState::AppIdle);
        let (mut conn, _) = connect_with(mock, Quirks::DETACH_RESET);
        conn.detach(500, false).unwrap();
        assert_eq!(conn.transport().log.last(), Some(&Request::Reset));
        assert_eq!(conn.transport().state, DfuState::DfuIdle);
    }

    #[test]
    fn test_reset_state() {
        let mut mock = MockTransport::new();
        mock.status_queue.push_back(Ok(DfuStatus::new(
            DfuStatusCode::ErrVerify,
            0,
            DfuState::DfuError,
        )));
        let (mut conn, _) = connect(mock);
        conn.reset_state().unwrap();
        assert_eq!(
            conn.transport().log,
            vec![Request::GetStatus, Request::ClrStatus, Request::GetStatus]
        );

        let mock = MockTransport::new().in_state(DfuState::DfuDnloadIdle);
        let (mut conn, _) = connect(mock);
        conn.reset_state().unwrap();
        assert_eq!(
            conn.transport().log,
            vec![Request::GetStatus, Request::Abort, Request::GetStatus]
        );
    }

    #[test]
    fn test_mass_erase_timeout_extended() {
        let mut mock = MockTransport::dfuse();
        mock.poll_timeout = 100;
        let (mut conn, clock) = connect(mock);
        conn.vendor_command(&DfuseCommand::MassErase).unwrap();
        assert!(conn.transport().mass_erased);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(35)]);
    }

    #[test]
    fn test_set_address_ignores_poll_timeout() {
        let mut mock = MockTransport::dfuse();
        mock.busy_polls = 2;
        mock.poll_timeout = 500;
        let (mut conn, clock) = connect(mock);
        conn.vendor_command(&DfuseCommand::SetAddress(0x0800_4000))
            .unwrap();
        assert_eq!(conn.transport().address, 0x0800_4000);
        assert_eq!(clock.sleeps(), vec![Duration::ZERO, Duration::ZERO]);
    }

    #[test]
    fn test_read_unprotect_returns_after_first_status() {
        let mut mock = MockTransport::dfuse();
        mock.busy_polls = 5;
        let (mut conn, _) = connect(mock);
        let st = conn.vendor_command(&DfuseCommand::ReadUnprotect).unwrap();
        assert_eq!(st.state, DfuState::DfuDnbusy);
        assert!(conn.transport().unprotected);
        assert_eq!(
            conn.transport().requests(|r| *r == Request::GetStatus).len(),
            1
        );
    }
}
