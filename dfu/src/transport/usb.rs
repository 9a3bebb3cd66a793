use std::time::Duration;

use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use super::DfuTransport;
use crate::{DEFAULT_TIMEOUT, TransportError};

/// [DfuTransport] over a claimed [nusb::Interface]
pub struct NusbTransport {
    device: nusb::Device,
    interface: nusb::Interface,
    timeout: Duration,
}

impl NusbTransport {
    pub fn new(device: nusb::Device, interface: nusb::Interface) -> Self {
        NusbTransport {
            device,
            interface,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interface_number(&self) -> u8 {
        self.interface.interface_number()
    }

    pub fn device(&self) -> &nusb::Device {
        &self.device
    }
}

impl DfuTransport for NusbTransport {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let index = self.interface.interface_number() as u16;
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                self.timeout,
            )
            .wait()?;
        Ok(data.len())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                self.timeout,
            )
            .wait()?)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(self.device.reset().wait()?)
    }

    fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), TransportError> {
        log::debug!(
            "Setting interface {} to alternate setting {alt_setting}",
            self.interface.interface_number()
        );
        Ok(self.interface.set_alt_setting(alt_setting).wait()?)
    }
}
