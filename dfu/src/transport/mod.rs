//! Control transfer boundary of the protocol engine
//!
//! The engine only needs class requests addressed to the claimed DFU
//! interface, plus a bus reset and alternate setting selection.
//! [NusbTransport] provides them on real hardware.

mod usb;

#[cfg(test)]
pub(crate) mod mock;

pub use usb::NusbTransport;

use crate::TransportError;

/// Blocking class requests on one claimed DFU interface
pub trait DfuTransport {
    /// Host to device request, returns the number of bytes sent.
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    /// Device to host request reading at most `length` bytes.
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError>;

    /// USB bus reset of the whole device
    fn reset(&mut self) -> Result<(), TransportError>;

    fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), TransportError>;
}

impl<T: DfuTransport + ?Sized> DfuTransport for &mut T {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        (**self).control_out(request, value, data)
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).control_in(request, value, length)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }

    fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), TransportError> {
        (**self).set_alt_setting(alt_setting)
    }
}
