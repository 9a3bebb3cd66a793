use std::time::Duration;

use dfufile::FileError;
use thiserror::Error;

use crate::{DfuState, DfuStatusCode};

/// Failure of the underlying USB transfer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),
    #[error("Transfer error: {0}")]
    Transfer(nusb::transfer::TransferError),
    #[error("Endpoint stalled")]
    Stall,
    #[error("Device disconnected")]
    Disconnected,
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

impl TransportError {
    pub fn is_stall(&self) -> bool {
        matches!(self, TransportError::Stall)
    }
}

impl From<nusb::transfer::TransferError> for TransportError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        use nusb::transfer::TransferError as E;
        match err {
            E::Stall => TransportError::Stall,
            E::Disconnected => TransportError::Disconnected,
            other => TransportError::Transfer(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error("DFU status error in state {state}: {status}")]
    Device {
        status: DfuStatusCode,
        state: DfuState,
    },
    #[error("Device still busy in state {state} after {waited:?}")]
    PollTimeoutExceeded { state: DfuState, waited: Duration },
    #[error("Invalid memory layout: {0}")]
    LayoutParse(String),
    #[error("{0} requires the force option")]
    PermissionDenied(&'static str),
    #[error("Device in state {got}, expected {expected}")]
    InvalidState {
        got: DfuState,
        expected: &'static str,
    },
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Transfer of {len} bytes exceeds transfer size {max}")]
    TransferTooLarge { len: usize, max: usize },
    #[error("No compatible memory segments")]
    NoMemorySegments,
    #[error("Address 0x{0:08x} is not writable")]
    NotWritable(u32),
    #[error("Address 0x{0:08x} is not readable")]
    NotReadable(u32),
    #[error("Address 0x{0:08x} cannot be erased")]
    NotErasable(u32),
    #[error("Invalid DfuSe option: {0}")]
    InvalidOption(String),
    #[error("File does not match device: {0}")]
    WrongDevice(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Invalid interface")]
    InvalidInterface,
}

impl DfuError {
    pub fn is_stall(&self) -> bool {
        matches!(self, DfuError::Transport(e) if e.is_stall())
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Transport(TransportError::Usb(err))
    }
}

impl From<nusb::transfer::TransferError> for DfuError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DfuError::Transport(err.into())
    }
}
