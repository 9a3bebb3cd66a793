use std::{fmt::Display, io};

use dfu::DfuError;
use dfufile::FileError;

pub enum CliError {
    IO(io::Error),
    Dfu(DfuError),
    File(FileError),
    NoDFUDevice,
    ManyDFUDevices,
    RuntimeMode,
    ReconnectTimeout,
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DfuError> for CliError {
    fn from(value: DfuError) -> Self {
        match value {
            DfuError::File(err) => CliError::File(err),
            err => CliError::Dfu(err),
        }
    }
}

impl From<FileError> for CliError {
    fn from(value: FileError) -> Self {
        CliError::File(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Dfu(err) => write!(f, "DFU error: {err}"),
            CliError::File(err) => write!(f, "File error: {err}"),
            CliError::NoDFUDevice => write!(f, "No DFU device"),
            CliError::ManyDFUDevices => write!(f, "More than one DFU devices"),
            CliError::RuntimeMode => {
                write!(f, "Device is in run-time mode, detach it first")
            }
            CliError::ReconnectTimeout => {
                write!(f, "Device did not reappear in DFU mode")
            }
        }
    }
}
