use std::{fmt, io};

use thiserror::Error;

/// Trailer kind, used to report which one is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    Suffix,
    Prefix,
}

impl fmt::Display for Trailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trailer::Suffix => write!(f, "DFU suffix"),
            Trailer::Prefix => write!(f, "prefix"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("invalid file format: {0}")]
    Format(String),
    #[error("CRC mismatch: file has 0x{expected:08x}, computed 0x{computed:08x}")]
    CrcMismatch { expected: u32, computed: u32 },
    #[error("file already has a valid DFU suffix")]
    DuplicateSuffix,
    #[error("file already has a prefix")]
    DuplicatePrefix,
    #[error("no {0} found")]
    NotFound(Trailer),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FileError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        FileError::Format(msg.into())
    }
}
