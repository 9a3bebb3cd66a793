//! DFU firmware container codec
//!
//! Reads and writes the trailers that wrap a raw firmware image for USB
//! Device Firmware Upgrade:
//! - the 16 byte DFU suffix (device identity + CRC32) defined in the
//!   DFU 1.1 specification, appendix B
//! - the TI Stellaris ("lmdfu") and NXP LPC prefixes
//! - the ST "DfuSe" multi-target image container (UM0391)
//!
//! # Example
//!
//! ```
//! use dfufile::{FirmwareFile, SuffixIds};
//!
//! let mut file = FirmwareFile::from_payload("app.bin", vec![0xAA; 64]);
//! file.add_suffix(SuffixIds::new(0x0483, 0xdf11, 0x0200), false).unwrap();
//!
//! let reparsed = FirmwareFile::parse("app.bin", file.to_bytes()).unwrap();
//! assert!(reparsed.check_suffix().is_ok());
//! assert_eq!(reparsed.payload(), &[0xAA; 64][..]);
//! ```

pub use dfuse::*;
pub use error::*;
pub use file::*;
pub use prefix::*;
pub use suffix::*;

mod dfuse;
mod error;
mod file;
mod prefix;
mod suffix;

/// `bcdDFU` of a plain DFU 1.0 file
pub const DFU_VERSION_1_0: u16 = 0x0100;
/// `bcdDFU` of a DFU 1.1 file
pub const DFU_VERSION_1_1: u16 = 0x0110;
/// `bcdDFU` announcing a DfuSe container
pub const DFUSE_VERSION: u16 = 0x011A;

/// Vendor / product / device wildcard used when a suffix leaves a field open
pub const ID_WILDCARD: u16 = 0xffff;
