//! USB Device Firmware Upgrade (DFU) implementation based on [`nusb`]
//!
//! Provides a portable host side implementation of the DFU 1.0 / 1.1
//! protocol with STM32 extensions (aka "DfuSe"): the protocol state machine,
//! DfuSe memory layouts and images, a device quirks table and chunked
//! transfers with progress reporting.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! The following example shows how to obtain a `Vec` of [DfuDevice]:
//! ```
//! use dfu::find_dfu_devices;
//!
//! match find_dfu_devices(None, None) {
//!     Ok(devices) => {
//!         if devices.is_empty() {
//!             println!("No DFU devices found");
//!         } else {
//!             println!("Found {} DFU devices", devices.len());
//!         }
//!     }
//!     Err(e) => println!("Error: {e}"),
//! }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;

pub mod clock;
mod connection;
mod descriptor;
mod device;
pub mod dfuse;
mod error;
mod interface;
mod memory;
pub mod poll;
pub mod quirks;
mod status;
pub mod transfer;
pub mod transport;

use std::time::Duration;

// Re-exports
pub use connection::{DfuConnection, Manifestation};
pub use descriptor::DfuDescriptor;
pub use device::{
    DfuDevice, DfuInterfaceSegments, find_dfu_devices, find_dfu_devices_with,
};
pub use dfuse::{Dfuse, DfuseCommand, DfuseOptions, Layouts};
pub use error::{DfuError, TransportError};
pub use interface::DfuInterface;
pub use memory::{DfuMemSegment, DfuMemory, parse_memory_layout};
pub use quirks::{DeviceIdentity, QuirkTable, Quirks};
pub use status::{DfuState, DfuStatus, DfuStatusCode, next_state};
pub use transfer::{Phase, Progress};
