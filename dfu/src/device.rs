use nonempty::NonEmpty;
use nusb::{self, MaybeFuture};

use crate::{
    DfuConnection, DfuError, DfuMemSegment, descriptor::*, dfuse::Layouts,
    interface::*,
    quirks::{DeviceIdentity, QuirkTable, Quirks, fixup_dfuse_layout},
    transport::NusbTransport,
};

const DFU_CLASS: u8 = 0xFE;
const DFU_SUBCLASS: u8 = 0x1;

/// DFU device representation
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    identity: DeviceIdentity,
    quirks: Quirks,
    descriptor: DfuDescriptor,
    interfaces: Vec<DfuInterface>,
}

/// DFU interface and memory segments matching an address range
///
/// It can be obtained with [DfuDevice::find_interface_segments].
///
pub struct DfuInterfaceSegments {
    interface: u8,
    alt_setting: u8,
    segments: NonEmpty<DfuMemSegment>,
}

impl DfuInterfaceSegments {
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    pub fn segments(&self) -> &NonEmpty<DfuMemSegment> {
        &self.segments
    }
}

impl DfuDevice {
    fn from_device_info(
        device: nusb::DeviceInfo,
        table: &QuirkTable,
    ) -> Result<Option<Self>, DfuError> {
        let mut identity = DeviceIdentity::new(
            device.vendor_id(),
            device.product_id(),
            device.device_version(),
        );
        if let Some(serial) = device.serial_number() {
            identity = identity.with_serial(serial);
        }
        let quirks = table.lookup_identity(&identity);
        if !quirks.is_empty() {
            log::debug!(
                "{:04x}:{:04x} rev {:04x}: quirks {quirks}",
                identity.vendor_id,
                identity.product_id,
                identity.bcd_device
            );
        }

        let open_dev: nusb::Device = device.open().wait()?;
        let mut interfaces: Vec<DfuInterface> = open_dev
            .configurations()
            .flat_map(|configuration| {
                let open_dev = open_dev.clone();
                let config = configuration.configuration_value();
                configuration.interface_alt_settings().filter_map(
                    move |alt_setting| {
                        if alt_setting.class() != DFU_CLASS
                            || alt_setting.subclass() != DFU_SUBCLASS
                        {
                            None
                        } else {
                            Some(DfuInterface::new(
                                &open_dev,
                                config,
                                alt_setting.interface_number(),
                                alt_setting.alternate_setting(),
                                alt_setting.protocol(),
                                alt_setting.string_index(),
                            ))
                        }
                    },
                )
            })
            .collect();

        if interfaces.is_empty() {
            return Ok(None);
        }

        let mut descriptor = open_dev
            .configurations()
            .find_map(|config| {
                config.interface_alt_settings().find_map(|alt_setting| {
                    alt_setting
                        .descriptors()
                        .find_map(|desc| DfuDescriptor::from_bytes(&desc))
                })
            })
            .unwrap_or_default();
        if quirks.contains(Quirks::FORCE_DFU11) {
            log::debug!(
                "Forcing DFU 1.1, device reports 0x{:04x}",
                descriptor.dfu_version()
            );
            descriptor = descriptor.force_dfu11();
        }

        if quirks.contains(Quirks::DFUSE_LAYOUT) {
            for intf in &mut interfaces {
                let alt_setting = intf.alt_setting();
                if let Some(layout) = intf.layout_mut() {
                    fixup_dfuse_layout(&identity, alt_setting, layout);
                }
            }
        }

        Ok(Some(DfuDevice {
            dev: device,
            identity,
            quirks,
            descriptor,
            interfaces,
        }))
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.dev
    }

    pub fn id(&self) -> nusb::DeviceId {
        self.dev.id()
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.identity.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.identity.product_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &Vec<DfuInterface> {
        &self.interfaces
    }

    /// Device in run-time mode, it needs a detach first
    pub fn is_runtime(&self) -> bool {
        self.interfaces.iter().all(|intf| intf.is_runtime())
    }

    pub fn is_dfuse(&self) -> bool {
        self.descriptor.is_dfuse()
    }

    /// DFU functional descriptor of this device. If no descriptor can be
    /// found, [DfuDescriptor::default()] is returned.
    pub fn dfu_descriptor(&self) -> &DfuDescriptor {
        &self.descriptor
    }

    /// Memory layouts of all alternate settings of `interface`
    pub fn layouts(&self, interface: u8) -> Layouts {
        self.interfaces
            .iter()
            .filter(|intf| intf.interface() == interface)
            .filter_map(|intf| {
                Some((intf.alt_setting(), intf.layout()?.clone()))
            })
            .collect()
    }

    /// Select an alternate setting by number or by name. Without either, the
    /// first interface is used.
    pub fn find_interface(
        &self,
        alt_setting: Option<u8>,
        alt_name: Option<&str>,
    ) -> Result<&DfuInterface, DfuError> {
        self.interfaces
            .iter()
            .find(|intf| {
                alt_setting.is_none_or(|alt| intf.alt_setting() == alt)
                    && alt_name.is_none_or(|name| {
                        intf.name().is_some_and(|n| {
                            n.trim_start_matches('@').starts_with(name)
                        })
                    })
            })
            .ok_or(DfuError::InvalidInterface)
    }

    /// Find a matching interface, alternate setting and memory segments
    ///
    /// This is required to connect to the alternate setting whose memory
    /// holds the address range.
    pub fn find_interface_segments(
        &self,
        start_address: u32,
        end_address: u32,
    ) -> Result<DfuInterfaceSegments, DfuError> {
        self.interfaces
            .iter()
            .find_map(|intf| {
                let segments = NonEmpty::from_vec(
                    intf.find_segments(start_address, end_address),
                )?;
                // verify boundaries
                if start_address < segments.first().start_addr()
                    || end_address > segments.last().end_addr()
                {
                    None
                } else {
                    Some(DfuInterfaceSegments {
                        interface: intf.interface(),
                        alt_setting: intf.alt_setting(),
                        segments,
                    })
                }
            })
            .ok_or(DfuError::NoMemorySegments)
    }

    /// Connect to the DFU interface
    ///
    /// `transfer_size` overrides `wTransferSize` when non-zero.
    pub fn connect(
        &self,
        interface: u8,
        alt_setting: u8,
        transfer_size: u16,
    ) -> Result<DfuConnection, DfuError> {
        let xfer_size = match transfer_size {
            0 => self.descriptor.transfer_size(),
            size => size,
        };
        let dev = self.dev.open().wait()?;
        let intf = dev.claim_interface(interface).wait()?;
        intf.set_alt_setting(alt_setting).wait()?;
        log::debug!(
            "Claimed interface {interface}, alternate setting {alt_setting}, transfer size {xfer_size}"
        );

        let transport = NusbTransport::new(dev, intf);
        Ok(DfuConnection::new(transport, xfer_size, self.quirks)
            .with_manifestation_tolerant(
                self.descriptor.manifestation_tolerant(),
            ))
    }
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// List DFU capable devices, with quirks from the built-in table
pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice>, DfuError> {
    find_dfu_devices_with(vid, pid, &QuirkTable::builtin())
}

pub fn find_dfu_devices_with(
    vid: Option<u16>,
    pid: Option<u16>,
    table: &QuirkTable,
) -> Result<Vec<DfuDevice>, DfuError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    let mut dfu_devices = Vec::with_capacity(devices.len());
    for device in devices {
        if let Some(dfu_device) = DfuDevice::from_device_info(device, table)? {
            dfu_devices.push(dfu_device);
        }
    }
    Ok(dfu_devices)
}
