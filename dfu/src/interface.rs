use std::{num::NonZeroU8, time::Duration};

use nusb::{self, MaybeFuture};

use crate::memory::*;

// bInterfaceProtocol of an interface in run-time mode
const DFU_PROTOCOL_RUNTIME: u8 = 1;

/// One alternate setting of a DFU interface
#[derive(Clone, Debug)]
pub struct DfuInterface {
    config: u8,
    interface: u8,
    alt_setting: u8,
    protocol: u8,
    name: Option<String>,
    layout: Option<DfuMemory>,
}

impl DfuInterface {
    pub(crate) fn new(
        device: &nusb::Device,
        config: u8,
        interface: u8,
        alt_setting: u8,
        protocol: u8,
        name_idx: Option<NonZeroU8>,
    ) -> Self {
        let name = name_idx.and_then(|idx| {
            get_string_descriptor(device, idx, crate::DEFAULT_TIMEOUT)
        });
        let layout = name.as_deref().and_then(|name| {
            if !name.starts_with('@') {
                return None;
            }
            parse_memory_layout(name)
                .inspect_err(|e| {
                    log::warn!("Alternate setting {alt_setting}: {e}")
                })
                .ok()
        });
        Self {
            config,
            interface,
            alt_setting,
            protocol,
            name,
            layout,
        }
    }

    pub fn config(&self) -> u8 {
        self.config
    }
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    /// Interface string, holds the memory layout on DfuSe devices
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn layout(&self) -> Option<&DfuMemory> {
        self.layout.as_ref()
    }
    pub(crate) fn layout_mut(&mut self) -> Option<&mut DfuMemory> {
        self.layout.as_mut()
    }

    /// Interface of a device running its application
    pub fn is_runtime(&self) -> bool {
        self.protocol == DFU_PROTOCOL_RUNTIME
    }

    pub fn find_segments(
        &self,
        start_address: u32,
        end_address: u32,
    ) -> Vec<DfuMemSegment> {
        self.layout
            .as_ref()
            .map(|layout| layout.find_segments(start_address, end_address))
            .unwrap_or_default()
    }
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}
