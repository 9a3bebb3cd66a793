//! ST DfuSe extensions (AN3156)
//!
//! DfuSe devices expose their memory through alternate settings described by
//! a layout string. Writes go through an address pointer set with a vendor
//! command on block 0, data blocks then start at block number 2.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use dfufile::DfuseImage;

use crate::{
    DfuConnection, DfuError, DfuMemory, Manifestation, Quirks,
    transfer::{self, Phase, Progress, check_cancelled, chunks},
    transport::DfuTransport,
};

const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;
const CMD_READ_UNPROTECT: u8 = 0x92;

// Some bootloaders report 100 ms for a mass erase that takes much longer
const MASS_ERASE_REPORTED_TIMEOUT: u32 = 100;
const MASS_ERASE_TIMEOUT: u32 = 35_000;

/// Upload size when neither a length nor a segment bounds the read
pub const DEFAULT_UPLOAD_LIMIT: u32 = 0x4000;

/// First block number carrying data after the address pointer was set
pub const DFUSE_DATA_BLOCK: u16 = 2;

/// Memory layouts by alternate setting
pub type Layouts = BTreeMap<u8, DfuMemory>;

/// Vendor command sent as a block 0 download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuseCommand {
    SetAddress(u32),
    ErasePage(u32),
    MassErase,
    ReadUnprotect,
}

impl DfuseCommand {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            DfuseCommand::SetAddress(address) => {
                let mut cmd = vec![CMD_SET_ADDRESS];
                cmd.extend_from_slice(&address.to_le_bytes());
                cmd
            }
            DfuseCommand::ErasePage(address) => {
                let mut cmd = vec![CMD_ERASE];
                cmd.extend_from_slice(&address.to_le_bytes());
                cmd
            }
            DfuseCommand::MassErase => vec![CMD_ERASE],
            DfuseCommand::ReadUnprotect => vec![CMD_READ_UNPROTECT],
        }
    }

    /// Poll timeout to honour for a status received while the command runs.
    pub fn poll_timeout(&self, reported: u32, first: bool) -> u32 {
        match self {
            DfuseCommand::SetAddress(_) => 0,
            DfuseCommand::MassErase
                if first && reported == MASS_ERASE_REPORTED_TIMEOUT =>
            {
                log::debug!("Setting timeout to {MASS_ERASE_TIMEOUT} ms");
                MASS_ERASE_TIMEOUT
            }
            _ => reported,
        }
    }
}

impl fmt::Display for DfuseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuseCommand::SetAddress(address) => {
                write!(f, "set address 0x{address:08x}")
            }
            DfuseCommand::ErasePage(address) => {
                write!(f, "erase page 0x{address:08x}")
            }
            DfuseCommand::MassErase => f.write_str("mass erase"),
            DfuseCommand::ReadUnprotect => f.write_str("read unprotect"),
        }
    }
}

/// Options given as `address[:modifier]...`
///
/// Modifiers are `leave`, `mass-erase`, `unprotect`, `will-reset`, `force`
/// and a transfer length. Numbers are decimal or `0x` prefixed hexadecimal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DfuseOptions {
    pub address: Option<u32>,
    pub leave: bool,
    pub mass_erase: bool,
    pub unprotect: bool,
    pub will_reset: bool,
    pub force: bool,
    pub length: Option<u32>,
}

fn parse_number(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl FromStr for DfuseOptions {
    type Err = DfuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let mut options = DfuseOptions::default();

        let address = parts.next().unwrap_or_default().trim();
        if !address.is_empty() {
            options.address = Some(parse_number(address).ok_or_else(|| {
                DfuError::InvalidOption(format!("invalid address '{address}'"))
            })?);
        }

        for part in parts.map(str::trim) {
            match part {
                "leave" => options.leave = true,
                "mass-erase" => options.mass_erase = true,
                "unprotect" => options.unprotect = true,
                "will-reset" => options.will_reset = true,
                "force" => options.force = true,
                "" => {}
                other => match parse_number(other) {
                    Some(length) => options.length = Some(length),
                    None => {
                        return Err(DfuError::InvalidOption(format!(
                            "unknown modifier '{other}'"
                        )));
                    }
                },
            }
        }
        Ok(options)
    }
}

/// DfuSe session on one connection
pub struct Dfuse<'a, T: DfuTransport> {
    conn: &'a mut DfuConnection<T>,
    layouts: Layouts,
    alt_setting: u8,
    options: DfuseOptions,
    erased: BTreeSet<(u8, u32)>,
    mass_erased: bool,
}

impl<'a, T: DfuTransport> Dfuse<'a, T> {
    pub fn new(
        conn: &'a mut DfuConnection<T>,
        layouts: Layouts,
        alt_setting: u8,
        options: DfuseOptions,
    ) -> Self {
        conn.set_will_reset(options.will_reset);
        Dfuse {
            conn,
            layouts,
            alt_setting,
            options,
            erased: BTreeSet::new(),
            mass_erased: false,
        }
    }

    pub fn options(&self) -> &DfuseOptions {
        &self.options
    }

    /// Layout of the selected alternate setting
    pub fn layout(&self) -> Option<&DfuMemory> {
        self.layouts.get(&self.alt_setting)
    }

    pub fn set_address(&mut self, address: u32) -> Result<(), DfuError> {
        self.conn
            .vendor_command(&DfuseCommand::SetAddress(address))?;
        Ok(())
    }

    pub fn erase_page(&mut self, address: u32) -> Result<(), DfuError> {
        let erasable = self
            .layout()
            .and_then(|layout| layout.find_segment(address))
            .is_some_and(|segment| segment.erasable());
        if !erasable && !self.options.force {
            return Err(DfuError::NotErasable(address));
        }
        log::debug!("Erasing page at 0x{address:08x}");
        self.conn.vendor_command(&DfuseCommand::ErasePage(address))?;
        self.erased.insert((self.alt_setting, address));
        Ok(())
    }

    /// Erase the whole flash. Needs the `force` option.
    pub fn mass_erase(&mut self) -> Result<(), DfuError> {
        if !self.options.force {
            return Err(DfuError::PermissionDenied("Mass erase"));
        }
        log::info!("Performing mass erase, this can take a moment");
        self.conn.vendor_command(&DfuseCommand::MassErase)?;
        self.mass_erased = true;
        Ok(())
    }

    /// Remove read protection. The device erases its flash and resets.
    /// Needs the `force` option.
    pub fn unprotect(&mut self) -> Result<(), DfuError> {
        if !self.options.force {
            return Err(DfuError::PermissionDenied("Read unprotect"));
        }
        self.conn.vendor_command(&DfuseCommand::ReadUnprotect)?;
        log::info!("Device disconnects, erases flash and resets now");
        Ok(())
    }

    /// Write `data` at the address given in the options.
    pub fn download_raw(
        &mut self,
        data: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<Option<Manifestation>, DfuError> {
        let address = self.options.address.ok_or_else(|| {
            DfuError::InvalidOption("missing DfuSe address".into())
        })?;
        if self.options.mass_erase {
            self.mass_erase()?;
        }
        let length = self.options.length.map_or(data.len(), |l| {
            (l as usize).min(data.len())
        });
        self.download_element(address, &data[..length], progress)?;
        self.finish(address)
    }

    /// Write every element of every target whose alternate setting exists,
    /// in increasing address order per target.
    pub fn download_image(
        &mut self,
        image: &DfuseImage,
        progress: &mut dyn Progress,
    ) -> Result<Option<Manifestation>, DfuError> {
        if self.options.mass_erase {
            self.mass_erase()?;
        }

        let mut entry = None;
        for target in &image.targets {
            if !self.layouts.is_empty()
                && !self.layouts.contains_key(&target.alt_setting)
            {
                log::warn!(
                    "No alternate setting {} on the device, skipping target",
                    target.alt_setting
                );
                continue;
            }
            if target.alt_setting != self.alt_setting {
                log::info!("Switching to alternate setting {}", target.alt_setting);
                self.conn.select_alt(target.alt_setting)?;
                self.alt_setting = target.alt_setting;
            }

            for element in target.sorted_elements() {
                log::info!(
                    "Downloading element to address 0x{:08x}, size {}",
                    element.address,
                    element.size()
                );
                entry.get_or_insert(element.address);
                self.download_element(element.address, &element.payload, progress)?;
            }
        }

        match entry {
            Some(address) => self.finish(address),
            None => Err(DfuError::NoMemorySegments),
        }
    }

    /// Erase the pages covered by the element, then program it chunk by
    /// chunk, each chunk preceded by an address pointer update.
    pub fn download_element(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<(), DfuError> {
        if data.is_empty() {
            return Ok(());
        }
        let size = u32::try_from(data.len()).map_err(|_| {
            DfuError::TransferTooLarge {
                len: data.len(),
                max: u32::MAX as usize,
            }
        })?;
        let last = address
            .checked_add(size - 1)
            .ok_or(DfuError::NotWritable(address))?;

        let uncovered = match self.layout() {
            Some(layout) => {
                layout.first_uncovered(address, last, |s| s.writable())
            }
            None => Some(address),
        };
        if let Some(addr) = uncovered {
            if !self.options.force {
                return Err(DfuError::NotWritable(addr));
            }
            log::warn!("Forced write to 0x{addr:08x} outside writable memory");
        }

        if !self.mass_erased {
            let alt = self.alt_setting;
            let pages: Vec<u32> = self
                .layout()
                .map(|layout| {
                    layout.erase_pages(address, last.saturating_add(1))
                })
                .unwrap_or_default()
                .into_iter()
                .filter(|page| !self.erased.contains(&(alt, *page)))
                .collect();
            if !pages.is_empty() {
                log::info!("Erasing {} pages", pages.len());
                progress.start(Phase::Erase, pages.len());
                for (n, page) in pages.into_iter().enumerate() {
                    check_cancelled(progress)?;
                    self.erase_page(page)?;
                    progress.update(n + 1);
                }
                progress.finish();
            }
        }

        let xfer_size = self.conn.transfer_size() as usize;
        progress.start(Phase::Download, data.len());
        let mut done = 0;
        for chunk in chunks(data, xfer_size) {
            check_cancelled(progress)?;
            // done < data.len() which fits in u32
            self.set_address(address + done as u32)?;
            self.conn.download_block(DFUSE_DATA_BLOCK, chunk)?;
            done += chunk.len();
            progress.update(done);
        }
        progress.finish();
        Ok(())
    }

    /// Read from the address given in the options, clamped to the end of its
    /// segment. `length` overrides the length in the options.
    pub fn upload(
        &mut self,
        length: Option<u32>,
        progress: &mut dyn Progress,
    ) -> Result<Vec<u8>, DfuError> {
        let length = length.or(self.options.length);
        let limit = match self.options.address {
            Some(address) => {
                let segment = self
                    .layout()
                    .and_then(|layout| layout.find_segment(address))
                    .cloned();
                match &segment {
                    Some(segment) if segment.readable() => {}
                    _ if self.options.force => {
                        log::warn!("Forced read from 0x{address:08x}");
                    }
                    _ => return Err(DfuError::NotReadable(address)),
                }
                self.set_address(address)?;
                self.conn.abort_to_idle()?;

                let segment_limit = segment.map(|s| s.end_addr() - address);
                match (length, segment_limit) {
                    (Some(length), Some(max)) => length.min(max),
                    (Some(length), None) => length,
                    (None, Some(max)) => max,
                    (None, None) => DEFAULT_UPLOAD_LIMIT,
                }
            }
            None => length.unwrap_or_else(|| {
                log::warn!(
                    "No address given, reading {DEFAULT_UPLOAD_LIMIT} bytes"
                );
                DEFAULT_UPLOAD_LIMIT
            }),
        };

        let data = transfer::upload_blocks(
            self.conn,
            DFUSE_DATA_BLOCK,
            Some(limit as usize),
            progress,
        )?;
        self.conn.abort_to_idle()?;

        if self.options.leave {
            self.leave(None)?;
        }
        Ok(data)
    }

    /// Start the application, optionally at `address`.
    pub fn leave(&mut self, address: Option<u32>) -> Result<Manifestation, DfuError> {
        if let Some(address) = address {
            self.set_address(address)?;
        }
        log::info!("Leaving DFU mode");

        if self.conn.quirks().contains(Quirks::DFUSE_LEAVE) {
            // the device jumps to the application before the status stage
            self.conn.send_leave(DFUSE_DATA_BLOCK);
            return Ok(Manifestation::WaitReset);
        }
        self.conn.manifest(DFUSE_DATA_BLOCK, false)
    }

    fn finish(&mut self, entry: u32) -> Result<Option<Manifestation>, DfuError> {
        if self.options.leave {
            self.leave(Some(entry)).map(Some)
        } else {
            self.set_address(entry)?;
            Ok(None)
        }
    }
}
