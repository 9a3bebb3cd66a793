use std::{
    fs,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};

use crate::{
    DFUSE_VERSION, DfuSuffix, FileError, ID_WILDCARD, Prefix, PrefixKind,
    SuffixIds, Trailer,
    suffix::{DFU_SUFFIX_LENGTH, SuffixScan, scan},
};

/// Byte addressable resource a firmware file can be loaded from and
/// stored to.
pub trait FirmwareStore: Read + Write + Seek {
    /// Cut the resource down to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl FirmwareStore for fs::File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl FirmwareStore for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.get_mut().truncate(len);
        if self.position() > len as u64 {
            self.set_position(len as u64);
        }
        Ok(())
    }
}

/// State of the suffix found when the file was parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixState {
    Absent,
    Valid,
    /// A suffix signature is present but the CRC does not match; the
    /// trailing bytes are kept as payload.
    BadCrc { expected: u32, computed: u32 },
    /// A suffix with an unsupported `bLength`; kept as payload.
    Unsupported(u8),
}

// Prefix as found in the file, written back byte for byte
#[derive(Debug, Clone)]
struct RawPrefix {
    prefix: Prefix,
    bytes: Vec<u8>,
}

/// Firmware image with its optional prefix and DFU suffix
#[derive(Debug, Clone)]
pub struct FirmwareFile {
    name: String,
    payload: Vec<u8>,
    prefix: Option<RawPrefix>,
    suffix: Option<DfuSuffix>,
    suffix_state: SuffixState,
}

impl FirmwareFile {
    /// A file holding only `payload`, without trailers.
    pub fn from_payload(name: impl Into<String>, payload: Vec<u8>) -> Self {
        FirmwareFile {
            name: name.into(),
            payload,
            prefix: None,
            suffix: None,
            suffix_state: SuffixState::Absent,
        }
    }

    /// Split raw file contents into prefix, payload and suffix.
    ///
    /// Fails only when `data` is too short to hold a suffix. A damaged
    /// suffix is reported by [FirmwareFile::check_suffix].
    pub fn parse(
        name: impl Into<String>,
        mut data: Vec<u8>,
    ) -> Result<Self, FileError> {
        let name = name.into();
        let (suffix, suffix_state) = match scan(&data)? {
            SuffixScan::Valid(suffix) => (Some(suffix), SuffixState::Valid),
            SuffixScan::Absent => (None, SuffixState::Absent),
            SuffixScan::BadCrc { expected, computed } => {
                (None, SuffixState::BadCrc { expected, computed })
            }
            SuffixScan::Unsupported(len) => {
                (None, SuffixState::Unsupported(len))
            }
        };

        let suffix_len = suffix.map_or(0, |s| s.len());
        let prefix = Prefix::detect(&data, suffix_len);
        let prefix_len = prefix.map_or(0, |p| p.len());

        if let Some(suffix) = &suffix {
            log::debug!(
                "{name}: DFU suffix version 0x{:04x}, {:04x}:{:04x}",
                suffix.ids.bcd_dfu,
                suffix.ids.id_vendor,
                suffix.ids.id_product
            );
        }
        if let Some(prefix) = &prefix {
            log::debug!("{name}: {:?} prefix", prefix);
        }

        data.truncate(data.len() - suffix_len);
        let prefix = prefix.map(|prefix| RawPrefix {
            prefix,
            bytes: data.drain(..prefix_len).collect(),
        });

        Ok(FirmwareFile {
            name,
            payload: data,
            prefix,
            suffix,
            suffix_state,
        })
    }

    /// Read the whole resource and parse it.
    pub fn load<S: FirmwareStore>(
        name: impl Into<String>,
        store: &mut S,
    ) -> Result<Self, FileError> {
        let mut data = Vec::new();
        store.seek(SeekFrom::Start(0))?;
        store.read_to_end(&mut data)?;
        Self::parse(name, data)
    }

    /// Replace the contents of `store` with this file.
    pub fn store<S: FirmwareStore>(&self, store: &mut S) -> Result<(), FileError> {
        let data = self.to_bytes();
        store.seek(SeekFrom::Start(0))?;
        store.write_all(&data)?;
        store.truncate(data.len() as u64)?;
        store.flush()?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Firmware bytes without prefix and suffix
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn prefix(&self) -> Option<&Prefix> {
        self.prefix.as_ref().map(|raw| &raw.prefix)
    }

    pub fn suffix(&self) -> Option<&DfuSuffix> {
        self.suffix.as_ref()
    }

    pub fn suffix_state(&self) -> SuffixState {
        self.suffix_state
    }

    /// Total size, trailers included
    pub fn size(&self) -> usize {
        self.prefix.as_ref().map_or(0, |raw| raw.bytes.len())
            + self.payload.len()
            + self.suffix.map_or(0, |s| s.len())
    }

    /// Suffix identity, or wildcards when the file has no valid suffix
    pub fn identity(&self) -> SuffixIds {
        self.suffix.map(|s| s.ids).unwrap_or_default()
    }

    /// Whether the suffix announces a DfuSe container
    pub fn is_dfuse(&self) -> bool {
        self.suffix.is_some_and(|s| s.ids.bcd_dfu == DFUSE_VERSION)
    }

    /// Whether the suffix allows this file on the given device
    pub fn matches_device(&self, vendor: u16, product: u16) -> bool {
        let ids = self.identity();
        (ids.id_vendor == ID_WILDCARD || ids.id_vendor == vendor)
            && (ids.id_product == ID_WILDCARD || ids.id_product == product)
    }

    pub fn check_suffix(&self) -> Result<&DfuSuffix, FileError> {
        match self.suffix_state {
            SuffixState::BadCrc { expected, computed } => {
                Err(FileError::CrcMismatch { expected, computed })
            }
            SuffixState::Unsupported(len) => Err(FileError::UnsupportedFormat(
                format!("DFU suffix length {len}"),
            )),
            SuffixState::Absent | SuffixState::Valid => self
                .suffix
                .as_ref()
                .ok_or(FileError::NotFound(Trailer::Suffix)),
        }
    }

    /// Add a suffix with a freshly computed CRC. An existing valid suffix is
    /// only replaced when `overwrite` is set.
    pub fn add_suffix(
        &mut self,
        ids: SuffixIds,
        overwrite: bool,
    ) -> Result<&DfuSuffix, FileError> {
        if self.suffix.is_some() && !overwrite {
            return Err(FileError::DuplicateSuffix);
        }
        let suffix = DfuSuffix::build(ids, &self.body());
        self.suffix_state = SuffixState::Valid;
        let suffix = &*self.suffix.insert(suffix);
        Ok(suffix)
    }

    pub fn remove_suffix(&mut self) -> Result<DfuSuffix, FileError> {
        let suffix = self
            .suffix
            .take()
            .ok_or(FileError::NotFound(Trailer::Suffix))?;
        self.suffix_state = SuffixState::Absent;
        Ok(suffix)
    }

    /// Check for a prefix, optionally of a given kind.
    pub fn check_prefix(
        &self,
        kind: Option<PrefixKind>,
    ) -> Result<&Prefix, FileError> {
        match self.prefix() {
            Some(prefix) if kind.is_none_or(|k| k == prefix.kind()) => Ok(prefix),
            _ => Err(FileError::NotFound(Trailer::Prefix)),
        }
    }

    pub fn add_prefix(&mut self, prefix: Prefix) -> Result<(), FileError> {
        if self.prefix.is_some() {
            return Err(FileError::DuplicatePrefix);
        }
        let bytes = prefix.encode(self.payload.len())?;
        self.prefix = Some(RawPrefix { prefix, bytes });
        self.refresh_suffix();
        Ok(())
    }

    pub fn remove_prefix(&mut self) -> Result<Prefix, FileError> {
        let raw = self
            .prefix
            .take()
            .ok_or(FileError::NotFound(Trailer::Prefix))?;
        self.refresh_suffix();
        Ok(raw.prefix)
    }

    /// Raw file contents: prefix, payload, suffix
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = self.body();
        if let Some(suffix) = &self.suffix {
            data.extend_from_slice(&suffix.to_bytes());
        }
        data
    }

    fn body(&self) -> Vec<u8> {
        let prefix = self
            .prefix
            .as_ref()
            .map_or(&[][..], |raw| raw.bytes.as_slice());
        let mut data = Vec::with_capacity(
            prefix.len() + self.payload.len() + DFU_SUFFIX_LENGTH,
        );
        data.extend_from_slice(prefix);
        data.extend_from_slice(&self.payload);
        data
    }

    // The suffix CRC covers the prefix, so it follows every prefix change.
    fn refresh_suffix(&mut self) {
        if let Some(suffix) = self.suffix {
            self.suffix = Some(DfuSuffix::build(suffix.ids, &self.body()));
        }
    }
}
