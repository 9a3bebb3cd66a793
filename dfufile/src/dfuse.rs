use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::FileError;

const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
const DFUSE_FORMAT_VERSION: u8 = 0x01;
const DFUSE_PREFIX_LENGTH: usize = 11;

const TARGET_SIGNATURE: &[u8; 6] = b"Target";
const TARGET_NAME_LENGTH: usize = 255;
const TARGET_PREFIX_LENGTH: usize = 274;

const ELEMENT_HEADER_LENGTH: usize = 8;

/// Contiguous block of firmware bound to a memory address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuseElement {
    pub address: u32,
    pub payload: Vec<u8>,
}

impl DfuseElement {
    pub fn new(address: u32, payload: Vec<u8>) -> Self {
        DfuseElement { address, payload }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Address past the last byte of the element
    pub fn end_address(&self) -> u64 {
        self.address as u64 + self.payload.len() as u64
    }
}

/// Elements meant for one alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuseTarget {
    pub alt_setting: u8,
    pub name: Option<String>,
    pub elements: Vec<DfuseElement>,
}

impl DfuseTarget {
    /// Elements in increasing address order
    pub fn sorted_elements(&self) -> Vec<&DfuseElement> {
        let mut elements: Vec<_> = self.elements.iter().collect();
        elements.sort_by_key(|e| e.address);
        elements
    }

    fn encoded_size(&self) -> usize {
        self.elements
            .iter()
            .map(|e| ELEMENT_HEADER_LENGTH + e.size())
            .sum()
    }
}

/// ST DfuSe multi target image (UM0391)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DfuseImage {
    pub targets: Vec<DfuseTarget>,
}

impl DfuseImage {
    /// Whether `data` starts with the DfuSe signature.
    pub fn is_dfuse_image(data: &[u8]) -> bool {
        data.starts_with(DFUSE_SIGNATURE)
    }

    /// Parse a DfuSe image. `data` excludes the DFU suffix.
    pub fn parse(data: &[u8]) -> Result<Self, FileError> {
        if data.len() < DFUSE_PREFIX_LENGTH {
            return Err(FileError::format("file too small for a DfuSe image"));
        }
        if !Self::is_dfuse_image(data) {
            return Err(FileError::UnsupportedFormat(
                "no valid DfuSe signature".into(),
            ));
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(DFUSE_SIGNATURE.len() as u64);
        let version = cursor.read_u8()?;
        if version != DFUSE_FORMAT_VERSION {
            return Err(FileError::UnsupportedFormat(format!(
                "DfuSe format revision {version}"
            )));
        }
        let image_size = cursor.read_u32::<LittleEndian>()? as usize;
        if image_size != data.len() {
            return Err(FileError::format(format!(
                "DfuSe image declares {image_size} bytes, file holds {}",
                data.len()
            )));
        }
        let target_count = cursor.read_u8()?;
        log::debug!("DfuSe image with {target_count} targets");

        let mut targets = Vec::with_capacity(target_count as usize);
        for index in 0..target_count {
            targets.push(parse_target(&mut cursor, index)?);
        }

        let leftover = data.len() - cursor.position() as usize;
        if leftover != 0 {
            return Err(FileError::format(format!(
                "{leftover} bytes left over after the last target"
            )));
        }

        Ok(DfuseImage { targets })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FileError> {
        let target_count = u8::try_from(self.targets.len())
            .map_err(|_| FileError::format("too many DfuSe targets"))?;

        let mut out = Vec::with_capacity(self.encoded_size());
        out.extend_from_slice(DFUSE_SIGNATURE);
        out.write_u8(DFUSE_FORMAT_VERSION)?;
        out.write_u32::<LittleEndian>(to_u32(self.encoded_size())?)?;
        out.write_u8(target_count)?;

        for target in &self.targets {
            let name = target.name.as_deref().unwrap_or_default().as_bytes();
            if name.len() >= TARGET_NAME_LENGTH {
                return Err(FileError::format(format!(
                    "target name longer than {} bytes",
                    TARGET_NAME_LENGTH - 1
                )));
            }
            let mut name_field = [0u8; TARGET_NAME_LENGTH];
            name_field[..name.len()].copy_from_slice(name);

            out.extend_from_slice(TARGET_SIGNATURE);
            out.write_u8(target.alt_setting)?;
            out.write_u32::<LittleEndian>(target.name.is_some() as u32)?;
            out.extend_from_slice(&name_field);
            out.write_u32::<LittleEndian>(to_u32(target.encoded_size())?)?;
            out.write_u32::<LittleEndian>(to_u32(target.elements.len())?)?;

            for element in &target.elements {
                out.write_u32::<LittleEndian>(element.address)?;
                out.write_u32::<LittleEndian>(to_u32(element.size())?)?;
                out.extend_from_slice(&element.payload);
            }
        }
        Ok(out)
    }

    fn encoded_size(&self) -> usize {
        DFUSE_PREFIX_LENGTH
            + self
                .targets
                .iter()
                .map(|t| TARGET_PREFIX_LENGTH + t.encoded_size())
                .sum::<usize>()
    }
}

fn parse_target(
    cursor: &mut Cursor<&[u8]>,
    index: u8,
) -> Result<DfuseTarget, FileError> {
    let mut prefix = [0u8; TARGET_PREFIX_LENGTH];
    read_exact(cursor, &mut prefix, "target prefix")?;
    if &prefix[..TARGET_SIGNATURE.len()] != TARGET_SIGNATURE {
        return Err(FileError::UnsupportedFormat(format!(
            "no valid signature for target {index}"
        )));
    }

    let mut fields = Cursor::new(&prefix[TARGET_SIGNATURE.len()..]);
    let alt_setting = fields.read_u8()?;
    let named = fields.read_u32::<LittleEndian>()? != 0;
    let mut name_field = [0u8; TARGET_NAME_LENGTH];
    fields.read_exact(&mut name_field)?;
    let target_size = fields.read_u32::<LittleEndian>()? as usize;
    let element_count = fields.read_u32::<LittleEndian>()?;

    let name = named.then(|| {
        let end = name_field.iter().position(|&b| b == 0).unwrap_or(TARGET_NAME_LENGTH);
        String::from_utf8_lossy(&name_field[..end]).into_owned()
    });
    log::debug!(
        "Target {index}: alt {alt_setting}, name {:?}, {element_count} elements, {target_size} bytes",
        name.as_deref().unwrap_or("-")
    );

    let body_start = cursor.position();
    let mut elements = Vec::new();
    for _ in 0..element_count {
        let address = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let remaining = cursor.get_ref().len() - cursor.position() as usize;
        if size > remaining {
            return Err(FileError::format(format!(
                "element at 0x{address:08x} declares {size} bytes, {remaining} left"
            )));
        }
        let mut payload = vec![0u8; size];
        read_exact(cursor, &mut payload, "element payload")?;
        elements.push(DfuseElement { address, payload });
    }

    let consumed = (cursor.position() - body_start) as usize;
    if consumed != target_size {
        log::warn!(
            "Target {index} declares {target_size} bytes but its elements take {consumed}"
        );
    }

    Ok(DfuseTarget {
        alt_setting,
        name,
        elements,
    })
}

fn read_exact(
    cursor: &mut Cursor<&[u8]>,
    buf: &mut [u8],
    what: &str,
) -> Result<(), FileError> {
    cursor.read_exact(buf).map_err(|_| {
        FileError::format(format!("file truncated while reading {what}"))
    })
}

fn truncated(_: std::io::Error) -> FileError {
    FileError::format("file truncated while reading element header")
}

fn to_u32(value: usize) -> Result<u32, FileError> {
    u32::try_from(value).map_err(|_| FileError::format("DfuSe image too large"))
}
