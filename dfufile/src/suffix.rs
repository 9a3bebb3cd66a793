use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_JAMCRC, Crc};

use crate::{DFU_VERSION_1_0, FileError, ID_WILDCARD, Trailer};

pub const DFU_SUFFIX_LENGTH: usize = 16;

// "DFU" stored least significant byte first
const DFU_SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";
const DFU_SUFFIX_CRC_OFFSET: usize = 12;

/// CRC32 over the whole file except the final `dwCRC` field: reflected
/// polynomial 0xEDB88320, initial value 0xFFFFFFFF, no final XOR.
pub const DFU_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

pub fn dfu_crc(data: &[u8]) -> u32 {
    DFU_CRC.checksum(data)
}

/// Identity fields carried by a DFU suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuffixIds {
    pub bcd_device: u16,
    pub id_product: u16,
    pub id_vendor: u16,
    pub bcd_dfu: u16,
}

impl SuffixIds {
    pub fn new(id_vendor: u16, id_product: u16, bcd_device: u16) -> Self {
        SuffixIds {
            bcd_device,
            id_product,
            id_vendor,
            bcd_dfu: DFU_VERSION_1_0,
        }
    }

    pub fn with_dfu_version(mut self, bcd_dfu: u16) -> Self {
        self.bcd_dfu = bcd_dfu;
        self
    }
}

impl Default for SuffixIds {
    fn default() -> Self {
        SuffixIds::new(ID_WILDCARD, ID_WILDCARD, ID_WILDCARD)
    }
}

/// DFU suffix (DFU 1.1, appendix B)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuSuffix {
    pub ids: SuffixIds,
    /// `bLength`: number of trailing bytes covered by the suffix
    pub length: u8,
    /// `dwCRC`
    pub crc: u32,
}

/// Outcome of looking for a suffix at the end of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuffixScan {
    Absent,
    Valid(DfuSuffix),
    BadCrc { expected: u32, computed: u32 },
    Unsupported(u8),
}

impl DfuSuffix {
    /// Build a suffix for `body`, which holds every byte preceding the suffix
    /// (prefix and payload).
    pub fn build(ids: SuffixIds, body: &[u8]) -> Self {
        let header = encode_header(&ids, DFU_SUFFIX_LENGTH as u8);
        let mut digest = DFU_CRC.digest();
        digest.update(body);
        digest.update(&header);
        DfuSuffix {
            ids,
            length: DFU_SUFFIX_LENGTH as u8,
            crc: digest.finalize(),
        }
    }

    /// Decode and verify the suffix at the end of `data`.
    pub fn from_file_bytes(data: &[u8]) -> Result<Self, FileError> {
        match scan(data)? {
            SuffixScan::Valid(suffix) => Ok(suffix),
            SuffixScan::Absent => Err(FileError::NotFound(Trailer::Suffix)),
            SuffixScan::BadCrc { expected, computed } => {
                Err(FileError::CrcMismatch { expected, computed })
            }
            SuffixScan::Unsupported(len) => Err(FileError::UnsupportedFormat(
                format!("DFU suffix length {len}"),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn to_bytes(&self) -> [u8; DFU_SUFFIX_LENGTH] {
        let mut out = [0u8; DFU_SUFFIX_LENGTH];
        out[..DFU_SUFFIX_CRC_OFFSET]
            .copy_from_slice(&encode_header(&self.ids, DFU_SUFFIX_LENGTH as u8));
        out[DFU_SUFFIX_CRC_OFFSET..].copy_from_slice(&self.crc.to_le_bytes());
        out
    }
}

fn encode_header(ids: &SuffixIds, length: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DFU_SUFFIX_CRC_OFFSET);
    // writes into a Vec cannot fail
    let _ = buf.write_u16::<LittleEndian>(ids.bcd_device);
    let _ = buf.write_u16::<LittleEndian>(ids.id_product);
    let _ = buf.write_u16::<LittleEndian>(ids.id_vendor);
    let _ = buf.write_u16::<LittleEndian>(ids.bcd_dfu);
    buf.extend_from_slice(DFU_SUFFIX_SIGNATURE);
    buf.push(length);
    buf
}

pub(crate) fn scan(data: &[u8]) -> Result<SuffixScan, FileError> {
    if data.len() < DFU_SUFFIX_LENGTH {
        return Err(FileError::format(format!(
            "file is {} bytes, shorter than the {DFU_SUFFIX_LENGTH} byte DFU suffix",
            data.len()
        )));
    }

    let trailer = &data[data.len() - DFU_SUFFIX_LENGTH..];
    if &trailer[8..11] != DFU_SUFFIX_SIGNATURE {
        return Ok(SuffixScan::Absent);
    }

    let mut cursor = Cursor::new(trailer);
    let ids = SuffixIds {
        bcd_device: cursor.read_u16::<LittleEndian>()?,
        id_product: cursor.read_u16::<LittleEndian>()?,
        id_vendor: cursor.read_u16::<LittleEndian>()?,
        bcd_dfu: cursor.read_u16::<LittleEndian>()?,
    };
    let length = trailer[11];
    cursor.set_position(DFU_SUFFIX_CRC_OFFSET as u64);
    let expected = cursor.read_u32::<LittleEndian>()?;

    let computed = dfu_crc(&data[..data.len() - 4]);
    if computed != expected {
        log::warn!("DFU suffix CRC does not match");
        return Ok(SuffixScan::BadCrc { expected, computed });
    }

    if (length as usize) < DFU_SUFFIX_LENGTH || (length as usize) > data.len()
    {
        return Ok(SuffixScan::Unsupported(length));
    }

    Ok(SuffixScan::Valid(DfuSuffix {
        ids,
        length,
        crc: expected,
    }))
}
