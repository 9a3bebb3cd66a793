use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::FileError;

pub const LMDFU_PREFIX_LENGTH: usize = 8;
pub const LPCDFU_PREFIX_LENGTH: usize = 16;

const STELLARIS_DFU_PROG: u8 = 0x01;
const LMDFU_ADDRESS_UNIT: u32 = 1024;
const LPCDFU_UNENCRYPTED: u8 = 0x1a;
const LPCDFU_RESERVED: u8 = 0x3f;
const LPCDFU_BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixKind {
    /// TI Stellaris
    Lmdfu,
    /// NXP LPC, unencrypted
    Lpc,
}

/// Leading prefix of a firmware file. The two kinds never coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// TI Stellaris (`lmdfu`) prefix carrying the flash start address
    ///
    /// Layout: `0x01`, reserved, start address / 1024 (u16),
    /// payload length (u32).
    Lmdfu { address: u32 },
    /// NXP LPC unencrypted prefix
    ///
    /// Layout: `0x1A`, `0x3F`, image length in 512 byte blocks (u16),
    /// 8 reserved zero bytes, 4 bytes of `0xFF`.
    Lpc,
}

impl Prefix {
    pub fn kind(&self) -> PrefixKind {
        match self {
            Prefix::Lmdfu { .. } => PrefixKind::Lmdfu,
            Prefix::Lpc => PrefixKind::Lpc,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Prefix::Lmdfu { .. } => LMDFU_PREFIX_LENGTH,
            Prefix::Lpc => LPCDFU_PREFIX_LENGTH,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Look for a prefix at the start of `data`, whose last `suffix_len`
    /// bytes are a DFU suffix.
    pub fn detect(data: &[u8], suffix_len: usize) -> Option<Prefix> {
        let body_len = data.len().checked_sub(suffix_len)?;

        if body_len >= LMDFU_PREFIX_LENGTH
            && data[0] == STELLARIS_DFU_PROG
            && data[1] == 0x00
        {
            let mut cursor = Cursor::new(&data[2..LMDFU_PREFIX_LENGTH]);
            let address_units = cursor.read_u16::<LittleEndian>().ok()?;
            let payload_len = cursor.read_u32::<LittleEndian>().ok()? as usize;
            if payload_len == body_len - LMDFU_PREFIX_LENGTH {
                return Some(Prefix::Lmdfu {
                    address: address_units as u32 * LMDFU_ADDRESS_UNIT,
                });
            }
            log::warn!("Invalid TI Stellaris DFU prefix length");
        }

        if body_len > LPCDFU_PREFIX_LENGTH
            && (data[0] & 0x3f) == LPCDFU_UNENCRYPTED
            && data[1] == LPCDFU_RESERVED
        {
            let blocks = u16::from_le_bytes([data[2], data[3]]) as usize;
            if blocks == body_len.div_ceil(LPCDFU_BLOCK_SIZE) {
                return Some(Prefix::Lpc);
            }
            log::debug!("LPC prefix signature with {blocks} blocks, ignored");
        }

        None
    }

    /// Encode the prefix for a payload of `payload_len` bytes.
    pub fn encode(&self, payload_len: usize) -> Result<Vec<u8>, FileError> {
        let mut buf = Vec::with_capacity(self.len());
        match *self {
            Prefix::Lmdfu { address } => {
                if address % LMDFU_ADDRESS_UNIT != 0 {
                    return Err(FileError::format(format!(
                        "Stellaris address 0x{address:08x} is not 1 KiB aligned"
                    )));
                }
                let units = u16::try_from(address / LMDFU_ADDRESS_UNIT)
                    .map_err(|_| {
                        FileError::format(format!(
                            "Stellaris address 0x{address:08x} out of range"
                        ))
                    })?;
                let len = u32::try_from(payload_len).map_err(|_| {
                    FileError::format("payload too large for a Stellaris prefix")
                })?;
                buf.push(STELLARIS_DFU_PROG);
                buf.push(0x00);
                buf.write_u16::<LittleEndian>(units)?;
                buf.write_u32::<LittleEndian>(len)?;
            }
            Prefix::Lpc => {
                let blocks = (payload_len + LPCDFU_PREFIX_LENGTH)
                    .div_ceil(LPCDFU_BLOCK_SIZE);
                let blocks = u16::try_from(blocks).map_err(|_| {
                    FileError::format("payload too large for an LPC prefix")
                })?;
                buf.push(LPCDFU_UNENCRYPTED);
                buf.push(LPCDFU_RESERVED);
                buf.write_u16::<LittleEndian>(blocks)?;
                buf.extend_from_slice(&[0x00; 8]);
                buf.extend_from_slice(&[0xff; 4]);
            }
        }
        Ok(buf)
    }
}
