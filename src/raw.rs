//! On-flash layout of the circular buffer.
//!
//! ```text
//! sector:  [header][entry][entry]...[0xff..]
//! header:  magic: u32 LE | version: u8 | 0xff | id: u16 LE
//! entry:   [len: 1-2 bytes][data][crc32: u32 LE]
//! ```
//!
//! Header, length, data and CRC each start on a program unit boundary. The CRC covers the
//! length bytes and the data and is written last, so an entry without a valid CRC was torn
//! by a reset and is skipped.

use crate::error::Error;
use crate::platform::{AlignedOps, Platform, align_floor};
use alloc::vec;
#[cfg(feature = "defmt")]
use defmt::trace;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

pub const DEFAULT_MAGIC: u32 = 0x4643_4231;
pub const DEFAULT_VERSION: u8 = 1;

pub(crate) const SECTOR_HEADER_SIZE: usize = 8;
pub(crate) const CRC_SIZE: usize = 4;

/// Largest data length the two byte length encoding can describe.
pub const MAX_ENTRY_LEN: usize = 0x3fff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct SectorHeader {
    pub(crate) magic: u32,
    pub(crate) version: u8,
    pub(crate) id: u16,
}

impl SectorHeader {
    pub(crate) fn encode(&self) -> [u8; SECTOR_HEADER_SIZE] {
        let mut raw = [0xffu8; SECTOR_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4] = self.version;
        raw[6..8].copy_from_slice(&self.id.to_le_bytes());
        raw
    }

    pub(crate) fn decode(raw: &[u8; SECTOR_HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            version: raw[4],
            id: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }
}

/// Encodes `len` into `buf`, returning the number of bytes used.
pub(crate) fn encode_len(len: usize, buf: &mut [u8; 2]) -> Result<usize, Error> {
    if len > MAX_ENTRY_LEN {
        return Err(Error::ValueTooLong);
    }
    if len < 0x80 {
        buf[0] = len as u8;
        Ok(1)
    } else {
        buf[0] = (len as u8 & 0x7f) | 0x80;
        buf[1] = (len >> 7) as u8;
        Ok(2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LenField {
    /// Both bytes erased, the sector ends here.
    Blank,
    Len { len: usize, bytes: usize },
}

pub(crate) fn decode_len(raw: [u8; 2]) -> LenField {
    if raw[0] == 0xff && raw[1] == 0xff {
        return LenField::Blank;
    }
    if raw[0] & 0x80 == 0 {
        LenField::Len {
            len: raw[0] as usize,
            bytes: 1,
        }
    } else {
        LenField::Len {
            len: (raw[0] & 0x7f) as usize | ((raw[1] as usize) << 7),
            bytes: 2,
        }
    }
}

pub(crate) fn len_bytes(data_len: usize) -> usize {
    if data_len < 0x80 { 1 } else { 2 }
}

/// Bytes occupied on flash by the length field, the data and the CRC of an entry.
pub(crate) fn entry_footprint<T: Platform>(len_bytes: usize, data_len: usize) -> usize {
    T::align_write_ceil(len_bytes) + T::align_write_ceil(data_len) + T::align_write_ceil(CRC_SIZE)
}

pub(crate) fn header_footprint<T: Platform>() -> usize {
    T::align_write_ceil(SECTOR_HEADER_SIZE)
}

/// Reads `bytes` at `offset`, widening the read to the read alignment of the flash if required.
pub(crate) fn read_aligned<T: Platform>(hal: &mut T, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
    let start = align_floor(offset as usize, T::READ_SIZE);
    if start == offset as usize && bytes.len().is_multiple_of(T::READ_SIZE) {
        return hal.read(offset, bytes).map_err(Error::flash);
    }

    let end = T::align_read(offset as usize + bytes.len());
    let mut buf = vec![0u8; end - start];
    hal.read(start as u32, &mut buf).map_err(Error::flash)?;
    let skip = offset as usize - start;
    bytes.copy_from_slice(&buf[skip..skip + bytes.len()]);
    Ok(())
}

/// Writes `bytes` at `offset`, padding the last program unit with 0xff.
pub(crate) fn write_aligned<T: Platform>(hal: &mut T, offset: u32, bytes: &[u8]) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        if !bytes.is_empty() {
            hal.write(offset, bytes).map_err(Error::flash)?;
        }
        return Ok(());
    }

    let pivot = T::align_write_floor(bytes.len());
    let (head, trailer) = bytes.split_at(pivot);
    if !head.is_empty() {
        hal.write(offset, head).map_err(Error::flash)?;
    }

    // an all-ones trailer matches the erased state and does not need programming
    if trailer.iter().any(|&e| e != 0xff) {
        let mut buf = vec![0xffu8; T::WRITE_SIZE];
        buf[..trailer.len()].copy_from_slice(trailer);
        hal.write(offset + pivot as u32, &buf).map_err(Error::flash)?;
    }

    Ok(())
}
