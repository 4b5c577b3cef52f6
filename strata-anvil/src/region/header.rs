//! Region file header.
//!
//! The header consists of two tables:
//! - Location table: where each chunk is stored
//! - Timestamp table: when each chunk was last saved

use std::fmt;

use super::{CHUNK_SLOTS, HEADER_BYTES, SECTOR_BYTES};
use crate::bitmap::RegionBitmap;

/// One entry of the location table: `sector << 8 | count`, 0 when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectorOffset(u32);

impl SectorOffset {
    pub const EMPTY: Self = Self(0);

    pub const fn new(sector: usize, count: usize) -> Self {
        Self(((sector as u32) << 8) | (count as u32 & 0xFF))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// First sector of the record.
    pub const fn sector(self) -> usize {
        ((self.0 >> 8) & 0xFF_FFFF) as usize
    }

    /// Number of sectors the record occupies.
    pub const fn count(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Byte offset of the record in the file.
    pub const fn byte_offset(self) -> u64 {
        self.sector() as u64 * SECTOR_BYTES as u64
    }
}

/// In-memory copy of the 8 KiB header, kept in its on-disk byte order.
#[derive(Clone)]
pub struct RegionHeader {
    bytes: Box<[u8; HEADER_BYTES]>,
}

impl RegionHeader {
    pub fn empty() -> Self {
        Self {
            bytes: Box::new([0u8; HEADER_BYTES]),
        }
    }

    /// Copies up to 8192 bytes; a shorter (truncated) input reads as zeros.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut header = Self::empty();
        let len = data.len().min(HEADER_BYTES);
        header.bytes[..len].copy_from_slice(&data[..len]);
        header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    pub fn offset(&self, index: usize) -> SectorOffset {
        SectorOffset(self.read_u32(index * 4))
    }

    pub fn set_offset(&mut self, index: usize, offset: SectorOffset) {
        self.write_u32(index * 4, offset.0);
    }

    /// Seconds since the Unix epoch of the last save.
    pub fn timestamp(&self, index: usize) -> u32 {
        self.read_u32(SECTOR_BYTES + index * 4)
    }

    pub fn set_timestamp(&mut self, index: usize, timestamp: u32) {
        self.write_u32(SECTOR_BYTES + index * 4, timestamp);
    }

    fn read_u32(&self, at: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[at..at + 4]);
        u32::from_be_bytes(raw)
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }
}

impl fmt::Debug for RegionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let occupied = (0..CHUNK_SLOTS).filter(|&i| !self.offset(i).is_empty()).count();
        f.debug_struct("RegionHeader").field("occupied", &occupied).finish()
    }
}

/// A location entry that could not be trusted and was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderCorruption {
    OverlapsHeader { index: usize, sector: usize },
    ZeroSize { index: usize },
    OutOfBounds { index: usize, sector: usize },
}

impl fmt::Display for HeaderCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverlapsHeader { index, sector } => write!(
                f,
                "invalid sector at index: {index}; sector {sector} overlaps with header"
            ),
            Self::ZeroSize { index } => {
                write!(f, "invalid sector at index: {index}; size has to be > 0")
            }
            Self::OutOfBounds { index, sector } => write!(
                f,
                "invalid sector at index: {index}; sector {sector} is out of bounds"
            ),
        }
    }
}

/// A header with every untrustworthy entry zeroed, plus what was dropped.
#[derive(Debug)]
pub struct ValidatedHeader {
    pub header: RegionHeader,
    pub used_sectors: RegionBitmap,
    pub corruptions: Vec<HeaderCorruption>,
}

/// Checks every location entry against the header area and the file length.
///
/// Entries pointing into the header, with zero size, or starting past the end
/// of the file are zeroed. The rest are reserved in the returned bitmap.
pub fn validate_header(mut header: RegionHeader, file_len: u64) -> ValidatedHeader {
    let mut used_sectors = RegionBitmap::new();
    used_sectors.force(0, HEADER_BYTES / SECTOR_BYTES);
    let mut corruptions = Vec::new();

    for index in 0..CHUNK_SLOTS {
        let offset = header.offset(index);
        if offset.is_empty() {
            continue;
        }

        let sector = offset.sector();
        let corruption = if sector < 2 {
            Some(HeaderCorruption::OverlapsHeader { index, sector })
        } else if offset.count() == 0 {
            Some(HeaderCorruption::ZeroSize { index })
        } else if offset.byte_offset() > file_len {
            Some(HeaderCorruption::OutOfBounds { index, sector })
        } else {
            None
        };

        match corruption {
            Some(corruption) => {
                header.set_offset(index, SectorOffset::EMPTY);
                corruptions.push(corruption);
            }
            None => used_sectors.force(sector, offset.count()),
        }
    }

    ValidatedHeader {
        header,
        used_sectors,
        corruptions,
    }
}
