//! Big data block (db) record: header parsing/serialization and the
//! chunk-size constant used to split oversized values.

use crate::error::{RegistryError, Result};
use crate::primitives::{read_u16_le, read_u32_le};

/// Maximum bytes stored per segment cell. Values larger than this use
/// multiple segments referenced from a single segment-offset list.
pub const BIG_DATA_CHUNK_SIZE: usize = 16_344;

/// Header cell for a big-data value: points at the list of segment cell
/// offsets that together hold the value's bytes.
#[derive(Debug, Clone)]
pub struct BigDataBlock {
    pub segment_count: u16,
    /// Relative offset of the segment-offset-list cell (a flat array of u32s).
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    const MIN_SIZE: usize = 8;

    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(RegistryError::truncated(offset, "big-data header shorter than 8 bytes"));
        }
        if &data[0..2] != b"db" {
            return Err(RegistryError::format_invalid(offset, "expected 'db' signature"));
        }

        let segment_count = read_u16_le(data, 0x02)?;
        let segment_list_offset = read_u32_le(data, 0x04)?;

        Ok(BigDataBlock {
            segment_count,
            segment_list_offset,
        })
    }

    pub fn new(segment_count: u16, segment_list_offset: u32) -> Self {
        BigDataBlock {
            segment_count,
            segment_list_offset,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::MIN_SIZE);
        out.extend_from_slice(b"db");
        out.extend_from_slice(&self.segment_count.to_le_bytes());
        out.extend_from_slice(&self.segment_list_offset.to_le_bytes());
        out
    }

    /// Splits `data` into `BIG_DATA_CHUNK_SIZE`-sized pieces (the layout
    /// written to each segment cell; never empty, even for empty `data`).
    pub fn chunk(data: &[u8]) -> Vec<&[u8]> {
        if data.is_empty() {
            return vec![&[]];
        }
        data.chunks(BIG_DATA_CHUNK_SIZE).collect()
    }

    /// Serializes a flat list of segment cell offsets into the payload of
    /// the segment-offset-list cell.
    pub fn encode_segment_list(offsets: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(offsets.len() * 4);
        for &o in offsets {
            out.extend_from_slice(&o.to_le_bytes());
        }
        out
    }

    pub fn parse_segment_list(data: &[u8], count: u16, offset: u32) -> Result<Vec<u32>> {
        let expected = count as usize * 4;
        if data.len() < expected {
            return Err(RegistryError::truncated(offset, "segment list shorter than declared count"));
        }
        (0..count as usize).map(|i| read_u32_le(data, i * 4)).collect()
    }
}
