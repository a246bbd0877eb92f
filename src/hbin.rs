//! Hive bin (hbin) parsing, iteration, and growth.
//!
//! A bin is a 4096-byte-aligned block holding a header followed by a run of
//! cells that exactly fills it. Cells are walked by trusting each one's size
//! field to find the next; a corrupt size in the very first cell of a bin is
//! fatal (nothing downstream can be trusted), but a corrupt size encountered
//! later is treated as the start of trailing zero padding and ends iteration
//! rather than failing it.

use crate::error::{RegistryError, Result};
use crate::primitives::{read_u32_le, write_u32_le};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of the hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Hive bin header.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    pub signature: [u8; 4],
    /// Offset of this bin relative to the first bin (0x1000).
    pub offset: u32,
    /// Size of this bin in bytes, including the header. Always a multiple of 4096.
    pub size: u32,
    pub reserved: [u32; 2],
    pub timestamp: u64,
    pub spare: u32,
}

impl HbinHeader {
    /// Parses an hbin header, checking its signature, that `offset` matches
    /// the position it was found at, and that `size` is a nonzero multiple
    /// of 4096.
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::truncated(
                expected_offset,
                format!("hbin header needs {HBIN_HEADER_SIZE} bytes, found {}", data.len()),
            ));
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);
        if &signature != HBIN_SIGNATURE {
            return Err(RegistryError::format_invalid(
                expected_offset,
                format!("bad hbin signature: {signature:?}"),
            ));
        }

        let offset = read_u32_le(data, 0x04)?;
        if offset != expected_offset {
            return Err(RegistryError::format_invalid(
                expected_offset,
                format!("hbin offset mismatch: header says {offset:#x}, found at {expected_offset:#x}"),
            ));
        }

        let size = read_u32_le(data, 0x08)?;
        if size == 0 || size % 4096 != 0 {
            return Err(RegistryError::format_invalid(
                expected_offset,
                format!("hbin size {size:#x} is zero or not a multiple of 4096"),
            ));
        }

        let reserved = [read_u32_le(data, 0x0C)?, read_u32_le(data, 0x10)?];
        let timestamp = u64::from(read_u32_le(data, 0x14)?) | (u64::from(read_u32_le(data, 0x18)?) << 32);
        let spare = read_u32_le(data, 0x1C)?;

        Ok(HbinHeader {
            signature,
            offset,
            size,
            reserved,
            timestamp,
            spare,
        })
    }

    /// Writes a fresh hbin header at the start of `data` (used when the
    /// allocator appends a new bin).
    pub fn write_new(data: &mut [u8], offset: u32, size: u32) -> Result<()> {
        data.get_mut(0..4)
            .ok_or_else(|| RegistryError::truncated(offset, "not enough room for hbin header"))?
            .copy_from_slice(HBIN_SIGNATURE);
        write_u32_le(data, 0x04, offset)?;
        write_u32_le(data, 0x08, size)?;
        write_u32_le(data, 0x0C, 0)?;
        write_u32_le(data, 0x10, 0)?;
        write_u32_le(data, 0x14, 0)?;
        write_u32_le(data, 0x18, 0)?;
        write_u32_le(data, 0x1C, 0)
    }

    pub fn data_size(&self) -> u32 {
        self.size.saturating_sub(HBIN_HEADER_SIZE as u32)
    }
}

/// Walks the cells within a single bin's data area (the bytes after its header).
pub struct HbinCellIterator<'a> {
    data: &'a [u8],
    offset: usize,
    hbin_offset: u32,
}

impl<'a> HbinCellIterator<'a> {
    /// `data` is the bin's data area (header already stripped); `hbin_offset`
    /// is this bin's own relative offset, used to compute absolute cell offsets.
    pub fn new(data: &'a [u8], hbin_offset: u32) -> Self {
        Self {
            data,
            offset: 0,
            hbin_offset,
        }
    }
}

impl<'a> Iterator for HbinCellIterator<'a> {
    type Item = Result<CellInfo<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let at_first_cell = self.offset == 0;
        let cell_offset = self.hbin_offset + HBIN_HEADER_SIZE as u32 + self.offset as u32;

        let raw = match read_u32_le(self.data, self.offset) {
            Ok(v) => v as i32,
            Err(e) => {
                return if at_first_cell {
                    Some(Err(e))
                } else {
                    None
                }
            }
        };

        if raw == 0 {
            // Trailing zero padding out to the end of the bin.
            return None;
        }

        let abs_size = raw.unsigned_abs() as usize;
        if abs_size < 8 || abs_size % 8 != 0 {
            return if at_first_cell {
                Some(Err(RegistryError::format_invalid(
                    cell_offset,
                    format!("first cell of bin has implausible size {raw:#x}"),
                )))
            } else {
                None
            };
        }

        let data_start = self.offset + 4;
        let data_end = self.offset + abs_size;
        if data_end > self.data.len() {
            return if at_first_cell {
                Some(Err(RegistryError::truncated(
                    cell_offset,
                    format!("cell claims {abs_size} bytes but only {} remain", self.data.len() - self.offset),
                )))
            } else {
                None
            };
        }

        let cell_info = CellInfo {
            offset: cell_offset,
            size: abs_size as u32,
            is_allocated: raw < 0,
            data: &self.data[data_start..data_end],
        };

        self.offset = data_end;
        Some(Ok(cell_info))
    }
}

/// One cell within a bin, as found by `HbinCellIterator`.
#[derive(Debug)]
pub struct CellInfo<'a> {
    /// Absolute offset of this cell's size field, relative to the first bin.
    pub offset: u32,
    /// Total cell size including the 4-byte size field.
    pub size: u32,
    pub is_allocated: bool,
    /// Cell payload, excluding the size field.
    pub data: &'a [u8],
}

impl<'a> CellInfo<'a> {
    /// The 2-byte record signature at the start of the payload, if present.
    pub fn cell_type(&self) -> Option<[u8; 2]> {
        if self.data.len() >= 2 {
            Some([self.data[0], self.data[1]])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::write_u32_le;

    fn bin_with_cells(cell_sizes: &[i32]) -> Vec<u8> {
        let total: i32 = cell_sizes.iter().map(|s| s.abs()).sum();
        let mut data = vec![0u8; total as usize];
        let mut pos = 0usize;
        for &size in cell_sizes {
            write_u32_le(&mut data, pos, size as u32).unwrap();
            pos += size.unsigned_abs() as usize;
        }
        data
    }

    #[test]
    fn test_hbin_header_size_constant() {
        assert_eq!(HBIN_HEADER_SIZE, 32);
    }

    #[test]
    fn test_hbin_header_roundtrip() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        HbinHeader::write_new(&mut data, 0x1000, 0x2000).unwrap();
        let header = HbinHeader::parse(&data, 0x1000).unwrap();
        assert_eq!(header.size, 0x2000);
    }

    #[test]
    fn test_hbin_header_rejects_bad_signature() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        data[0..4].copy_from_slice(b"XXXX");
        assert!(HbinHeader::parse(&data, 0).is_err());
    }

    #[test]
    fn test_hbin_header_rejects_misaligned_size() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        HbinHeader::write_new(&mut data, 0, 100).unwrap();
        assert!(HbinHeader::parse(&data, 0).is_err());
    }

    #[test]
    fn test_cell_iterator_walks_allocated_and_free_cells() {
        let data = bin_with_cells(&[-32, 16]);
        let cells: Vec<_> = HbinCellIterator::new(&data, 0x1000)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(cells.len(), 2);
        assert!(cells[0].is_allocated);
        assert_eq!(cells[0].size, 32);
        assert!(!cells[1].is_allocated);
        assert_eq!(cells[1].size, 16);
    }

    #[test]
    fn test_trailing_padding_ends_iteration_quietly() {
        let mut data = bin_with_cells(&[-32]);
        data.extend_from_slice(&[0u8; 16]);
        let cells: Vec<_> = HbinCellIterator::new(&data, 0x1000)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(cells.len(), 1);
    }

    #[test]
    fn test_corrupt_first_cell_is_an_error() {
        let mut data = vec![0u8; 32];
        write_u32_le(&mut data, 0, 3).unwrap(); // implausible, not a multiple of 8
        let mut iter = HbinCellIterator::new(&data, 0x1000);
        assert!(iter.next().unwrap().is_err());
    }

    #[test]
    fn test_corrupt_later_cell_ends_iteration_without_error() {
        let mut data = bin_with_cells(&[-16]);
        data.extend_from_slice(&3u32.to_le_bytes()); // garbage tail, not first cell
        data.extend_from_slice(&[0u8; 12]);
        let cells: Vec<_> = HbinCellIterator::new(&data, 0)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(cells.len(), 1);
    }
}
