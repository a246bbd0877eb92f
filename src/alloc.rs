//! Cell allocator: size-classed free lists over the bin region, with
//! split-on-allocate, forward coalesce-on-free, and bin/file growth.
//!
//! Cells don't carry a back-pointer, so a freed cell can only be merged with
//! the cell physically following it, never the one before — merging
//! backward would require rescanning the whole bin to find who points at
//! it. That asymmetry is a property of the format, not a shortcut taken
//! here.

use crate::base_block::BaseBlock;
use crate::error::{RegistryError, Result};
use crate::hbin::{CellInfo, HbinCellIterator, HbinHeader, HBIN_HEADER_SIZE};
use crate::primitives::{cell_offset_to_absolute, read_i32_le, write_i32_le, write_u32_le};
use crate::storage::Backing;
use std::collections::BTreeMap;

/// Smallest cell size the allocator will ever hand out or track as free.
const MIN_CELL_SIZE: u32 = 8;

fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

fn align_4096(n: u32) -> u32 {
    (n + 4095) & !4095
}

/// Free-list allocator for a single hive's bin region.
///
/// Free cells are indexed by their exact size in a `BTreeMap`, which
/// supports an O(log n) "smallest sufficient" lookup via a range query.
/// New splits are sized up to the next allocation-friendly boundary
/// (`align8`), so over time cell sizes cluster into a handful of common
/// buckets even though the map itself doesn't enforce strict power-of-two
/// classes.
#[derive(Default)]
pub struct Allocator {
    free: BTreeMap<u32, Vec<u32>>,
    /// `(start, size)` of every known bin, relative cell offsets, sorted by
    /// `start`. Used to stop forward coalescing at a bin boundary, since a
    /// cell's size field can never be trusted to predict what lies in the
    /// next bin's header.
    bins: Vec<(u32, u32)>,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator { free: BTreeMap::new(), bins: Vec::new() }
    }

    /// Rebuilds the free list from scratch by walking every bin. Called once
    /// when a hive is opened for writing.
    pub fn scan(&mut self, backing: &Backing, base_block: &BaseBlock) -> Result<()> {
        self.free.clear();
        self.bins.clear();
        let mut hbin_offset = 0u32;
        while hbin_offset < base_block.data_size {
            let abs = cell_offset_to_absolute(hbin_offset)? as usize;
            let header = HbinHeader::parse(&backing.as_slice()[abs..], hbin_offset)?;
            let data_start = abs + HBIN_HEADER_SIZE;
            let data_end = abs + header.size as usize;
            let bin_data = &backing.as_slice()[data_start..data_end];
            for cell in HbinCellIterator::new(bin_data, hbin_offset) {
                let cell: CellInfo = cell?;
                if !cell.is_allocated {
                    self.insert_free(cell.offset, cell.size);
                }
            }
            self.bins.push((hbin_offset, header.size));
            hbin_offset += header.size;
        }
        Ok(())
    }

    /// The end (exclusive, relative cell offset) of the bin containing
    /// `offset`, if known.
    fn bin_end_containing(&self, offset: u32) -> Option<u32> {
        self.bins
            .iter()
            .find(|&&(start, size)| offset >= start && offset < start + size)
            .map(|&(start, size)| start + size)
    }

    fn insert_free(&mut self, offset: u32, size: u32) {
        self.free.entry(size).or_default().push(offset);
    }

    fn remove_free(&mut self, offset: u32, size: u32) {
        if let Some(offsets) = self.free.get_mut(&size) {
            offsets.retain(|&o| o != offset);
            if offsets.is_empty() {
                self.free.remove(&size);
            }
        }
    }

    /// Allocates a cell able to hold `payload_len` bytes, returning its
    /// relative offset with the cell marked allocated. Grows the hive if no
    /// free cell is large enough.
    pub fn allocate(&mut self, backing: &mut Backing, base_block: &mut BaseBlock, payload_len: usize) -> Result<u32> {
        let needed = align8(payload_len as u32 + 4).max(MIN_CELL_SIZE);
        self.allocate_total(backing, base_block, needed)
    }

    fn allocate_total(&mut self, backing: &mut Backing, base_block: &mut BaseBlock, needed: u32) -> Result<u32> {
        let found = self.free.range(needed..).next().map(|(&size, offsets)| (size, offsets[offsets.len() - 1]));

        if let Some((size, offset)) = found {
            self.remove_free(offset, size);
            self.split_and_mark_allocated(backing, offset, size, needed)?;
            return Ok(offset);
        }

        self.grow(backing, base_block, needed)?;
        self.allocate_total(backing, base_block, needed)
    }

    fn split_and_mark_allocated(&mut self, backing: &mut Backing, offset: u32, free_size: u32, needed: u32) -> Result<()> {
        let remainder = free_size - needed;
        if remainder >= MIN_CELL_SIZE {
            let abs = cell_offset_to_absolute(offset)? as usize;
            write_i32_le(backing.as_mut_slice(), abs, -(needed as i32))?;

            let remainder_offset = offset + needed;
            let remainder_abs = cell_offset_to_absolute(remainder_offset)? as usize;
            write_u32_le(backing.as_mut_slice(), remainder_abs, remainder)?;
            self.insert_free(remainder_offset, remainder);
        } else {
            let abs = cell_offset_to_absolute(offset)? as usize;
            write_i32_le(backing.as_mut_slice(), abs, -(free_size as i32))?;
        }
        Ok(())
    }

    /// Frees a previously allocated cell, coalescing it with the cell
    /// immediately following it if that one is also free.
    pub fn free(&mut self, backing: &mut Backing, offset: u32) -> Result<()> {
        let abs = cell_offset_to_absolute(offset)? as usize;
        let raw = read_i32_le(backing.as_slice(), abs)?;
        if raw >= 0 {
            return Err(RegistryError::ref_out_of_range(offset, "cell is already free"));
        }
        let mut size = raw.unsigned_abs();
        write_u32_le(backing.as_mut_slice(), abs, size)?;

        size = self.try_coalesce_forward(backing, offset, size)?;
        self.insert_free(offset, size);
        Ok(())
    }

    fn try_coalesce_forward(&mut self, backing: &mut Backing, offset: u32, size: u32) -> Result<u32> {
        let next_offset = offset + size;
        // Never merge across a bin boundary: the next bin starts with its own
        // 32-byte "hbin" header, not a cell, and reading its signature bytes
        // as a cell size would corrupt the free list and the header both.
        if let Some(bin_end) = self.bin_end_containing(offset) {
            if next_offset >= bin_end {
                return Ok(size);
            }
        }
        let Ok(abs_next) = cell_offset_to_absolute(next_offset) else {
            return Ok(size);
        };
        let abs_next = abs_next as usize;
        if abs_next + 4 > backing.len() {
            return Ok(size);
        }
        let Ok(raw_next) = read_i32_le(backing.as_slice(), abs_next) else {
            return Ok(size);
        };
        if raw_next <= 0 {
            return Ok(size);
        }

        let next_size = raw_next as u32;
        self.remove_free(next_offset, next_size);
        let merged = size + next_size;
        let abs = cell_offset_to_absolute(offset)? as usize;
        write_u32_le(backing.as_mut_slice(), abs, merged)?;
        Ok(merged)
    }

    /// Appends a new bin (at least `4096` bytes, large enough to hold
    /// `needed`) and registers its single free cell.
    fn grow(&mut self, backing: &mut Backing, base_block: &mut BaseBlock, needed: u32) -> Result<()> {
        let min_bin_size = align_4096(HBIN_HEADER_SIZE as u32 + needed);
        let bin_size = min_bin_size.max(4096);
        let new_bin_offset = base_block.data_size;

        backing.grow_by(bin_size as usize)?;

        let abs = cell_offset_to_absolute(new_bin_offset)? as usize;
        HbinHeader::write_new(&mut backing.as_mut_slice()[abs..abs + HBIN_HEADER_SIZE], new_bin_offset, bin_size)?;

        let free_cell_offset = new_bin_offset + HBIN_HEADER_SIZE as u32;
        let free_cell_size = bin_size - HBIN_HEADER_SIZE as u32;
        let free_abs = cell_offset_to_absolute(free_cell_offset)? as usize;
        write_u32_le(backing.as_mut_slice(), free_abs, free_cell_size)?;

        base_block.bump_data_size(backing.as_mut_slice(), bin_size)?;
        self.insert_free(free_cell_offset, free_cell_size);
        self.bins.push((new_bin_offset, bin_size));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_block::{BaseBlock, BASE_BLOCK_SIZE, REGF_SIGNATURE};
    use crate::hbin::HBIN_SIGNATURE;
    use crate::primitives::{calculate_checksum, write_u32_le};

    fn fresh_hive() -> (Backing, BaseBlock) {
        let mut data = vec![0u8; BASE_BLOCK_SIZE + 4096];
        data[0..4].copy_from_slice(REGF_SIGNATURE);
        write_u32_le(&mut data, 0x04, 1).unwrap();
        write_u32_le(&mut data, 0x08, 1).unwrap();
        write_u32_le(&mut data, 0x14, 1).unwrap();
        write_u32_le(&mut data, 0x18, 5).unwrap();
        write_u32_le(&mut data, 0x24, 0x20).unwrap();
        write_u32_le(&mut data, 0x28, 4096).unwrap();
        // One bin with one free cell filling it.
        HbinHeader::write_new(&mut data[BASE_BLOCK_SIZE..BASE_BLOCK_SIZE + HBIN_HEADER_SIZE], 0, 4096).unwrap();
        write_u32_le(&mut data, BASE_BLOCK_SIZE + HBIN_HEADER_SIZE, 4096 - HBIN_HEADER_SIZE as u32).unwrap();
        let checksum = calculate_checksum(&data);
        write_u32_le(&mut data, 0x1FC, checksum).unwrap();

        let base_block = BaseBlock::parse(&data).unwrap();
        (Backing::from_vec(data), base_block)
    }

    #[test]
    fn test_scan_finds_the_initial_free_cell() {
        let (backing, base_block) = fresh_hive();
        let mut alloc = Allocator::new();
        alloc.scan(&backing, &base_block).unwrap();
        assert_eq!(alloc.free.values().map(|v| v.len()).sum::<usize>(), 1);
    }

    #[test]
    fn test_allocate_splits_a_large_free_cell() {
        let (mut backing, mut base_block) = fresh_hive();
        let mut alloc = Allocator::new();
        alloc.scan(&backing, &base_block).unwrap();

        let offset = alloc.allocate(&mut backing, &mut base_block, 40).unwrap();
        let abs = cell_offset_to_absolute(offset).unwrap() as usize;
        let raw = read_i32_le(backing.as_slice(), abs).unwrap();
        assert!(raw < 0, "allocated cell should have negative size");
        assert!(raw.unsigned_abs() >= 44);
    }

    #[test]
    fn test_free_then_allocate_reuses_cell() {
        let (mut backing, mut base_block) = fresh_hive();
        let mut alloc = Allocator::new();
        alloc.scan(&backing, &base_block).unwrap();

        let offset = alloc.allocate(&mut backing, &mut base_block, 40).unwrap();
        alloc.free(&mut backing, offset).unwrap();
        let offset2 = alloc.allocate(&mut backing, &mut base_block, 40).unwrap();
        assert_eq!(offset, offset2);
    }

    #[test]
    fn test_allocate_grows_when_nothing_fits() {
        let (mut backing, mut base_block) = fresh_hive();
        let mut alloc = Allocator::new();
        alloc.scan(&backing, &base_block).unwrap();

        let before = base_block.data_size;
        alloc.allocate(&mut backing, &mut base_block, 5000).unwrap();
        assert!(base_block.data_size > before);
    }

    #[test]
    fn test_coalesce_forward_never_crosses_a_bin_boundary() {
        let (mut backing, mut base_block) = fresh_hive();
        let mut alloc = Allocator::new();
        alloc.scan(&backing, &base_block).unwrap();

        // Consume bin 0's single free cell (4064 bytes, exactly) so the last
        // allocated cell ends precisely at the bin boundary.
        let last_cell = alloc.allocate(&mut backing, &mut base_block, 4060).unwrap();
        let abs = cell_offset_to_absolute(last_cell).unwrap() as usize;
        assert_eq!(read_i32_le(backing.as_slice(), abs).unwrap().unsigned_abs(), 4064);

        // Force growth: bin 0 has nothing left, so this allocates a new bin.
        let bin0_size = base_block.data_size;
        alloc.allocate(&mut backing, &mut base_block, 16).unwrap();
        assert!(base_block.data_size > bin0_size, "expected a second bin to be appended");

        // Freeing the last cell of bin 0 must not wander into bin 1's header.
        alloc.free(&mut backing, last_cell).unwrap();

        let bin1_abs = cell_offset_to_absolute(bin0_size).unwrap() as usize;
        let bin1_header = HbinHeader::parse(&backing.as_slice()[bin1_abs..], bin0_size).unwrap();
        assert_eq!(&bin1_header.signature, HBIN_SIGNATURE);

        let freed_abs = cell_offset_to_absolute(last_cell).unwrap() as usize;
        let freed_size = read_i32_le(backing.as_slice(), freed_abs).unwrap();
        assert_eq!(freed_size as u32, 4064, "freed cell must not merge across the bin boundary");
    }

    #[test]
    fn test_coalesce_forward_merges_adjacent_free_cells() {
        let (mut backing, mut base_block) = fresh_hive();
        let mut alloc = Allocator::new();
        alloc.scan(&backing, &base_block).unwrap();

        let a = alloc.allocate(&mut backing, &mut base_block, 16).unwrap();
        let b = alloc.allocate(&mut backing, &mut base_block, 16).unwrap();
        alloc.free(&mut backing, a).unwrap();
        alloc.free(&mut backing, b).unwrap();

        let abs_a = cell_offset_to_absolute(a).unwrap() as usize;
        let merged_size = read_i32_le(backing.as_slice(), abs_a).unwrap();
        assert!(merged_size > 0);
        assert!(merged_size as u32 >= 48);
    }
}
