//! Shared helper for building a minimal, valid, in-memory hive for the
//! integration tests. There's no real `test_data/*.dat` corpus checked into
//! this workspace, so every test that needs an actual hive builds one from
//! scratch through the crate's own public low-level pieces rather than
//! hand-assembling bytes by hand.

use hive_engine::alloc::Allocator;
use hive_engine::base_block::{BaseBlock, BASE_BLOCK_SIZE, REGF_SIGNATURE};
use hive_engine::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use hive_engine::key::KeyNode;
use hive_engine::primitives::{calculate_checksum, cell_offset_to_absolute, write_u32_le};
use hive_engine::storage::Backing;

/// A single bin, holding a single allocated cell: an empty root key node.
pub fn build_empty_hive() -> Vec<u8> {
    let bin_size = 4096u32;
    let mut data = vec![0u8; BASE_BLOCK_SIZE + bin_size as usize];
    data[0..4].copy_from_slice(REGF_SIGNATURE);
    write_u32_le(&mut data, 0x04, 1).unwrap(); // primary sequence
    write_u32_le(&mut data, 0x08, 1).unwrap(); // secondary sequence
    write_u32_le(&mut data, 0x14, 1).unwrap(); // major version
    write_u32_le(&mut data, 0x18, 5).unwrap(); // minor version
    write_u32_le(&mut data, 0x24, 0x20).unwrap(); // root cell offset (placeholder)
    write_u32_le(&mut data, 0x28, bin_size).unwrap();
    HbinHeader::write_new(&mut data[BASE_BLOCK_SIZE..BASE_BLOCK_SIZE + HBIN_HEADER_SIZE], 0, bin_size).unwrap();
    write_u32_le(&mut data, BASE_BLOCK_SIZE + HBIN_HEADER_SIZE, bin_size - HBIN_HEADER_SIZE as u32).unwrap();
    let checksum = calculate_checksum(&data);
    write_u32_le(&mut data, 0x1FC, checksum).unwrap();

    let mut base_block = BaseBlock::parse(&data).unwrap();
    let mut backing = Backing::from_vec(data);
    let mut allocator = Allocator::new();
    allocator.scan(&backing, &base_block).unwrap();

    let root = KeyNode::new("", 0, true);
    let payload = root.to_bytes();
    let offset = allocator.allocate(&mut backing, &mut base_block, payload.len()).unwrap();
    let abs = cell_offset_to_absolute(offset).unwrap() as usize;
    backing.as_mut_slice()[abs + 4..abs + 4 + payload.len()].copy_from_slice(&payload);
    base_block.set_root_cell_offset(backing.as_mut_slice(), offset).unwrap();
    base_block.recompute_checksum(backing.as_mut_slice()).unwrap();

    match backing {
        Backing::Owned(v) => v,
        Backing::Mapped { .. } => unreachable!(),
    }
}

/// Writes `build_empty_hive()`'s bytes to a temp file and returns the handle
/// (dropping it deletes the file), for tests exercising `Hive::open`.
pub fn write_empty_hive_to_tempfile() -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&build_empty_hive()).unwrap();
    file.flush().unwrap();
    file
}
