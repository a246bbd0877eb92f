//! Composed editing operations: ensure-key-path, value upsert/delete,
//! key delete, all built on top of `alloc.rs` (cell lifetime) and
//! `index.rs` (subkey ordering).
//!
//! Every operation here reads whatever records it touches fresh from
//! `Backing`, mutates its own copy, and writes back — there is no
//! in-memory tree kept between calls. That costs a re-parse per hop, but
//! keeps this module free of a cache-invalidation story; `name_cache.rs`
//! covers the hot path for readers instead.

use crate::alloc::Allocator;
use crate::base_block::BaseBlock;
use crate::bigdata::{BigDataBlock, BIG_DATA_CHUNK_SIZE};
use crate::cell::ValueType;
use crate::dirty::DirtyTracker;
use crate::error::{RegistryError, Result};
use crate::index::{self, NamedChild};
use crate::key::KeyNode;
use crate::primitives::{cell_offset_to_absolute, read_i32_le, read_u32_le};
use crate::security::SecurityDescriptor;
use crate::storage::Backing;
use crate::subkey_list::SubkeyList;
use crate::value::ValueKey;

fn read_cell(backing: &Backing, rel_offset: u32) -> Result<Vec<u8>> {
    let abs = cell_offset_to_absolute(rel_offset)? as usize;
    let raw = read_i32_le(backing.as_slice(), abs)?;
    let abs_size = raw.unsigned_abs() as usize;
    backing
        .as_slice()
        .get(abs + 4..abs + abs_size)
        .map(|s| s.to_vec())
        .ok_or_else(|| RegistryError::truncated(rel_offset, "cell payload runs past end"))
}

fn overwrite_cell(backing: &mut Backing, dirty: &mut DirtyTracker, rel_offset: u32, payload: &[u8]) -> Result<()> {
    let abs = cell_offset_to_absolute(rel_offset)? as usize;
    let raw = read_i32_le(backing.as_slice(), abs)?;
    let abs_size = raw.unsigned_abs() as usize;
    if 4 + payload.len() > abs_size {
        return Err(RegistryError::ref_out_of_range(
            rel_offset,
            "new payload no longer fits in its existing cell",
        ));
    }
    let dest = backing
        .as_mut_slice()
        .get_mut(abs + 4..abs + 4 + payload.len())
        .ok_or_else(|| RegistryError::truncated(rel_offset, "cell payload runs past end"))?;
    dest.copy_from_slice(payload);
    dirty.mark(abs as u32, (abs + 4 + payload.len()) as u32);
    Ok(())
}

fn allocate_record(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    payload: &[u8],
) -> Result<u32> {
    let offset = alloc.allocate(backing, base_block, payload.len())?;
    let abs = cell_offset_to_absolute(offset)? as usize;
    let raw = read_i32_le(backing.as_slice(), abs)?;
    let abs_size = raw.unsigned_abs() as usize;
    backing.as_mut_slice()[abs + 4..abs + 4 + payload.len()].copy_from_slice(payload);
    dirty.mark(abs as u32, (abs + abs_size) as u32);
    Ok(offset)
}

fn free_record(alloc: &mut Allocator, backing: &mut Backing, dirty: &mut DirtyTracker, offset: u32) -> Result<()> {
    let abs = cell_offset_to_absolute(offset)? as usize;
    let raw = read_i32_le(backing.as_slice(), abs)?;
    let abs_size = raw.unsigned_abs() as usize;
    alloc.free(backing, offset)?;
    dirty.mark(abs as u32, (abs + abs_size) as u32);
    Ok(())
}

pub fn read_key_node(backing: &Backing, offset: u32) -> Result<KeyNode> {
    KeyNode::parse(&read_cell(backing, offset)?, offset)
}

fn read_value_key(backing: &Backing, offset: u32) -> Result<ValueKey> {
    ValueKey::parse(&read_cell(backing, offset)?, offset)
}

fn read_security(backing: &Backing, offset: u32) -> Result<SecurityDescriptor> {
    SecurityDescriptor::parse(&read_cell(backing, offset)?, offset)
}

fn normalize_display_name(name: &str) -> &str {
    if name.is_empty() {
        "(default)"
    } else {
        name
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_uppercase() == b.to_uppercase()
}

/// Resolves a subkey index's leaf offsets, flattening one level of `ri`.
fn leaf_offsets(backing: &Backing, list_offset: u32) -> Result<Vec<u32>> {
    let list = SubkeyList::parse(&read_cell(backing, list_offset)?, list_offset)?;
    match list {
        SubkeyList::IndexRoot(offsets) => Ok(offsets),
        _ => Ok(vec![list_offset]),
    }
}

/// All direct children of `parent_offset`, with names resolved.
pub fn list_children(backing: &Backing, parent_offset: u32) -> Result<Vec<NamedChild>> {
    let parent = read_key_node(backing, parent_offset)?;
    let Some(list_offset) = parent.resolve_subkey_index() else {
        return Ok(Vec::new());
    };
    let mut children = Vec::new();
    for leaf in leaf_offsets(backing, list_offset)? {
        let list = SubkeyList::parse(&read_cell(backing, leaf)?, leaf)?;
        for key_offset in list.key_offsets_iter() {
            let child = read_key_node(backing, key_offset)?;
            children.push(NamedChild { name: child.name, key_offset });
        }
    }
    Ok(children)
}

/// Finds a direct child of `parent_offset` by case-insensitive name.
pub fn find_child(backing: &Backing, parent_offset: u32, name: &str) -> Result<Option<u32>> {
    Ok(list_children(backing, parent_offset)?
        .into_iter()
        .find(|c| same_name(&c.name, name))
        .map(|c| c.key_offset))
}

fn free_subkey_index(
    alloc: &mut Allocator,
    backing: &mut Backing,
    dirty: &mut DirtyTracker,
    list_offset: Option<u32>,
) -> Result<()> {
    let Some(list_offset) = list_offset else {
        return Ok(());
    };
    let list = SubkeyList::parse(&read_cell(backing, list_offset)?, list_offset)?;
    if let SubkeyList::IndexRoot(leaves) = &list {
        for &leaf in leaves {
            free_record(alloc, backing, dirty, leaf)?;
        }
    }
    free_record(alloc, backing, dirty, list_offset)
}

fn write_subkey_index(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    children: &[NamedChild],
) -> Result<Option<u32>> {
    if children.is_empty() {
        return Ok(None);
    }
    let leaf = index::build_leaf(children, base_block.minor_version).expect("children is non-empty");
    if !index::should_split(&leaf) {
        let offset = allocate_record(alloc, backing, base_block, dirty, &leaf.to_bytes())?;
        return Ok(Some(offset));
    }
    let (left, right) = index::split_leaf(&leaf);
    let left_off = allocate_record(alloc, backing, base_block, dirty, &left.to_bytes())?;
    let right_off = allocate_record(alloc, backing, base_block, dirty, &right.to_bytes())?;
    let root = index::build_root(&[left_off, right_off]);
    let root_off = allocate_record(alloc, backing, base_block, dirty, &root.to_bytes())?;
    Ok(Some(root_off))
}

/// Replaces `parent_offset`'s full set of children with `new_children`,
/// freeing the old subkey-index cells and writing fresh ones.
fn set_children(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    parent_offset: u32,
    new_children: Vec<NamedChild>,
) -> Result<()> {
    let mut parent = read_key_node(backing, parent_offset)?;
    let old_list_offset = parent.resolve_subkey_index();
    free_subkey_index(alloc, backing, dirty, old_list_offset)?;
    let new_offset = write_subkey_index(alloc, backing, base_block, dirty, &new_children)?;
    parent.set_subkey_index(new_offset, new_children.len() as u32);
    overwrite_cell(backing, dirty, parent_offset, &parent.to_bytes())
}

fn insert_child(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    parent_offset: u32,
    child: NamedChild,
) -> Result<()> {
    let mut children = list_children(backing, parent_offset)?;
    children.push(child);
    set_children(alloc, backing, base_block, dirty, parent_offset, children)
}

fn remove_child(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    parent_offset: u32,
    child_offset: u32,
) -> Result<()> {
    let children: Vec<_> = list_children(backing, parent_offset)?
        .into_iter()
        .filter(|c| c.key_offset != child_offset)
        .collect();
    set_children(alloc, backing, base_block, dirty, parent_offset, children)
}

/// Walks `segments` under `root_offset`, creating any missing key along the
/// way. Returns the final segment's offset and how many keys were created.
/// Idempotent: calling again with the same path creates nothing.
pub fn ensure_key_path(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    root_offset: u32,
    segments: &[&str],
) -> Result<(u32, u32)> {
    let mut current = root_offset;
    let mut created = 0u32;

    for &segment in segments {
        if let Some(existing) = find_child(backing, current, segment)? {
            current = existing;
            continue;
        }

        let parent = read_key_node(backing, current)?;
        let mut new_key = KeyNode::new(segment, current, false);
        if let Some(sk_offset) = parent.resolve_security() {
            let mut sk = read_security(backing, sk_offset)?;
            sk.reference_count += 1;
            overwrite_cell(backing, dirty, sk_offset, &sk.to_bytes())?;
            new_key.set_security(Some(sk_offset));
        }

        let new_offset = allocate_record(alloc, backing, base_block, dirty, &new_key.to_bytes())?;
        insert_child(
            alloc,
            backing,
            base_block,
            dirty,
            current,
            NamedChild { name: segment.to_string(), key_offset: new_offset },
        )?;
        current = new_offset;
        created += 1;
    }

    Ok((current, created))
}

fn read_value_list(backing: &Backing, offset: u32, count: u32) -> Result<Vec<u32>> {
    let payload = read_cell(backing, offset)?;
    (0..count as usize).map(|i| read_u32_le(&payload, i * 4)).collect()
}

fn encode_value_list(offsets: &[u32]) -> Vec<u8> {
    offsets.iter().flat_map(|o| o.to_le_bytes()).collect()
}

fn update_value_list(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    key_offset: u32,
    new_offsets: Vec<u32>,
) -> Result<()> {
    let mut key = read_key_node(backing, key_offset)?;
    if let Some(old) = key.resolve_value_list() {
        free_record(alloc, backing, dirty, old)?;
    }
    let new_offset = if new_offsets.is_empty() {
        None
    } else {
        Some(allocate_record(alloc, backing, base_block, dirty, &encode_value_list(&new_offsets))?)
    };
    key.set_value_list(new_offset, new_offsets.len() as u32);
    overwrite_cell(backing, dirty, key_offset, &key.to_bytes())
}

/// Allocates storage for `data` and builds the `ValueKey` pointing at it,
/// per the inline / single-cell / big-data routing in the upsert-value
/// algorithm: `len <= 4` inline, `4 < len <= 16344` one data cell, larger
/// values chunked across `db` segments.
fn route_value_data(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    name: &str,
    data_type: ValueType,
    data: &[u8],
) -> Result<ValueKey> {
    if data.len() <= 4 {
        return Ok(ValueKey::new_inline(name, data_type, data));
    }
    if data.len() <= BIG_DATA_CHUNK_SIZE {
        let cell_offset = allocate_record(alloc, backing, base_block, dirty, data)?;
        return Ok(ValueKey::new_external(name, data_type, data.len() as u32, cell_offset));
    }

    let chunks = BigDataBlock::chunk(data);
    let mut chunk_offsets = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        chunk_offsets.push(allocate_record(alloc, backing, base_block, dirty, chunk)?);
    }
    let segment_list_offset =
        allocate_record(alloc, backing, base_block, dirty, &BigDataBlock::encode_segment_list(&chunk_offsets))?;
    let header = BigDataBlock::new(chunk_offsets.len() as u16, segment_list_offset);
    let header_offset = allocate_record(alloc, backing, base_block, dirty, &header.to_bytes())?;
    Ok(ValueKey::new_external(name, data_type, data.len() as u32, header_offset))
}

fn free_value_data(alloc: &mut Allocator, backing: &mut Backing, dirty: &mut DirtyTracker, vk: &ValueKey) -> Result<()> {
    if vk.is_inline_data() || vk.length() == 0 {
        return Ok(());
    }
    if vk.length() as usize > BIG_DATA_CHUNK_SIZE {
        let header = BigDataBlock::parse(&read_cell(backing, vk.data_offset)?, vk.data_offset)?;
        let offsets =
            BigDataBlock::parse_segment_list(&read_cell(backing, header.segment_list_offset)?, header.segment_count, header.segment_list_offset)?;
        for off in offsets {
            free_record(alloc, backing, dirty, off)?;
        }
        free_record(alloc, backing, dirty, header.segment_list_offset)?;
        free_record(alloc, backing, dirty, vk.data_offset)?;
    } else {
        free_record(alloc, backing, dirty, vk.data_offset)?;
    }
    Ok(())
}

/// Finds the value named `name` under `key_offset`, if any.
pub fn find_value(backing: &Backing, key_offset: u32, name: &str) -> Result<Option<ValueKey>> {
    let key = read_key_node(backing, key_offset)?;
    let Some(vl) = key.resolve_value_list() else {
        return Ok(None);
    };
    let target = normalize_display_name(name);
    for vk_off in read_value_list(backing, vl, key.value_count)? {
        let vk = read_value_key(backing, vk_off)?;
        if same_name(&vk.name, target) {
            return Ok(Some(vk));
        }
    }
    Ok(None)
}

/// All values directly held by `key_offset`.
pub fn list_values(backing: &Backing, key_offset: u32) -> Result<Vec<ValueKey>> {
    let key = read_key_node(backing, key_offset)?;
    let Some(vl) = key.resolve_value_list() else {
        return Ok(Vec::new());
    };
    read_value_list(backing, vl, key.value_count)?
        .into_iter()
        .map(|off| read_value_key(backing, off))
        .collect()
}

/// Reads a value's data bytes, following inline/external/big-data storage as
/// `vk` describes it. Always trimmed to `vk.length()`, since an external
/// cell's allocated size can be larger than the data it holds (allocation
/// rounds up to an 8-byte boundary).
pub fn read_value_data(backing: &Backing, vk: &ValueKey) -> Result<Vec<u8>> {
    if vk.is_inline_data() {
        return Ok(vk.inline_data());
    }
    if vk.length() == 0 {
        return Ok(Vec::new());
    }
    let mut data = if vk.length() as usize > BIG_DATA_CHUNK_SIZE {
        let header = BigDataBlock::parse(&read_cell(backing, vk.data_offset)?, vk.data_offset)?;
        let offsets = BigDataBlock::parse_segment_list(
            &read_cell(backing, header.segment_list_offset)?,
            header.segment_count,
            header.segment_list_offset,
        )?;
        let mut data = Vec::with_capacity(vk.length() as usize);
        for off in offsets {
            let segment = read_cell(backing, off)?;
            // Each chunk's cell is allocated with `allocate_record(chunk)`, which
            // rounds up to an 8-byte boundary, so the last 4 bytes of every
            // segment's payload are allocator slack, not chunk data.
            let chunk_len = segment.len().saturating_sub(4);
            data.extend_from_slice(&segment[..chunk_len]);
        }
        data
    } else {
        read_cell(backing, vk.data_offset)?
    };
    data.truncate(vk.length() as usize);
    Ok(data)
}

/// Inserts or overwrites the value named `name` under `key_offset`. An
/// unnamed value is addressed with an empty `name` (stored on disk as the
/// `(default)` marker). Freeing superseded data happens only after the new
/// data and value key are already in place.
pub fn upsert_value(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    key_offset: u32,
    name: &str,
    data_type: ValueType,
    data: &[u8],
) -> Result<()> {
    let key = read_key_node(backing, key_offset)?;
    let target = normalize_display_name(name);
    let offsets = match key.resolve_value_list() {
        Some(vl) => read_value_list(backing, vl, key.value_count)?,
        None => Vec::new(),
    };

    let mut existing = None;
    for &vk_off in &offsets {
        let vk = read_value_key(backing, vk_off)?;
        if same_name(&vk.name, target) {
            existing = Some(vk_off);
            break;
        }
    }

    if let Some(vk_off) = existing {
        let old_vk = read_value_key(backing, vk_off)?;
        let new_vk = route_value_data(alloc, backing, base_block, dirty, target, data_type, data)?;
        overwrite_cell(backing, dirty, vk_off, &new_vk.to_bytes())?;
        free_value_data(alloc, backing, dirty, &old_vk)?;
    } else {
        let new_vk = route_value_data(alloc, backing, base_block, dirty, target, data_type, data)?;
        let vk_off = allocate_record(alloc, backing, base_block, dirty, &new_vk.to_bytes())?;
        let mut new_offsets = offsets;
        new_offsets.push(vk_off);
        update_value_list(alloc, backing, base_block, dirty, key_offset, new_offsets)?;
    }

    Ok(())
}

/// Removes the value named `name` under `key_offset`. Idempotent: absent
/// names are not an error.
pub fn delete_value(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    key_offset: u32,
    name: &str,
) -> Result<()> {
    let key = read_key_node(backing, key_offset)?;
    let Some(vl) = key.resolve_value_list() else {
        return Ok(());
    };
    let offsets = read_value_list(backing, vl, key.value_count)?;
    let target = normalize_display_name(name);

    let mut found = None;
    for (i, &vk_off) in offsets.iter().enumerate() {
        let vk = read_value_key(backing, vk_off)?;
        if same_name(&vk.name, target) {
            found = Some((i, vk_off));
            break;
        }
    }
    let Some((i, vk_off)) = found else {
        return Ok(());
    };

    let vk = read_value_key(backing, vk_off)?;
    free_value_data(alloc, backing, dirty, &vk)?;
    free_record(alloc, backing, dirty, vk_off)?;

    let mut new_offsets = offsets;
    new_offsets.remove(i);
    update_value_list(alloc, backing, base_block, dirty, key_offset, new_offsets)
}

/// Deletes the key at `key_offset`. Fails if it has subkeys and `recursive`
/// is false; otherwise deletes the whole subtree, its values, and
/// decrements (or frees) its shared security descriptor.
pub fn delete_key(
    alloc: &mut Allocator,
    backing: &mut Backing,
    base_block: &mut BaseBlock,
    dirty: &mut DirtyTracker,
    key_offset: u32,
    recursive: bool,
) -> Result<()> {
    let key = read_key_node(backing, key_offset)?;

    if key.has_subkeys() && !recursive {
        return Err(RegistryError::exists("key", &key.name));
    }

    if recursive {
        for child in list_children(backing, key_offset)? {
            delete_key(alloc, backing, base_block, dirty, child.key_offset, true)?;
        }
    }

    // Re-read: deleting children rewrote this key's subkey-index pointer via
    // `remove_child`, so the copy read above is stale for that field.
    let key = read_key_node(backing, key_offset)?;

    if let Some(vl) = key.resolve_value_list() {
        for vk_off in read_value_list(backing, vl, key.value_count)? {
            let vk = read_value_key(backing, vk_off)?;
            free_value_data(alloc, backing, dirty, &vk)?;
            free_record(alloc, backing, dirty, vk_off)?;
        }
        free_record(alloc, backing, dirty, vl)?;
    }

    if let Some(sk_offset) = key.resolve_security() {
        unlink_or_decrement_security(alloc, backing, dirty, sk_offset)?;
    }

    if let Some(class_offset) = key.resolve_class() {
        free_record(alloc, backing, dirty, class_offset)?;
    }

    free_subkey_index(alloc, backing, dirty, key.resolve_subkey_index())?;

    if !key.is_root() {
        remove_child(alloc, backing, base_block, dirty, key.parent_offset, key_offset)?;
    }

    free_record(alloc, backing, dirty, key_offset)
}

fn unlink_or_decrement_security(
    alloc: &mut Allocator,
    backing: &mut Backing,
    dirty: &mut DirtyTracker,
    sk_offset: u32,
) -> Result<()> {
    let sk = read_security(backing, sk_offset)?;
    if sk.reference_count > 1 {
        let mut sk = sk;
        sk.reference_count -= 1;
        return overwrite_cell(backing, dirty, sk_offset, &sk.to_bytes());
    }

    if sk.flink != sk_offset {
        let mut next = read_security(backing, sk.flink)?;
        next.blink = sk.blink;
        overwrite_cell(backing, dirty, sk.flink, &next.to_bytes())?;
    }
    if sk.blink != sk_offset {
        let mut prev = read_security(backing, sk.blink)?;
        prev.flink = sk.flink;
        overwrite_cell(backing, dirty, sk.blink, &prev.to_bytes())?;
    }
    free_record(alloc, backing, dirty, sk_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_block::{BASE_BLOCK_SIZE, REGF_SIGNATURE};
    use crate::hbin::{HbinHeader, HBIN_HEADER_SIZE};
    use crate::primitives::{calculate_checksum, write_u32_le};
    use crate::value::ValueData;

    fn fresh_hive_with_root() -> (Backing, BaseBlock, Allocator, DirtyTracker, u32) {
        let bin_size = 4096u32 * 4;
        let mut data = vec![0u8; BASE_BLOCK_SIZE + bin_size as usize];
        data[0..4].copy_from_slice(REGF_SIGNATURE);
        write_u32_le(&mut data, 0x04, 1).unwrap();
        write_u32_le(&mut data, 0x08, 1).unwrap();
        write_u32_le(&mut data, 0x14, 1).unwrap();
        write_u32_le(&mut data, 0x18, 5).unwrap();
        write_u32_le(&mut data, 0x24, 0x20).unwrap();
        write_u32_le(&mut data, 0x28, bin_size).unwrap();
        HbinHeader::write_new(&mut data[BASE_BLOCK_SIZE..BASE_BLOCK_SIZE + HBIN_HEADER_SIZE], 0, bin_size).unwrap();
        write_u32_le(&mut data, BASE_BLOCK_SIZE + HBIN_HEADER_SIZE, bin_size - HBIN_HEADER_SIZE as u32).unwrap();
        let checksum = calculate_checksum(&data);
        write_u32_le(&mut data, 0x1FC, checksum).unwrap();

        let mut base_block = BaseBlock::parse(&data).unwrap();
        let mut backing = Backing::from_vec(data);
        let mut alloc = Allocator::new();
        alloc.scan(&backing, &base_block).unwrap();
        let mut dirty = DirtyTracker::new();

        let root_key = KeyNode::new("", 0, true);
        let root_offset = allocate_record(&mut alloc, &mut backing, &mut base_block, &mut dirty, &root_key.to_bytes()).unwrap();
        base_block.set_root_cell_offset(backing.as_mut_slice(), root_offset).unwrap();

        (backing, base_block, alloc, dirty, root_offset)
    }

    #[test]
    fn test_ensure_key_path_creates_missing_segments_idempotently() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        let (leaf, created) = ensure_key_path(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, &["Software", "Vendor"]).unwrap();
        assert_eq!(created, 2);

        let (leaf2, created2) = ensure_key_path(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, &["Software", "Vendor"]).unwrap();
        assert_eq!(created2, 0);
        assert_eq!(leaf, leaf2);
    }

    #[test]
    fn test_upsert_inline_value_roundtrips() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        upsert_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "Count", ValueType::Dword, &42u32.to_le_bytes()).unwrap();

        let key = read_key_node(&backing, root).unwrap();
        let offsets = read_value_list(&backing, key.resolve_value_list().unwrap(), key.value_count).unwrap();
        assert_eq!(offsets.len(), 1);
        let vk = read_value_key(&backing, offsets[0]).unwrap();
        assert!(vk.is_inline_data());
        let data = ValueData::parse(&vk.inline_data(), vk.data_type, 0).unwrap();
        assert_eq!(data, ValueData::Dword(42));
    }

    #[test]
    fn test_upsert_external_value_roundtrips() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        let payload = ValueData::String("a value long enough to need a cell".to_string()).to_bytes();
        upsert_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "Description", ValueType::String, &payload).unwrap();

        let key = read_key_node(&backing, root).unwrap();
        let offsets = read_value_list(&backing, key.resolve_value_list().unwrap(), key.value_count).unwrap();
        let vk = read_value_key(&backing, offsets[0]).unwrap();
        assert!(!vk.is_inline_data());
        let stored = read_cell(&backing, vk.data_offset).unwrap();
        assert_eq!(stored, payload);
    }

    #[test]
    fn test_upsert_big_data_value_chunks_and_reassembles() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        let payload = vec![0x5Au8; BIG_DATA_CHUNK_SIZE * 2 + 10];
        upsert_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "Blob", ValueType::Binary, &payload).unwrap();

        let key = read_key_node(&backing, root).unwrap();
        let offsets = read_value_list(&backing, key.resolve_value_list().unwrap(), key.value_count).unwrap();
        let vk = read_value_key(&backing, offsets[0]).unwrap();
        assert_eq!(vk.length() as usize, payload.len());

        let header = BigDataBlock::parse(&read_cell(&backing, vk.data_offset).unwrap(), vk.data_offset).unwrap();
        assert_eq!(header.segment_count, 3);
        let segment_offsets =
            BigDataBlock::parse_segment_list(&read_cell(&backing, header.segment_list_offset).unwrap(), header.segment_count, header.segment_list_offset)
                .unwrap();
        let mut reassembled = Vec::new();
        for off in segment_offsets {
            let segment = read_cell(&backing, off).unwrap();
            let chunk_len = segment.len() - 4; // trailing 4 bytes are cell-header padding
            reassembled.extend_from_slice(&segment[..chunk_len]);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_upsert_same_name_twice_reuses_slot_and_frees_old_data() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        let first = vec![0xAAu8; 100];
        let second = vec![0xBBu8; 50];
        upsert_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "Data", ValueType::Binary, &first).unwrap();
        upsert_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "Data", ValueType::Binary, &second).unwrap();

        let key = read_key_node(&backing, root).unwrap();
        assert_eq!(key.value_count, 1);
        let offsets = read_value_list(&backing, key.resolve_value_list().unwrap(), key.value_count).unwrap();
        assert_eq!(offsets.len(), 1);
        let vk = read_value_key(&backing, offsets[0]).unwrap();
        assert_eq!(read_cell(&backing, vk.data_offset).unwrap(), second);
    }

    #[test]
    fn test_delete_value_is_idempotent() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        upsert_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "X", ValueType::Dword, &1u32.to_le_bytes()).unwrap();
        delete_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "X").unwrap();
        let key = read_key_node(&backing, root).unwrap();
        assert_eq!(key.value_count, 0);
        // second delete is a no-op, not an error
        delete_value(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, "X").unwrap();
    }

    #[test]
    fn test_delete_key_non_recursive_with_children_fails() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        let (child, _) = ensure_key_path(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, &["Child"]).unwrap();
        let _ = child;
        assert!(delete_key(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, false).is_err());
    }

    #[test]
    fn test_delete_key_recursive_removes_subtree() {
        let (mut backing, mut base_block, mut alloc, mut dirty, root) = fresh_hive_with_root();
        ensure_key_path(&mut alloc, &mut backing, &mut base_block, &mut dirty, root, &["A", "B"]).unwrap();
        let a_offset = find_child(&backing, root, "A").unwrap().unwrap();

        delete_key(&mut alloc, &mut backing, &mut base_block, &mut dirty, a_offset, true).unwrap();

        assert!(find_child(&backing, root, "A").unwrap().is_none());
        let root_key = read_key_node(&backing, root).unwrap();
        assert_eq!(root_key.subkey_count, 0);
    }
}
