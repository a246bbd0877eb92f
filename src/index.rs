//! Subkey index maintenance: hashing, ordering, and the insert/delete/split
//! rules over the `li`/`lf`/`lh`/`ri` shapes defined in `subkey_list.rs`.
//!
//! This module only computes and reshapes in-memory `SubkeyList` values; it
//! never touches the allocator or a key node's pointer fields directly. The
//! caller (`editor.rs`) is responsible for allocating/freeing cells and
//! updating the parent `nk`.

use crate::subkey_list::{SubkeyList, SubkeyListEntry, SubkeyListType};

/// Above this many entries, a leaf is split in two.
pub const SPLIT_THRESHOLD: usize = 1000;

/// `lh` hash: fold lowercased Unicode code points, `h = 37*h + cp mod 2^32`.
pub fn lh_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for cp in name.to_lowercase().chars() {
        h = h.wrapping_mul(37).wrapping_add(cp as u32);
    }
    h
}

/// `lf` hint: first four bytes of the uppercased ASCII name, NUL-padded.
/// Any non-ASCII byte anywhere in the name falls back to four zero bytes.
pub fn lf_hint(name: &str) -> u32 {
    if !name.is_ascii() {
        return 0;
    }
    let upper = name.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let mut hint = [0u8; 4];
    let n = bytes.len().min(4);
    hint[..n].copy_from_slice(&bytes[..n]);
    u32::from_le_bytes(hint)
}

/// Picks the leaf shape for newly created indexes: `lh` from minor version 5
/// onward, `lf` for older hives.
pub fn preferred_leaf_shape(minor_version: u32) -> SubkeyListType {
    if minor_version >= 5 {
        SubkeyListType::HashLeaf
    } else {
        SubkeyListType::FastLeaf
    }
}

fn hint_for(shape: SubkeyListType, name: &str) -> u32 {
    match shape {
        SubkeyListType::HashLeaf => lh_hash(name),
        _ => lf_hint(name),
    }
}

/// A name/offset pair used to resort a leaf; `name` is only needed for
/// ordering and hint recomputation, never stored on disk.
#[derive(Debug, Clone)]
pub struct NamedChild {
    pub name: String,
    pub key_offset: u32,
}

fn sort_key(name: &str) -> String {
    name.to_uppercase()
}

/// Builds a fresh single-leaf index (or `None` if `children` is empty) from
/// an unordered set of children, choosing `lh` vs `lf` per
/// `preferred_leaf_shape`. Does not split — callers with more than
/// `SPLIT_THRESHOLD` children should use `insert` repeatedly from empty so
/// splitting kicks in, or call `split_if_needed` after building.
pub fn build_leaf(children: &[NamedChild], minor_version: u32) -> Option<SubkeyList> {
    if children.is_empty() {
        return None;
    }
    let shape = preferred_leaf_shape(minor_version);
    let mut sorted: Vec<&NamedChild> = children.iter().collect();
    sorted.sort_by_key(|c| sort_key(&c.name));
    let entries = sorted
        .iter()
        .map(|c| SubkeyListEntry {
            key_offset: c.key_offset,
            name_hint: hint_for(shape, &c.name),
        })
        .collect();
    Some(SubkeyList::LeafWithHints(shape, entries))
}

/// Inserts `child` among `existing` (the current leaf's children, with their
/// names resolved by the caller) and rebuilds the leaf from scratch.
///
/// An `lf`/`lh` entry stores only a name *hint*, not the name itself, so
/// re-sorting an existing leaf in place would require chasing every child's
/// `nk` to recover its name anyway — the caller already has to do that to
/// build `existing`, so insert and remove both just rebuild from the full
/// resolved set rather than pretending to patch the on-disk shape in place.
pub fn insert(existing: &[NamedChild], child: NamedChild, minor_version: u32) -> SubkeyList {
    let mut children = existing.to_vec();
    children.push(child);
    build_leaf(&children, minor_version).expect("just pushed a child")
}

/// Removes the entry for `key_offset` from `existing`'s resolved names and
/// rebuilds the leaf (or returns `None` if the result would be empty).
pub fn remove(existing: &[NamedChild], key_offset: u32, minor_version: u32) -> Option<SubkeyList> {
    let children: Vec<_> = existing.iter().filter(|c| c.key_offset != key_offset).cloned().collect();
    build_leaf(&children, minor_version)
}

pub fn should_split(leaf: &SubkeyList) -> bool {
    leaf.len() > SPLIT_THRESHOLD
}

/// Splits an over-capacity leaf in half by entry order, returning the two
/// halves. Each half keeps the same shape as the original.
pub fn split_leaf(leaf: &SubkeyList) -> (SubkeyList, SubkeyList) {
    match leaf {
        SubkeyList::LeafWithHints(shape, entries) => {
            let mid = entries.len() / 2;
            let (left, right) = entries.split_at(mid);
            (
                SubkeyList::LeafWithHints(*shape, left.to_vec()),
                SubkeyList::LeafWithHints(*shape, right.to_vec()),
            )
        }
        SubkeyList::IndexLeaf(offsets) => {
            let mid = offsets.len() / 2;
            let (left, right) = offsets.split_at(mid);
            (SubkeyList::IndexLeaf(left.to_vec()), SubkeyList::IndexLeaf(right.to_vec()))
        }
        SubkeyList::IndexRoot(offsets) => (SubkeyList::IndexRoot(offsets.clone()), SubkeyList::IndexRoot(vec![])),
    }
}

/// Builds an `ri` root over already-allocated leaf cell offsets.
pub fn build_root(leaf_cell_offsets: &[u32]) -> SubkeyList {
    SubkeyList::IndexRoot(leaf_cell_offsets.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lh_hash_matches_fold_rule() {
        let mut expected: u32 = 0;
        for cp in "software".chars() {
            expected = expected.wrapping_mul(37).wrapping_add(cp as u32);
        }
        assert_eq!(lh_hash("Software"), expected);
    }

    #[test]
    fn test_lf_hint_uppercases_and_pads() {
        let hint = lf_hint("ab");
        let bytes = hint.to_le_bytes();
        assert_eq!(&bytes[0..2], b"AB");
        assert_eq!(&bytes[2..4], &[0, 0]);
    }

    #[test]
    fn test_lf_hint_falls_back_on_non_ascii() {
        assert_eq!(lf_hint("caf\u{e9}"), 0);
    }

    #[test]
    fn test_preferred_leaf_shape_by_minor_version() {
        assert_eq!(preferred_leaf_shape(5), SubkeyListType::HashLeaf);
        assert_eq!(preferred_leaf_shape(3), SubkeyListType::FastLeaf);
    }

    #[test]
    fn test_build_leaf_sorts_by_name() {
        let children = vec![
            NamedChild { name: "Zebra".to_string(), key_offset: 0x20 },
            NamedChild { name: "Apple".to_string(), key_offset: 0x40 },
        ];
        let leaf = build_leaf(&children, 5).unwrap();
        let offsets: Vec<_> = leaf.key_offsets_iter().collect();
        assert_eq!(offsets, vec![0x40, 0x20]);
    }

    #[test]
    fn test_insert_then_remove_roundtrips() {
        let existing = vec![NamedChild { name: "A".to_string(), key_offset: 0x20 }];
        let leaf = insert(&existing, NamedChild { name: "B".to_string(), key_offset: 0x40 }, 5);
        assert_eq!(leaf.len(), 2);

        let existing = vec![
            NamedChild { name: "A".to_string(), key_offset: 0x20 },
            NamedChild { name: "B".to_string(), key_offset: 0x40 },
        ];
        let leaf = remove(&existing, 0x20, 5).unwrap();
        assert_eq!(leaf.len(), 1);
        assert_eq!(leaf.key_offsets_iter().collect::<Vec<_>>(), vec![0x40]);
    }

    #[test]
    fn test_remove_last_child_yields_none() {
        let existing = vec![NamedChild { name: "A".to_string(), key_offset: 0x20 }];
        assert!(remove(&existing, 0x20, 5).is_none());
    }

    #[test]
    fn test_split_leaf_divides_roughly_in_half() {
        let entries: Vec<_> = (0..2000u32)
            .map(|i| SubkeyListEntry { key_offset: i, name_hint: i })
            .collect();
        let leaf = SubkeyList::LeafWithHints(SubkeyListType::HashLeaf, entries);
        assert!(should_split(&leaf));
        let (left, right) = split_leaf(&leaf);
        assert_eq!(left.len(), 1000);
        assert_eq!(right.len(), 1000);
    }
}
