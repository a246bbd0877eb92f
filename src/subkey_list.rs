//! Subkey index record shapes (li, lf, lh, ri): parsing and serialization.
//!
//! Insert/delete/promotion logic and the `lf`/`lh` hint functions live in
//! `index.rs`, which operates on the shapes defined here.

use crate::error::{RegistryError, Result};
use crate::primitives::read_u32_le;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - bare list of key offsets, no hints.
    IndexLeaf,
    /// Fast leaf (lf) - list with 4-byte uppercase-ASCII name hints.
    FastLeaf,
    /// Hash leaf (lh) - list with 4-byte name hashes.
    HashLeaf,
    /// Index root (ri) - list of subkey list cell offsets.
    IndexRoot,
}

impl SubkeyListType {
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::format_invalid(
                0,
                format!("unrecognized subkey list signature {:?}", String::from_utf8_lossy(sig)),
            )),
        }
    }

    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            SubkeyListType::IndexLeaf => b"li",
            SubkeyListType::FastLeaf => b"lf",
            SubkeyListType::HashLeaf => b"lh",
            SubkeyListType::IndexRoot => b"ri",
        }
    }
}

/// One entry of an `lf` or `lh` list: a key offset plus its 4-byte hint.
#[derive(Debug, Clone, Copy)]
pub struct SubkeyListEntry {
    pub key_offset: u32,
    pub name_hint: u32,
}

/// A parsed subkey index cell, in whichever of the four shapes it was stored as.
#[derive(Debug, Clone)]
pub enum SubkeyList {
    /// `li`: bare key offsets, ordered by name.
    IndexLeaf(Vec<u32>),
    /// `lf`/`lh`: key offsets with hints, ordered by name.
    LeafWithHints(SubkeyListType, Vec<SubkeyListEntry>),
    /// `ri`: offsets of child subkey index cells, each internally ordered.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::truncated(offset, "subkey list shorter than 4 bytes"));
        }

        let sig = [data[0], data[1]];
        let list_type = SubkeyListType::from_signature(&sig)?;
        let count = u16::from_le_bytes([data[2], data[3]]) as usize;

        match list_type {
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => {
                let expected = 4 + count * 4;
                if data.len() < expected {
                    return Err(RegistryError::truncated(offset, "subkey list offsets run past cell end"));
                }
                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(read_u32_le(data, 4 + i * 4)?);
                }
                Ok(if list_type == SubkeyListType::IndexLeaf {
                    SubkeyList::IndexLeaf(offsets)
                } else {
                    SubkeyList::IndexRoot(offsets)
                })
            }

            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
                let expected = 4 + count * 8;
                if data.len() < expected {
                    return Err(RegistryError::truncated(offset, "subkey list entries run past cell end"));
                }
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let pos = 4 + i * 8;
                    entries.push(SubkeyListEntry {
                        key_offset: read_u32_le(data, pos)?,
                        name_hint: read_u32_le(data, pos + 4)?,
                    });
                }
                Ok(SubkeyList::LeafWithHints(list_type, entries))
            }
        }
    }

    /// Serializes this list back to its cell payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SubkeyList::IndexLeaf(offsets) => Self::encode_offsets(b"li", offsets),
            SubkeyList::IndexRoot(offsets) => Self::encode_offsets(b"ri", offsets),
            SubkeyList::LeafWithHints(list_type, entries) => {
                let mut out = Vec::with_capacity(4 + entries.len() * 8);
                out.extend_from_slice(list_type.signature());
                out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                for entry in entries {
                    out.extend_from_slice(&entry.key_offset.to_le_bytes());
                    out.extend_from_slice(&entry.name_hint.to_le_bytes());
                }
                out
            }
        }
    }

    fn encode_offsets(sig: &[u8; 2], offsets: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + offsets.len() * 4);
        out.extend_from_slice(sig);
        out.extend_from_slice(&(offsets.len() as u16).to_le_bytes());
        for &o in offsets {
            out.extend_from_slice(&o.to_le_bytes());
        }
        out
    }

    /// All key offsets directly held by this list. For `IndexRoot`, these
    /// are child subkey-index cell offsets, not key node offsets.
    pub fn key_offsets_iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            SubkeyList::IndexLeaf(offsets) | SubkeyList::IndexRoot(offsets) => {
                Box::new(offsets.iter().copied())
            }
            SubkeyList::LeafWithHints(_, entries) => Box::new(entries.iter().map(|e| e.key_offset)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SubkeyList::IndexLeaf(offsets) | SubkeyList::IndexRoot(offsets) => offsets.len(),
            SubkeyList::LeafWithHints(_, entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_index_root(&self) -> bool {
        matches!(self, SubkeyList::IndexRoot(_))
    }
}
