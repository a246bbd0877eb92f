//! Key node (nk) record: parsing, resolvers, and serialization for writes.

use crate::cell::KeyNodeFlags;
use crate::error::{RegistryError, Result};
use crate::primitives::{
    is_none, now_filetime, read_ascii_string, read_u16_le, read_u32_le, read_utf16_string,
    write_utf16_string, NONE_SENTINEL,
};

/// Fixed-size portion of a key node, before the variable-length name.
const KEY_NODE_MIN_SIZE: usize = 76;
const KEY_NAME_OFFSET: usize = 0x4C;

/// Key node (nk).
#[derive(Debug, Clone)]
pub struct KeyNode {
    pub flags: KeyNodeFlags,
    pub last_written: u64,
    pub access_bits: u32,
    pub parent_offset: u32,
    pub subkey_count: u32,
    pub volatile_subkey_count: u32,
    pub subkey_list_offset: u32,
    pub volatile_subkey_list_offset: u32,
    pub value_count: u32,
    pub value_list_offset: u32,
    pub security_offset: u32,
    pub class_name_offset: u32,
    pub max_subkey_name_len: u32,
    pub max_subkey_class_len: u32,
    pub max_value_name_len: u32,
    pub max_value_data_len: u32,
    pub work_var: u32,
    pub name_length: u16,
    pub class_name_length: u16,
    pub name: String,
}

impl KeyNode {
    /// Parses a key node from its cell payload (starting at the "nk" signature).
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::truncated(offset, "key node shorter than 76 bytes"));
        }
        if &data[0..2] != b"nk" {
            return Err(RegistryError::format_invalid(offset, "expected 'nk' signature"));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, 0x02)?);
        let last_written = u64::from(read_u32_le(data, 0x04)?) | (u64::from(read_u32_le(data, 0x08)?) << 32);
        let access_bits = read_u32_le(data, 0x0C)?;
        let parent_offset = read_u32_le(data, 0x10)?;
        let subkey_count = read_u32_le(data, 0x14)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, 0x1C)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, 0x24)?;
        let value_list_offset = read_u32_le(data, 0x28)?;
        let security_offset = read_u32_le(data, 0x2C)?;
        let class_name_offset = read_u32_le(data, 0x30)?;
        let max_subkey_name_len = read_u32_le(data, 0x34)?;
        let max_subkey_class_len = read_u32_le(data, 0x38)?;
        let max_value_name_len = read_u32_le(data, 0x3C)?;
        let max_value_data_len = read_u32_le(data, 0x40)?;
        let work_var = read_u32_le(data, 0x44)?;
        let name_length = read_u16_le(data, 0x48)?;
        let class_name_length = read_u16_le(data, 0x4A)?;

        let name = if name_length > 0 {
            let name_end = KEY_NAME_OFFSET + name_length as usize;
            let name_data = data
                .get(KEY_NAME_OFFSET..name_end)
                .ok_or_else(|| RegistryError::truncated(offset, "key name runs past cell end"))?;
            if flags.is_compressed() {
                read_ascii_string(name_data)
            } else {
                read_utf16_string(name_data, offset)?
            }
        } else {
            String::new()
        };

        Ok(KeyNode {
            flags,
            last_written,
            access_bits,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            max_subkey_name_len,
            max_subkey_class_len,
            max_value_name_len,
            max_value_data_len,
            work_var,
            name_length,
            class_name_length,
            name,
        })
    }

    /// Builds a fresh key node with no subkeys, values, security, or class name.
    pub fn new(name: &str, parent_offset: u32, is_root: bool) -> Self {
        let compressed = name.is_ascii();
        let mut flag_bits = 0u16;
        if compressed {
            flag_bits |= KeyNodeFlags::COMP_NAME;
        }
        if is_root {
            flag_bits |= KeyNodeFlags::ROOT_KEY;
        }
        let name_length = if compressed {
            name.len()
        } else {
            name.encode_utf16().count() * 2
        } as u16;

        KeyNode {
            flags: KeyNodeFlags::new(flag_bits),
            last_written: now_filetime(),
            access_bits: 0,
            parent_offset,
            subkey_count: 0,
            volatile_subkey_count: 0,
            subkey_list_offset: NONE_SENTINEL,
            volatile_subkey_list_offset: NONE_SENTINEL,
            value_count: 0,
            value_list_offset: NONE_SENTINEL,
            security_offset: NONE_SENTINEL,
            class_name_offset: NONE_SENTINEL,
            max_subkey_name_len: 0,
            max_subkey_class_len: 0,
            max_value_name_len: 0,
            max_value_data_len: 0,
            work_var: 0,
            name_length,
            class_name_length: 0,
            name: name.to_string(),
        }
    }

    /// Serializes this key node back to its cell payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let name_bytes = if self.flags.is_compressed() {
            self.name.as_bytes().to_vec()
        } else {
            write_utf16_string(&self.name)
        };

        let mut out = Vec::with_capacity(KEY_NODE_MIN_SIZE + name_bytes.len());
        out.extend_from_slice(b"nk");
        out.extend_from_slice(&self.flags.0.to_le_bytes());
        out.extend_from_slice(&(self.last_written as u32).to_le_bytes());
        out.extend_from_slice(&((self.last_written >> 32) as u32).to_le_bytes());
        out.extend_from_slice(&self.access_bits.to_le_bytes());
        out.extend_from_slice(&self.parent_offset.to_le_bytes());
        out.extend_from_slice(&self.subkey_count.to_le_bytes());
        out.extend_from_slice(&self.volatile_subkey_count.to_le_bytes());
        out.extend_from_slice(&self.subkey_list_offset.to_le_bytes());
        out.extend_from_slice(&self.volatile_subkey_list_offset.to_le_bytes());
        out.extend_from_slice(&self.value_count.to_le_bytes());
        out.extend_from_slice(&self.value_list_offset.to_le_bytes());
        out.extend_from_slice(&self.security_offset.to_le_bytes());
        out.extend_from_slice(&self.class_name_offset.to_le_bytes());
        out.extend_from_slice(&self.max_subkey_name_len.to_le_bytes());
        out.extend_from_slice(&self.max_subkey_class_len.to_le_bytes());
        out.extend_from_slice(&self.max_value_name_len.to_le_bytes());
        out.extend_from_slice(&self.max_value_data_len.to_le_bytes());
        out.extend_from_slice(&self.work_var.to_le_bytes());
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.class_name_length.to_le_bytes());
        out.extend_from_slice(&name_bytes);
        out
    }

    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }

    /// The subkey index's relative offset, or `None` if this key has no subkeys.
    pub fn resolve_subkey_index(&self) -> Option<u32> {
        (!is_none(self.subkey_list_offset)).then_some(self.subkey_list_offset)
    }

    /// The value list's relative offset, or `None` if this key has no values.
    pub fn resolve_value_list(&self) -> Option<u32> {
        (!is_none(self.value_list_offset)).then_some(self.value_list_offset)
    }

    /// The security descriptor's relative offset, or `None` if unset.
    pub fn resolve_security(&self) -> Option<u32> {
        (!is_none(self.security_offset)).then_some(self.security_offset)
    }

    /// The class name cell's relative offset, or `None` if this key has no class name.
    pub fn resolve_class(&self) -> Option<u32> {
        (!is_none(self.class_name_offset)).then_some(self.class_name_offset)
    }

    pub fn set_subkey_index(&mut self, offset: Option<u32>, count: u32) {
        self.subkey_list_offset = offset.unwrap_or(NONE_SENTINEL);
        self.subkey_count = count;
    }

    pub fn set_value_list(&mut self, offset: Option<u32>, count: u32) {
        self.value_list_offset = offset.unwrap_or(NONE_SENTINEL);
        self.value_count = count;
    }

    pub fn set_security(&mut self, offset: Option<u32>) {
        self.security_offset = offset.unwrap_or(NONE_SENTINEL);
    }

    pub fn set_class(&mut self, offset: Option<u32>, length: u16) {
        self.class_name_offset = offset.unwrap_or(NONE_SENTINEL);
        self.class_name_length = length;
    }

    pub fn touch(&mut self) {
        self.last_written = now_filetime();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_node_minimum_size() {
        let data = vec![0u8; 75];
        assert!(KeyNode::parse(&data, 0).is_err());
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = vec![0u8; 80];
        data[0..2].copy_from_slice(b"XX");
        assert!(KeyNode::parse(&data, 0).is_err());
    }

    #[test]
    fn test_new_key_roundtrips_through_parse() {
        let key = KeyNode::new("Software", 0x20, false);
        let bytes = key.to_bytes();
        let parsed = KeyNode::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.name, "Software");
        assert!(!parsed.is_root());
        assert_eq!(parsed.parent_offset, 0x20);
        assert!(parsed.resolve_subkey_index().is_none());
    }

    #[test]
    fn test_non_ascii_name_roundtrips() {
        let key = KeyNode::new("caf\u{e9}", 0, true);
        let bytes = key.to_bytes();
        let parsed = KeyNode::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.name, "caf\u{e9}");
        assert!(parsed.is_root());
    }

    #[test]
    fn test_resolvers_respect_none_sentinel() {
        let mut key = KeyNode::new("K", 0, false);
        assert!(key.resolve_value_list().is_none());
        key.set_value_list(Some(0x400), 3);
        assert_eq!(key.resolve_value_list(), Some(0x400));
        assert_eq!(key.value_count, 3);
    }
}
