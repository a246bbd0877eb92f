//! Value key (vk) record: parsing, data decoding, and serialization for writes.

use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::primitives::{read_ascii_string, read_u16_le, read_u32_le, read_utf16_string, write_utf16_string};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

const VALUE_KEY_MIN_SIZE: usize = 20;
const VALUE_NAME_OFFSET: usize = 0x14;

/// Top bit of the on-disk `data_length` field: set when the value's data is
/// stored inline in the `data_offset` field itself, rather than in a
/// separate cell.
const INLINE_FLAG: u32 = 0x8000_0000;

/// Name-is-ASCII flag, same bit position and meaning as a key node's `COMP_NAME`.
const NAME_ASCII_FLAG: u16 = 0x0001;

/// Value key (vk).
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Raw on-disk length field: top bit is the inline flag, remaining bits
    /// are the data length (for inline data, 0-4).
    pub data_length: u32,
    /// Relative offset of the data cell, or the inline bytes themselves
    /// when `is_inline()`.
    pub data_offset: u32,
    pub data_type: ValueType,
    pub flags: u16,
    pub name: String,
}

impl ValueKey {
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VALUE_KEY_MIN_SIZE {
            return Err(RegistryError::truncated(offset, "value key shorter than 20 bytes"));
        }
        if &data[0..2] != b"vk" {
            return Err(RegistryError::format_invalid(offset, "expected 'vk' signature"));
        }

        let name_length = read_u16_le(data, 0x02)?;
        let data_length = read_u32_le(data, 0x04)?;
        let data_offset = read_u32_le(data, 0x08)?;
        let data_type = ValueType::from_u32(read_u32_le(data, 0x0C)?);
        let flags = read_u16_le(data, 0x10)?;

        let name = if name_length > 0 {
            let name_end = VALUE_NAME_OFFSET + name_length as usize;
            let name_data = data
                .get(VALUE_NAME_OFFSET..name_end)
                .ok_or_else(|| RegistryError::truncated(offset, "value name runs past cell end"))?;
            if flags & NAME_ASCII_FLAG != 0 {
                read_ascii_string(name_data)
            } else {
                read_utf16_string(name_data, offset)?
            }
        } else {
            String::from("(default)")
        };

        Ok(ValueKey {
            data_length,
            data_offset,
            data_type,
            flags,
            name,
        })
    }

    /// Builds a value key whose data is stored inline (`bytes.len() <= 4`).
    pub fn new_inline(name: &str, data_type: ValueType, bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= 4);
        let mut padded = [0u8; 4];
        padded[..bytes.len()].copy_from_slice(bytes);
        ValueKey {
            data_length: INLINE_FLAG | bytes.len() as u32,
            data_offset: u32::from_le_bytes(padded),
            data_type,
            flags: if name.is_ascii() { NAME_ASCII_FLAG } else { 0 },
            name: name.to_string(),
        }
    }

    /// Builds a value key whose data lives in a separate cell (external
    /// storage or a big-data block list), at relative offset `cell_offset`.
    pub fn new_external(name: &str, data_type: ValueType, length: u32, cell_offset: u32) -> Self {
        ValueKey {
            data_length: length & !INLINE_FLAG,
            data_offset: cell_offset,
            data_type,
            flags: if name.is_ascii() { NAME_ASCII_FLAG } else { 0 },
            name: name.to_string(),
        }
    }

    /// Serializes this value key back to its cell payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let is_default = self.name == "(default)";
        let name_bytes = if is_default {
            Vec::new()
        } else if self.flags & NAME_ASCII_FLAG != 0 {
            self.name.as_bytes().to_vec()
        } else {
            write_utf16_string(&self.name)
        };

        let mut out = Vec::with_capacity(VALUE_KEY_MIN_SIZE + name_bytes.len());
        out.extend_from_slice(b"vk");
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data_length.to_le_bytes());
        out.extend_from_slice(&self.data_offset.to_le_bytes());
        out.extend_from_slice(&self.data_type.to_u32().to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // spare
        out.extend_from_slice(&name_bytes);
        out
    }

    /// True when the data is stored inline in `data_offset`.
    pub fn is_inline_data(&self) -> bool {
        self.data_length & INLINE_FLAG != 0
    }

    /// The data's length in bytes, regardless of storage mode.
    pub fn length(&self) -> u32 {
        self.data_length & !INLINE_FLAG
    }

    /// Extracts the inline bytes (only valid when `is_inline_data()`).
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        let len = (self.length() as usize).min(4);
        bytes[..len].to_vec()
    }
}

/// Decoded registry value data.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    None,
    String(String),
    ExpandString(String),
    Binary(Vec<u8>),
    Dword(u32),
    DwordBigEndian(u32),
    MultiString(Vec<String>),
    Qword(u64),
    Unknown(Vec<u8>),
}

impl ValueData {
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match value_type {
            ValueType::None => Ok(ValueData::None),

            ValueType::String | ValueType::ExpandString => {
                let s = read_utf16_string(data, offset)?;
                if value_type == ValueType::String {
                    Ok(ValueData::String(s))
                } else {
                    Ok(ValueData::ExpandString(s))
                }
            }

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),

            ValueType::Dword => {
                if data.len() < 4 {
                    return Err(RegistryError::truncated(offset, "DWORD value shorter than 4 bytes"));
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Dword(cursor.read_u32::<LittleEndian>()?))
            }

            ValueType::DwordBigEndian => {
                if data.len() < 4 {
                    return Err(RegistryError::truncated(offset, "big-endian DWORD shorter than 4 bytes"));
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::DwordBigEndian(cursor.read_u32::<BigEndian>()?))
            }

            ValueType::Qword => {
                if data.len() < 8 {
                    return Err(RegistryError::truncated(offset, "QWORD value shorter than 8 bytes"));
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Qword(cursor.read_u64::<LittleEndian>()?))
            }

            ValueType::MultiString => {
                let full_string = read_utf16_string(data, offset)?;
                let strings = full_string
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                Ok(ValueData::MultiString(strings))
            }

            _ => Ok(ValueData::Unknown(data.to_vec())),
        }
    }

    /// Serializes this value back to its on-disk byte representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ValueData::None => Vec::new(),
            ValueData::String(s) | ValueData::ExpandString(s) => {
                let mut bytes = write_utf16_string(s);
                bytes.extend_from_slice(&[0, 0]);
                bytes
            }
            ValueData::Binary(b) | ValueData::Unknown(b) => b.clone(),
            ValueData::Dword(d) => d.to_le_bytes().to_vec(),
            ValueData::DwordBigEndian(d) => d.to_be_bytes().to_vec(),
            ValueData::Qword(q) => q.to_le_bytes().to_vec(),
            ValueData::MultiString(strings) => {
                let mut bytes = Vec::new();
                for s in strings {
                    bytes.extend_from_slice(&write_utf16_string(s));
                    bytes.extend_from_slice(&[0, 0]);
                }
                bytes.extend_from_slice(&[0, 0]);
                bytes
            }
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            ValueData::None => String::from("(none)"),
            ValueData::String(s) | ValueData::ExpandString(s) => s.clone(),
            ValueData::Binary(b) | ValueData::Unknown(b) => format!("{b:02X?}"),
            ValueData::Dword(d) => format!("{d} (0x{d:08X})"),
            ValueData::DwordBigEndian(d) => format!("{d} (0x{d:08X})"),
            ValueData::Qword(q) => format!("{q} (0x{q:016X})"),
            ValueData::MultiString(strings) => strings.join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        let data = vec![0u8; 19];
        assert!(ValueKey::parse(&data, 0).is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        assert!(ValueKey::parse(&data, 0).is_err());
    }

    #[test]
    fn test_inline_data_roundtrip() {
        let vk = ValueKey::new_inline("Count", ValueType::Dword, &[0x01, 0x02, 0x03, 0x04]);
        assert!(vk.is_inline_data());
        assert_eq!(vk.inline_data(), vec![0x01, 0x02, 0x03, 0x04]);

        let bytes = vk.to_bytes();
        let parsed = ValueKey::parse(&bytes, 0).unwrap();
        assert!(parsed.is_inline_data());
        assert_eq!(parsed.inline_data(), vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(parsed.name, "Count");
    }

    #[test]
    fn test_external_data_is_not_inline() {
        let vk = ValueKey::new_external("Description", ValueType::String, 40, 0x500);
        assert!(!vk.is_inline_data());
        assert_eq!(vk.length(), 40);
        assert_eq!(vk.data_offset, 0x500);
    }

    #[test]
    fn test_unnamed_value_uses_default_marker() {
        let vk = ValueKey::new_inline("", ValueType::Dword, &[1, 0, 0, 0]);
        let bytes = vk.to_bytes();
        let parsed = ValueKey::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.name, "(default)");
    }

    #[test]
    fn test_value_data_dword_roundtrip() {
        let data = ValueData::Dword(42);
        let bytes = data.to_bytes();
        let parsed = ValueData::parse(&bytes, ValueType::Dword, 0).unwrap();
        assert_eq!(parsed, ValueData::Dword(42));
    }

    #[test]
    fn test_value_data_multi_string_roundtrip() {
        let data = ValueData::MultiString(vec!["a".into(), "bb".into()]);
        let bytes = data.to_bytes();
        let parsed = ValueData::parse(&bytes, ValueType::MultiString, 0).unwrap();
        match parsed {
            ValueData::MultiString(v) => assert_eq!(v, vec!["a".to_string(), "bb".to_string()]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
