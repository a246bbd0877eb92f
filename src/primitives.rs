//! Byte-level primitives shared by every layer above it.
//!
//! Every accessor here is bounds-checked; an out-of-range offset is a
//! recoverable fault (`RegistryError::FormatTruncated`), never a panic.

use crate::error::{RegistryError, Result};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;

/// Offset where the first hive bin begins, relative to the start of the file.
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// FILETIME ticks (100ns) between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_DIFF_SECONDS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SECOND: i64 = 10_000_000;

fn truncated(offset: usize, expected: usize, actual: usize) -> RegistryError {
    RegistryError::FormatTruncated {
        context: format!("expected {expected} bytes, found {actual}"),
        offset: offset as u32,
    }
}

/// Reads a little-endian `u16` at `offset`.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    let end = offset.checked_add(2).ok_or_else(|| truncated(offset, 2, 0))?;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| truncated(offset, 2, data.len().saturating_sub(offset)))?;
    Ok(LittleEndian::read_u16(slice))
}

/// Reads a little-endian `u32` at `offset`.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    let end = offset.checked_add(4).ok_or_else(|| truncated(offset, 4, 0))?;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| truncated(offset, 4, data.len().saturating_sub(offset)))?;
    Ok(LittleEndian::read_u32(slice))
}

/// Reads a little-endian `i32` at `offset`.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    read_u32_le(data, offset).map(|v| v as i32)
}

/// Reads a little-endian `u64` at `offset`.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    let end = offset.checked_add(8).ok_or_else(|| truncated(offset, 8, 0))?;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| truncated(offset, 8, data.len().saturating_sub(offset)))?;
    Ok(LittleEndian::read_u64(slice))
}

/// Writes a little-endian `u16` at `offset`.
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    let end = offset.checked_add(2).ok_or_else(|| truncated(offset, 2, 0))?;
    let slice = data
        .get_mut(offset..end)
        .ok_or_else(|| truncated(offset, 2, 0))?;
    LittleEndian::write_u16(slice, value);
    Ok(())
}

/// Writes a little-endian `u32` at `offset`.
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let end = offset.checked_add(4).ok_or_else(|| truncated(offset, 4, 0))?;
    let slice = data
        .get_mut(offset..end)
        .ok_or_else(|| truncated(offset, 4, 0))?;
    LittleEndian::write_u32(slice, value);
    Ok(())
}

/// Writes a little-endian `i32` at `offset`.
pub fn write_i32_le(data: &mut [u8], offset: usize, value: i32) -> Result<()> {
    write_u32_le(data, offset, value as u32)
}

/// Writes a little-endian `u64` at `offset`.
pub fn write_u64_le(data: &mut [u8], offset: usize, value: u64) -> Result<()> {
    let end = offset.checked_add(8).ok_or_else(|| truncated(offset, 8, 0))?;
    let slice = data
        .get_mut(offset..end)
        .ok_or_else(|| truncated(offset, 8, 0))?;
    LittleEndian::write_u64(slice, value);
    Ok(())
}

/// Reads an ASCII string, trimming trailing NUL bytes. Embedded NULs are preserved.
pub fn read_ascii_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

/// Reads a fixed-length ASCII/Latin-1 field (e.g. the base block's embedded name).
pub fn read_fixed_ascii(data: &[u8], len: usize) -> String {
    data.iter()
        .take(len)
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Decodes a little-endian UTF-16 name, trimming a trailing NUL.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }
    if data.len() % 2 != 0 {
        return Err(RegistryError::FormatInvalid {
            context: "UTF-16 name has an odd byte length".to_string(),
            offset,
        });
    }
    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);
    if had_errors {
        return Err(RegistryError::FormatInvalid {
            context: "UTF-16 name contains invalid code units".to_string(),
            offset,
        });
    }
    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Encodes a string as little-endian UTF-16 (no trailing NUL is appended;
/// callers append one explicitly where the on-disk format requires it).
pub fn write_utf16_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// XOR checksum of the first 127 little-endian dwords of the base block
/// (the 128th dword, at byte offset 0x1FC, holds the checksum itself).
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;
    for i in (0..0x1FC).step_by(4) {
        if let Ok(dword) = read_u32_le(data, i) {
            checksum ^= dword;
        }
    }
    checksum
}

/// Converts a relative (to-first-hbin) cell offset to an absolute file offset.
#[inline]
pub fn cell_offset_to_absolute(cell_offset: u32) -> Result<u32> {
    cell_offset
        .checked_add(HBIN_START_OFFSET)
        .ok_or_else(|| RegistryError::RefOutOfRange {
            context: "relative offset overflows absolute address space".to_string(),
            offset: cell_offset,
        })
}

/// Converts an absolute file offset to a relative (to-first-hbin) cell offset.
#[inline]
pub fn absolute_to_cell_offset(absolute_offset: u32) -> Result<u32> {
    absolute_offset
        .checked_sub(HBIN_START_OFFSET)
        .ok_or_else(|| RegistryError::FormatInvalid {
            context: format!("absolute offset {absolute_offset:#x} is before hbin start"),
            offset: absolute_offset,
        })
}

/// Sentinel "none" value used throughout the hive for relative offsets.
pub const NONE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Returns true if `rel_off` is the "none" sentinel (distinct from zero).
#[inline]
pub fn is_none(rel_off: u32) -> bool {
    rel_off == NONE_SENTINEL
}

/// Converts a Windows FILETIME (100ns ticks since 1601-01-01 UTC) to a UTC instant.
///
/// Round-trips losslessly for times between 1601 and 9999.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let seconds = (filetime / FILETIME_TICKS_PER_SECOND as u64) as i64 - FILETIME_UNIX_DIFF_SECONDS;
    let nanos = ((filetime % FILETIME_TICKS_PER_SECOND as u64) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos)
}

/// Converts a UTC instant to a Windows FILETIME.
pub fn datetime_to_filetime(dt: DateTime<Utc>) -> u64 {
    let seconds = dt.timestamp() + FILETIME_UNIX_DIFF_SECONDS;
    let nanos = dt.timestamp_subsec_nanos() as i64;
    (seconds * FILETIME_TICKS_PER_SECOND + nanos / 100) as u64
}

/// The current instant as a Windows FILETIME.
pub fn now_filetime() -> u64 {
    datetime_to_filetime(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_u32_roundtrip() {
        let mut data = [0u8; 8];
        write_u32_le(&mut data, 2, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_u32_le(&data, 2).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_read_ascii_string_trims_trailing_nulls() {
        assert_eq!(read_ascii_string(b"Hello\0\0"), "Hello");
        assert_eq!(read_ascii_string(b"Hello\0World\0\0"), "Hello\0World");
    }

    #[test]
    fn test_utf16_roundtrip() {
        let encoded = write_utf16_string("Hello");
        let decoded = read_utf16_string(&encoded, 0).unwrap();
        assert_eq!(decoded, "Hello");
    }

    #[test]
    fn test_offset_conversion_roundtrip() {
        assert_eq!(cell_offset_to_absolute(0).unwrap(), 0x1000);
        assert_eq!(cell_offset_to_absolute(0x20).unwrap(), 0x1020);
        assert_eq!(absolute_to_cell_offset(0x1020).unwrap(), 0x20);
        assert!(cell_offset_to_absolute(u32::MAX).is_err());
        assert!(absolute_to_cell_offset(0).is_err());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(is_none(0xFFFF_FFFF));
        assert!(!is_none(0));
    }

    #[test]
    fn test_filetime_roundtrip() {
        let dt = Utc::now();
        let ft = datetime_to_filetime(dt);
        let back = filetime_to_datetime(ft).unwrap();
        assert_eq!(dt.timestamp(), back.timestamp());
    }

    #[test]
    fn test_checksum_xor_first_127_dwords() {
        let mut data = vec![0u8; 4096];
        write_u32_le(&mut data, 0, 1).unwrap();
        write_u32_le(&mut data, 4, 2).unwrap();
        assert_eq!(calculate_checksum(&data), 1 ^ 2);
    }
}
