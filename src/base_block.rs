//! Base block (hive header) parsing, validation, and mutation.
//!
//! The base block is the first 4096 bytes of a hive file. It carries the
//! root key pointer, the two sequence numbers that make crash consistency
//! observable, and the XOR checksum that guards the header itself.

use crate::error::{RegistryError, Result};
use crate::primitives::{
    calculate_checksum, now_filetime, read_fixed_ascii, read_u32_le, write_u32_le,
};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the checksum field in the base block.
const CHECKSUM_OFFSET: usize = 0x1FC;

/// Parsed, validated base block.
///
/// `BaseBlock` mirrors the on-disk header exactly; mutation methods write
/// straight back into the bytes they were parsed from (through
/// `Hive`/the allocator), they never diverge from it.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    pub signature: [u8; 4],
    pub primary_sequence: u32,
    pub secondary_sequence: u32,
    pub last_written: u64,
    pub major_version: u32,
    pub minor_version: u32,
    pub file_type: u32,
    pub file_format: u32,
    pub root_cell_offset: u32,
    /// Length of the bin region in bytes (spec: `data_size`). Always a
    /// multiple of 4096.
    pub data_size: u32,
    pub clustering_factor: u32,
    pub file_name: String,
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses and validates a base block from the first 4096 bytes of a hive.
    ///
    /// Rejects: wrong signature, wrong major version, minor version outside
    /// `{3,4,5,6}`, non-4096-aligned `data_size`, zero or out-of-bounds root
    /// pointer, reported length exceeding the file length, checksum mismatch.
    /// Unequal sequence numbers are tolerated — they are informational, not
    /// fatal (see `is_clean`).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::format_invalid(
                0,
                format!("hive too small: {} bytes (minimum {BASE_BLOCK_SIZE})", data.len()),
            ));
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);
        if &signature != REGF_SIGNATURE {
            return Err(RegistryError::format_invalid(
                0,
                format!("bad base block signature: {signature:?}"),
            ));
        }

        let primary_sequence = read_u32_le(data, 0x04)?;
        let secondary_sequence = read_u32_le(data, 0x08)?;
        let last_written =
            u64::from(read_u32_le(data, 0x0C)?) | (u64::from(read_u32_le(data, 0x10)?) << 32);
        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, 0x24)?;
        let data_size = read_u32_le(data, 0x28)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;
        let file_name = read_fixed_ascii(&data[0x30..0xB0], 64);
        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        if major_version != 1 || !(3..=6).contains(&minor_version) {
            return Err(RegistryError::format_invalid(
                0x14,
                format!("unsupported hive version {major_version}.{minor_version}"),
            ));
        }

        if data_size % BASE_BLOCK_SIZE as u32 != 0 {
            return Err(RegistryError::format_invalid(
                0x28,
                format!("data_size {data_size:#x} is not a multiple of 4096"),
            ));
        }

        if root_cell_offset == 0 || root_cell_offset >= data_size {
            return Err(RegistryError::format_invalid(
                0x24,
                format!("root pointer {root_cell_offset:#x} is zero or >= data_size {data_size:#x}"),
            ));
        }

        let declared_file_size = BASE_BLOCK_SIZE as u64 + data_size as u64;
        if declared_file_size > data.len() as u64 {
            return Err(RegistryError::format_invalid(
                0x28,
                format!(
                    "declared file size {declared_file_size:#x} exceeds actual length {:#x}",
                    data.len()
                ),
            ));
        }

        let calculated = calculate_checksum(data);
        if checksum != calculated {
            return Err(RegistryError::format_invalid(
                CHECKSUM_OFFSET as u32,
                format!("checksum mismatch: header says {checksum:#x}, computed {calculated:#x}"),
            ));
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            data_size,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// True when primary and secondary sequence numbers match — the last
    /// transaction committed fully. A hive opened with unequal sequences is
    /// conventionally treated as read-only by callers above the core.
    pub fn is_clean(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// The declared total file size (`0x1000 + data_size`).
    pub fn file_size(&self) -> u64 {
        BASE_BLOCK_SIZE as u64 + self.data_size as u64
    }

    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        crate::primitives::filetime_to_datetime(self.last_written)
    }

    /// Bumps `data_size` by `delta` bytes in both the parsed struct and the
    /// backing bytes (used after appending a bin). Does not touch the checksum.
    pub fn bump_data_size(&mut self, bytes: &mut [u8], delta: u32) -> Result<()> {
        self.data_size = self
            .data_size
            .checked_add(delta)
            .ok_or_else(|| RegistryError::format_invalid(0x28, "data_size overflow"))?;
        write_u32_le(bytes, 0x28, self.data_size)
    }

    /// Sets the root cell pointer (builder use only — not part of the
    /// transaction protocol).
    pub fn set_root_cell_offset(&mut self, bytes: &mut [u8], root: u32) -> Result<()> {
        self.root_cell_offset = root;
        write_u32_le(bytes, 0x24, root)
    }

    /// Transaction-manager-only: sets the secondary sequence equal to the
    /// primary, refreshes the last-written timestamp, and recomputes the
    /// checksum. Does not touch the primary sequence (that happens in
    /// `bump_primary_sequence`, at `begin`).
    pub fn finalize_commit(&mut self, bytes: &mut [u8]) -> Result<()> {
        self.secondary_sequence = self.primary_sequence;
        self.last_written = now_filetime();
        write_u32_le(bytes, 0x08, self.secondary_sequence)?;
        write_u32_le(bytes, 0x0C, self.last_written as u32)?;
        write_u32_le(bytes, 0x10, (self.last_written >> 32) as u32)?;
        self.recompute_checksum(bytes)
    }

    /// Transaction-manager-only: increments the primary sequence number
    /// (the `begin` step).
    pub fn bump_primary_sequence(&mut self, bytes: &mut [u8]) -> Result<()> {
        self.primary_sequence = self.primary_sequence.wrapping_add(1);
        write_u32_le(bytes, 0x04, self.primary_sequence)
    }

    /// Recomputes and stores the checksum over the current byte contents.
    pub fn recompute_checksum(&mut self, bytes: &mut [u8]) -> Result<()> {
        self.checksum = calculate_checksum(bytes);
        write_u32_le(bytes, CHECKSUM_OFFSET, self.checksum)
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hive {}.{}, root={:#x}, data_size={} bytes, clean={}, name={:?}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.data_size,
            self.is_clean(),
            self.file_name
        )
    }
}
