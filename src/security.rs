//! Security descriptor record (sk): parsing and serialization.
//!
//! Security cells form a circular doubly-linked list shared between every
//! key that references the same descriptor (`reference_count` tracks how
//! many). This crate stores and returns the descriptor as an opaque blob;
//! it never interprets the SID/ACL structure within it.

use crate::error::{RegistryError, Result};
use crate::primitives::read_u32_le;

const SECURITY_MIN_SIZE: usize = 20;

/// Security descriptor (sk) record.
#[derive(Debug, Clone)]
pub struct SecurityDescriptor {
    /// Reserved, always observed as zero; preserved on round-trip.
    pub unknown1: u16,
    /// Relative offset of the next entry in this hive's sk list.
    pub flink: u32,
    /// Relative offset of the previous entry in this hive's sk list.
    pub blink: u32,
    /// Number of key nodes currently referencing this descriptor.
    pub reference_count: u32,
    /// Raw security descriptor bytes (SID/ACL structure, uninterpreted).
    pub descriptor: Vec<u8>,
}

impl SecurityDescriptor {
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < SECURITY_MIN_SIZE {
            return Err(RegistryError::truncated(offset, "security cell shorter than 20 bytes"));
        }
        if &data[0..2] != b"sk" {
            return Err(RegistryError::format_invalid(offset, "expected 'sk' signature"));
        }

        let unknown1 = u16::from_le_bytes([data[2], data[3]]);
        let flink = read_u32_le(data, 0x04)?;
        let blink = read_u32_le(data, 0x08)?;
        let reference_count = read_u32_le(data, 0x0C)?;
        let descriptor_size = read_u32_le(data, 0x10)? as usize;

        let descriptor = data
            .get(0x14..0x14 + descriptor_size)
            .ok_or_else(|| RegistryError::truncated(offset, "security descriptor runs past cell end"))?
            .to_vec();

        Ok(SecurityDescriptor {
            unknown1,
            flink,
            blink,
            reference_count,
            descriptor,
        })
    }

    /// Builds a new single-member list: `flink`/`blink` both point at the
    /// cell's own (not-yet-known) offset; the caller fixes them up once the
    /// cell has been allocated.
    pub fn new(descriptor: Vec<u8>) -> Self {
        SecurityDescriptor {
            unknown1: 0,
            flink: 0,
            blink: 0,
            reference_count: 1,
            descriptor,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECURITY_MIN_SIZE + self.descriptor.len());
        out.extend_from_slice(b"sk");
        out.extend_from_slice(&self.unknown1.to_le_bytes());
        out.extend_from_slice(&self.flink.to_le_bytes());
        out.extend_from_slice(&self.blink.to_le_bytes());
        out.extend_from_slice(&self.reference_count.to_le_bytes());
        out.extend_from_slice(&(self.descriptor.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.descriptor);
        out
    }

    pub fn link(&mut self, flink: u32, blink: u32) {
        self.flink = flink;
        self.blink = blink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_minimum_size() {
        let data = vec![0u8; 19];
        assert!(SecurityDescriptor::parse(&data, 0).is_err());
    }

    #[test]
    fn test_security_invalid_signature() {
        let mut data = vec![0u8; 20];
        data[0..2].copy_from_slice(b"XX");
        assert!(SecurityDescriptor::parse(&data, 0).is_err());
    }

    #[test]
    fn test_security_roundtrip() {
        let mut sd = SecurityDescriptor::new(vec![1, 2, 3, 4, 5]);
        sd.link(0x20, 0x20);
        let bytes = sd.to_bytes();
        let parsed = SecurityDescriptor::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.descriptor, vec![1, 2, 3, 4, 5]);
        assert_eq!(parsed.reference_count, 1);
        assert_eq!(parsed.flink, 0x20);
    }
}
