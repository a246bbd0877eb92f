//! Error types for the hive engine.
//!
//! Every fallible operation reports one of the kinds below; no error is
//! recovered inside the core. Parsing functions return the first
//! inconsistency found without attempting repair. Variants carry a
//! human-readable context string and, where applicable, the byte offset at
//! which the fault was detected.

use std::io;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while parsing, navigating, or mutating a hive.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Bad signature, bad version, failed checksum, misaligned size — the
    /// hive (or a structure within it) is not well-formed. Surfaced before
    /// the hive is considered open.
    #[error("invalid format at offset {offset:#x}: {context}")]
    FormatInvalid { context: String, offset: u32 },

    /// A view or slice would extend past the buffer that contains it.
    #[error("truncated data at offset {offset:#x}: {context}")]
    FormatTruncated { context: String, offset: u32 },

    /// A relative offset resolves outside the data region, or into a free
    /// (unallocated) cell, or to a cell of the wrong kind for its position.
    #[error("relative offset {offset:#x} out of range: {context}")]
    RefOutOfRange { context: String, offset: u32 },

    /// A name was absent from an index or value list.
    #[error("not found: {0}")]
    NotFound(String),

    /// `ensure_key` (or similar) found a conflicting entity of the wrong kind.
    #[error("already exists: {0}")]
    Exists(String),

    /// No free cell could satisfy an allocation and growth was denied or failed.
    #[error("allocator exhausted: {0}")]
    AllocatorExhausted(String),

    /// A mutation was attempted outside `begin`/`commit`, or while the hive
    /// was opened dirty (unequal sequence numbers).
    #[error("transaction required: {0}")]
    TransactionRequired(String),

    /// A cancellation token fired during a flush.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RegistryError {
    /// Builds a `FormatInvalid` with context.
    pub fn format_invalid(offset: u32, context: impl Into<String>) -> Self {
        Self::FormatInvalid {
            context: context.into(),
            offset,
        }
    }

    /// Builds a `FormatTruncated` with context.
    pub fn truncated(offset: u32, context: impl Into<String>) -> Self {
        Self::FormatTruncated {
            context: context.into(),
            offset,
        }
    }

    /// Builds a `RefOutOfRange` with context.
    pub fn ref_out_of_range(offset: u32, context: impl Into<String>) -> Self {
        Self::RefOutOfRange {
            context: context.into(),
            offset,
        }
    }

    /// Builds a `NotFound` for a named item of a given kind.
    pub fn not_found(item_kind: &str, name: &str) -> Self {
        Self::NotFound(format!("{item_kind} '{name}'"))
    }

    /// Builds an `Exists` error for a conflicting entity.
    pub fn exists(item_kind: &str, name: &str) -> Self {
        Self::Exists(format!("{item_kind} '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_invalid_carries_offset() {
        let err = RegistryError::format_invalid(0x1000, "bad signature");
        match err {
            RegistryError::FormatInvalid { offset, .. } => assert_eq!(offset, 0x1000),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_not_found_message() {
        let err = RegistryError::not_found("value", "DisplayName");
        assert_eq!(err.to_string(), "not found: value 'DisplayName'");
    }
}
