//! # Windows Registry Hive Engine
//!
//! A read/write engine for the Windows Registry's on-disk hive format,
//! written in Rust.
//!
//! ## Features
//!
//! - **Read and write**: parses existing hives and mutates them in place —
//!   creating keys, setting values, deleting both — through a transaction
//!   boundary that keeps the base block's sequence numbers honest.
//! - **Memory-mapped I/O**: file-backed hives are mapped read/write; an
//!   in-memory hive (`Hive::from_vec`) works identically for tests or hives
//!   that never touch disk.
//! - **Complete record support**: base block, bins, the allocator's free
//!   lists, and all six record kinds (`nk`/`vk`/`sk`/`lf`/`lh`/`li`/`ri`,
//!   plus `db` for values over 16 KB).
//! - **Type-safe values**: `REG_SZ`, `REG_EXPAND_SZ`, `REG_BINARY`,
//!   `REG_DWORD[_BIG_ENDIAN]`, `REG_MULTI_SZ`, `REG_QWORD` decode into
//!   `ValueData`.
//!
//! ## Architecture
//!
//! 1. **Base Block** (`base_block`): hive metadata, root key offset,
//!    sequence numbers, checksum.
//! 2. **Hive Bins** (`hbin`): 4KB-aligned blocks containing cells.
//! 3. **Cells** (`cell`, `primitives`): the shared signature/flag types and
//!    little-endian primitives every record kind is built from.
//! 4. **Records** (`key`, `value`, `subkey_list`, `bigdata`, `security`):
//!    typed views over `nk`/`vk`/`lf`/`lh`/`li`/`ri`/`db`/`sk` cells.
//! 5. **Allocator** (`alloc`): free-list cell allocation, splitting,
//!    forward coalescing, and bin/file growth.
//! 6. **Index maintenance** (`index`): subkey-index hashing, ordering, and
//!    split rules, operating purely on `subkey_list` values.
//! 7. **Composed operations** (`editor`): the actual key/value mutations,
//!    built on `alloc` + `index` + the record modules.
//! 8. **Transactions** (`txn`): begin/commit/rollback over the base block.
//! 9. **Facade** (`hive`): `Hive`, tying every layer together behind one
//!    open/read/write/commit API.
//!
//! ## Binary Layout
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Version, timestamps, root offset
//!   - Checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Security descriptors (sk)
//!       - Big data blocks (db)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use hive_engine::{Hive, ValueType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = Hive::open("SOFTWARE")?;
//!
//! hive.begin()?;
//! let key = hive.ensure_key("Vendor\\Product")?;
//! hive.upsert_value(key, "Version", ValueType::Dword, &3u32.to_le_bytes())?;
//! hive.commit()?;
//!
//! if let Some(offset) = hive.find("Vendor\\Product")? {
//!     for name in hive.list_subkeys(offset)? {
//!         println!("subkey: {name}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Non-goals
//!
//! - Replaying `.LOG1`/`.LOG2` transaction log files. Writes land directly
//!   in the mapped hive; there is no write-ahead log here.
//! - Security descriptor ACL interpretation — `sk` cells round-trip their
//!   raw descriptor bytes but this crate doesn't parse SIDs or ACEs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod base_block;
pub mod bigdata;
pub mod cell;
pub mod dirty;
pub mod editor;
pub mod error;
pub mod hbin;
pub mod hive;
pub mod index;
pub mod key;
pub mod name_cache;
pub mod primitives;
pub mod security;
pub mod storage;
pub mod subkey_list;
pub mod txn;
pub mod value;

// Re-export main types for convenience.
pub use base_block::BaseBlock;
pub use cell::{CellType, KeyNodeFlags, ValueType};
pub use error::{RegistryError, Result};
pub use hbin::HbinHeader;
pub use hive::{Hive, HbinIterator, RegistryKey, RegistryValue};
pub use key::KeyNode;
pub use storage::Backing;
pub use subkey_list::{SubkeyList, SubkeyListEntry, SubkeyListType};
pub use txn::{CancellationToken, Durability};
pub use value::{ValueData, ValueKey};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
