//! `Hive`: the top-level facade over a registry hive file.
//!
//! Everything below this module operates on loose bytes, offsets, and
//! explicit `&mut` parameters; `Hive` is where those pieces become a single
//! object a caller opens once and drives through a read/write session. It
//! owns the backing bytes, the parsed base block, the allocator's free
//! lists, the dirty tracker, the name cache, and the transaction manager,
//! and wires them together the way `editor.rs`'s free functions expect.
//!
//! Reads never require a transaction. Writes do: `begin()` must be called
//! first, and every mutating method refuses with
//! `RegistryError::TransactionRequired` if the hive was opened with
//! mismatched sequence numbers (a sign of an unclean shutdown) or if no
//! transaction is currently active. Concurrency is single-writer,
//! multi-reader at the level of a single process — there is no internal
//! task runtime here, and nothing stops two `Hive` handles on the same file
//! from racing, so callers needing that guarantee must serialize writers
//! themselves.

use crate::alloc::Allocator;
use crate::base_block::{BaseBlock, BASE_BLOCK_SIZE};
use crate::cell::ValueType;
use crate::dirty::DirtyTracker;
use crate::editor;
use crate::error::{RegistryError, Result};
use crate::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use crate::key::KeyNode;
use crate::name_cache::NameCache;
use crate::storage::Backing;
use crate::txn::{CancellationToken, Durability, TransactionManager};
use crate::value::{ValueData, ValueKey};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Capacity of each of the name cache's 16 shards.
const NAME_CACHE_SHARD_CAPACITY: usize = 256;

/// Root key aliases stripped from the front of a path, case-insensitively.
/// A hive file has no notion of `HKEY_LOCAL_MACHINE`, but callers routinely
/// pass paths copied straight out of `regedit` or `reg.exe` output.
const ROOT_ALIASES: &[&str] = &[
    "hklm",
    "hkey_local_machine",
    "hkcu",
    "hkey_current_user",
    "hku",
    "hkey_users",
    "hkcr",
    "hkey_classes_root",
    "hkcc",
    "hkey_current_config",
];

fn parse_path(path: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = path.split(['\\', '/']).filter(|s| !s.is_empty()).collect();
    if let Some(first) = segments.first() {
        if ROOT_ALIASES.iter().any(|alias| alias.eq_ignore_ascii_case(first)) {
            segments.remove(0);
        }
    }
    segments
}

/// A registry hive open for reading and, once a transaction is active, writing.
pub struct Hive {
    backing: Backing,
    base_block: BaseBlock,
    allocator: Allocator,
    dirty: DirtyTracker,
    name_cache: NameCache,
    txn: TransactionManager,
    cancel: CancellationToken,
    /// Set once at open time from `base_block.is_clean()`. Deliberately not
    /// re-derived later: once a transaction begins, the live base block is
    /// *supposed* to show unequal sequences until commit, and that self
    /// inflicted dirtiness must not trip the same guard that protects
    /// against opening a hive left dirty by a previous, uncommitted session.
    opened_dirty: bool,
}

impl Hive {
    /// Opens a hive file for read/write access, memory-mapping it.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("opening hive");
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let backing = Backing::open_file(file)?;
        Self::from_backing(backing)
    }

    /// Opens a hive backed by an in-memory buffer rather than a file. Useful
    /// for tests and for hives constructed entirely in memory before ever
    /// touching disk.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        Self::from_backing(Backing::from_vec(data))
    }

    fn from_backing(backing: Backing) -> Result<Self> {
        let base_block = BaseBlock::parse(backing.as_slice())?;
        let mut allocator = Allocator::new();
        allocator.scan(&backing, &base_block)?;

        let opened_dirty = !base_block.is_clean();
        if opened_dirty {
            warn!(
                primary = base_block.primary_sequence,
                secondary = base_block.secondary_sequence,
                "hive opened with mismatched sequence numbers; writes will be refused until reloaded"
            );
        }
        debug!(%base_block, "hive opened");

        Ok(Hive {
            backing,
            base_block,
            allocator,
            dirty: DirtyTracker::new(),
            name_cache: NameCache::new(NAME_CACHE_SHARD_CAPACITY),
            txn: TransactionManager::new(Durability::Auto),
            cancel: CancellationToken::new(),
            opened_dirty,
        })
    }

    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// True if the hive's sequence numbers matched at open time. A hive
    /// opened dirty stays read-only for the lifetime of this handle,
    /// independent of the transient dirtiness an in-progress transaction
    /// introduces into the live base block.
    pub fn is_clean(&self) -> bool {
        !self.opened_dirty
    }

    /// Relative offset of the root key node.
    pub fn root_offset(&self) -> u32 {
        self.base_block.root_cell_offset
    }

    /// A cloneable handle that can cancel an in-flight `commit` from
    /// elsewhere. See `txn::CancellationToken`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Changes how aggressively `commit` flushes to stable storage. Refuses
    /// mid-transaction, since switching durability policy partway through a
    /// commit's bookkeeping would be meaningless.
    pub fn set_durability(&mut self, durability: Durability) -> Result<()> {
        if self.txn.is_active() {
            return Err(RegistryError::TransactionRequired(
                "cannot change durability while a transaction is active".to_string(),
            ));
        }
        self.txn = TransactionManager::new(durability);
        Ok(())
    }

    fn require_openable_for_write(&self) -> Result<()> {
        if self.opened_dirty {
            return Err(RegistryError::TransactionRequired(
                "hive was opened with mismatched sequence numbers; reload before writing".to_string(),
            ));
        }
        Ok(())
    }

    fn require_active_transaction(&self) -> Result<()> {
        self.require_openable_for_write()?;
        if !self.txn.is_active() {
            return Err(RegistryError::TransactionRequired(
                "no active transaction; call begin() first".to_string(),
            ));
        }
        Ok(())
    }

    /// Starts a write transaction by bumping the primary sequence number.
    /// Idempotent while already active.
    pub fn begin(&mut self) -> Result<()> {
        self.require_openable_for_write()?;
        self.txn.begin(&mut self.backing, &mut self.base_block)
    }

    /// Flushes dirty ranges and publishes the transaction. A no-op if no
    /// transaction is active.
    #[instrument(skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.txn.commit(&mut self.backing, &mut self.base_block, &mut self.dirty, &self.cancel)
    }

    /// Discards the dirty tracker and clears the name cache, since any
    /// offsets it learned during the aborted transaction may no longer
    /// point at what they did. Writes already applied to the backing bytes
    /// are not undone — see `txn`'s module docs.
    pub fn rollback(&mut self) {
        self.txn.rollback(&mut self.dirty);
        self.name_cache.clear();
    }

    /// Resolves a backslash-separated path (optionally prefixed with a root
    /// alias such as `HKLM` or `HKEY_LOCAL_MACHINE`) to a key offset,
    /// warming the name cache along the way.
    pub fn find(&self, path: &str) -> Result<Option<u32>> {
        let mut current = self.base_block.root_cell_offset;
        for segment in parse_path(path) {
            if let Some(cached) = self.name_cache.get(current, segment) {
                current = cached;
                continue;
            }
            match editor::find_child(&self.backing, current, segment)? {
                Some(offset) => {
                    self.name_cache.put(current, segment, offset);
                    current = offset;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Names of the direct subkeys of `key_offset`.
    pub fn list_subkeys(&self, key_offset: u32) -> Result<Vec<String>> {
        Ok(editor::list_children(&self.backing, key_offset)?.into_iter().map(|c| c.name).collect())
    }

    /// Decoded value data for `name` under `key_offset`, or `None` if no
    /// such value exists.
    pub fn get_value(&self, key_offset: u32, name: &str) -> Result<Option<ValueData>> {
        match editor::find_value(&self.backing, key_offset, name)? {
            Some(vk) => {
                let raw = editor::read_value_data(&self.backing, &vk)?;
                Ok(Some(ValueData::parse(&raw, vk.data_type, vk.data_offset)?))
            }
            None => Ok(None),
        }
    }

    /// Creates every path segment under `path` that doesn't already exist,
    /// returning the final key's offset. Requires an active transaction.
    pub fn ensure_key(&mut self, path: &str) -> Result<u32> {
        self.require_active_transaction()?;
        let root = self.base_block.root_cell_offset;
        let segments = parse_path(path);
        let (offset, created) = editor::ensure_key_path(
            &mut self.allocator,
            &mut self.backing,
            &mut self.base_block,
            &mut self.dirty,
            root,
            &segments,
        )?;
        if created > 0 {
            // New key offsets may reuse cells the name cache still
            // remembers as something else entirely.
            self.name_cache.clear();
        }
        Ok(offset)
    }

    /// Inserts or overwrites a value under `key_offset`. Requires an active
    /// transaction.
    pub fn upsert_value(&mut self, key_offset: u32, name: &str, data_type: ValueType, data: &[u8]) -> Result<()> {
        self.require_active_transaction()?;
        editor::upsert_value(
            &mut self.allocator,
            &mut self.backing,
            &mut self.base_block,
            &mut self.dirty,
            key_offset,
            name,
            data_type,
            data,
        )
    }

    /// Removes a value under `key_offset`. A no-op if it doesn't exist.
    /// Requires an active transaction.
    pub fn delete_value(&mut self, key_offset: u32, name: &str) -> Result<()> {
        self.require_active_transaction()?;
        editor::delete_value(&mut self.allocator, &mut self.backing, &mut self.base_block, &mut self.dirty, key_offset, name)
    }

    /// Deletes `key_offset`, recursing into its subkeys if `recursive` is
    /// set. Errors if it has subkeys and `recursive` is false. Requires an
    /// active transaction.
    #[instrument(skip(self))]
    pub fn delete_key(&mut self, key_offset: u32, recursive: bool) -> Result<()> {
        self.require_active_transaction()?;
        editor::delete_key(
            &mut self.allocator,
            &mut self.backing,
            &mut self.base_block,
            &mut self.dirty,
            key_offset,
            recursive,
        )?;
        self.name_cache.clear();
        Ok(())
    }

    /// A read-only view over the key node at `offset`.
    pub fn key(&self, offset: u32) -> Result<RegistryKey<'_>> {
        let key_node = editor::read_key_node(&self.backing, offset)?;
        Ok(RegistryKey { hive: self, offset, key_node })
    }

    /// A read-only view over the root key node.
    pub fn root_key(&self) -> Result<RegistryKey<'_>> {
        self.key(self.base_block.root_cell_offset)
    }

    /// Walks the subtree rooted at `start` in pre-order, calling `visitor`
    /// on each key. Stops descending (and returns immediately) the first
    /// time `visitor` returns `false`.
    pub fn walk<F>(&self, start: u32, mut visitor: F) -> Result<()>
    where
        F: FnMut(&RegistryKey) -> bool,
    {
        self.walk_inner(start, &mut visitor)
    }

    fn walk_inner(&self, offset: u32, visitor: &mut dyn FnMut(&RegistryKey) -> bool) -> Result<()> {
        let key = self.key(offset)?;
        if !visitor(&key) {
            return Ok(());
        }
        for child in key.subkeys()? {
            self.walk_inner(child.offset, visitor)?;
        }
        Ok(())
    }

    /// Iterates the hive's bins in order, stopping silently (rather than
    /// erroring) at the first bin that fails to parse — consistent with how
    /// `HbinCellIterator` treats corruption past the first cell of a bin.
    pub fn hbins(&self) -> HbinIterator<'_> {
        HbinIterator {
            data: &self.backing.as_slice()[BASE_BLOCK_SIZE..],
            offset: 0,
            limit: self.base_block.data_size,
        }
    }
}

/// Iterates a hive's bins, relative-offset order.
pub struct HbinIterator<'a> {
    data: &'a [u8],
    offset: u32,
    limit: u32,
}

impl<'a> Iterator for HbinIterator<'a> {
    type Item = HbinHeader;

    fn next(&mut self) -> Option<HbinHeader> {
        if self.offset >= self.limit {
            return None;
        }
        let header = HbinHeader::parse(&self.data[self.offset as usize..], self.offset).ok()?;
        self.offset += header.size.max(HBIN_HEADER_SIZE as u32);
        Some(header)
    }
}

/// A read-only view over one key node, borrowed from its owning `Hive`.
pub struct RegistryKey<'a> {
    hive: &'a Hive,
    pub offset: u32,
    key_node: KeyNode,
}

impl<'a> RegistryKey<'a> {
    pub fn name(&self) -> &str {
        &self.key_node.name
    }

    pub fn subkey_count(&self) -> u32 {
        self.key_node.subkey_count
    }

    pub fn value_count(&self) -> u32 {
        self.key_node.value_count
    }

    pub fn last_written(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        crate::primitives::filetime_to_datetime(self.key_node.last_written)
    }

    pub fn subkeys(&self) -> Result<Vec<RegistryKey<'a>>> {
        editor::list_children(&self.hive.backing, self.offset)?
            .into_iter()
            .map(|c| self.hive.key(c.key_offset))
            .collect()
    }

    pub fn values(&self) -> Result<Vec<RegistryValue<'a>>> {
        Ok(editor::list_values(&self.hive.backing, self.offset)?
            .into_iter()
            .map(|value_key| RegistryValue { hive: self.hive, value_key })
            .collect())
    }

    pub fn value(&self, name: &str) -> Result<RegistryValue<'a>> {
        match editor::find_value(&self.hive.backing, self.offset, name)? {
            Some(value_key) => Ok(RegistryValue { hive: self.hive, value_key }),
            None => Err(RegistryError::not_found("value", name)),
        }
    }
}

/// A read-only view over one value, borrowed from its owning `Hive`.
pub struct RegistryValue<'a> {
    hive: &'a Hive,
    value_key: ValueKey,
}

impl<'a> RegistryValue<'a> {
    pub fn name(&self) -> &str {
        &self.value_key.name
    }

    pub fn data_type(&self) -> ValueType {
        self.value_key.data_type
    }

    pub fn raw_data(&self) -> Result<Vec<u8>> {
        editor::read_value_data(&self.hive.backing, &self.value_key)
    }

    pub fn data(&self) -> Result<ValueData> {
        let raw = self.raw_data()?;
        ValueData::parse(&raw, self.value_key.data_type, self.value_key.data_offset)
    }
}
