//! Sharded, case-insensitive name-to-offset cache.
//!
//! Resolving a path component to a key-node offset means walking a subkey
//! index and comparing names; this cache remembers recent lookups so a
//! repeated `find("Software\\Microsoft\\Windows")` doesn't re-walk the same
//! prefix every call. Keys are bucketed by an FNV-1a hash of the
//! case-folded name so sibling locks stay uncontended under concurrent
//! readers.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const SHARD_COUNT: usize = 16;

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Case-insensitive normalization applied before hashing and storage.
/// Registry key/value name comparison is case-insensitive; folding here
/// means callers never need to worry about it.
fn normalize(name: &str) -> Vec<u8> {
    name.to_uppercase().into_bytes()
}

struct Shard {
    cache: Mutex<LruCache<Vec<u8>, u32>>,
}

/// Cache mapping `(parent_offset, name)` to a resolved key-node offset.
pub struct NameCache {
    shards: Vec<Shard>,
}

impl NameCache {
    /// `capacity_per_shard` bounds each of the `SHARD_COUNT` shards
    /// independently, so total entries are bounded by roughly
    /// `capacity_per_shard * SHARD_COUNT`.
    pub fn new(capacity_per_shard: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity_per_shard.max(1)).unwrap();
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                cache: Mutex::new(LruCache::new(capacity)),
            })
            .collect();
        NameCache { shards }
    }

    fn composite_key(parent_offset: u32, name: &str) -> Vec<u8> {
        let mut key = parent_offset.to_le_bytes().to_vec();
        key.extend_from_slice(&normalize(name));
        key
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let index = (fnv1a(key) as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Looks up the key-node offset for `name` under `parent_offset`.
    pub fn get(&self, parent_offset: u32, name: &str) -> Option<u32> {
        let key = Self::composite_key(parent_offset, name);
        let shard = self.shard_for(&key);
        shard.cache.lock().unwrap().get(&key).copied()
    }

    /// Records that `name` under `parent_offset` resolves to `offset`.
    pub fn put(&self, parent_offset: u32, name: &str, offset: u32) {
        let key = Self::composite_key(parent_offset, name);
        let shard = self.shard_for(&key);
        shard.cache.lock().unwrap().put(key, offset);
    }

    /// Drops any cached entry for `name` under `parent_offset` (called on
    /// rename or delete, where a stale hit would resolve to the wrong cell).
    pub fn invalidate(&self, parent_offset: u32, name: &str) {
        let key = Self::composite_key(parent_offset, name);
        let shard = self.shard_for(&key);
        shard.cache.lock().unwrap().pop(&key);
    }

    /// Drops every cached entry (called after a rollback, where offsets
    /// may have been reused for different cells).
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.cache.lock().unwrap().clear();
        }
    }
}
