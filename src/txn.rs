//! Transaction manager: begin/commit/rollback over the base block's
//! sequence numbers and an ordered, cancellable flush.
//!
//! There is no write-ahead log here (that's the `.LOG1`/`.LOG2` machinery
//! this crate doesn't implement) and mutations are applied in place as
//! they happen, not staged. That makes `rollback` genuinely best-effort:
//! it can stop a commit from publishing a transaction's writes by never
//! advancing the secondary sequence or header checksum, but it cannot
//! erase bytes a mutation already wrote into the mapping. Callers that
//! need real undo must not reuse a hive after a rollback without
//! reloading it from its last-committed state on disk.

use crate::base_block::{BaseBlock, BASE_BLOCK_SIZE};
use crate::dirty::DirtyTracker;
use crate::error::{RegistryError, Result};
use crate::storage::Backing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How aggressively `commit` pushes bytes to stable storage. Only matters
/// for file-backed hives — an in-memory hive has nothing to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Flush the header range after commit; leave everything else to the
    /// OS's ordinary writeback. The default.
    Auto,
    /// Flush the header range, then flush the entire mapping again as an
    /// extra guarantee before returning.
    Always,
    /// Flush nothing; the caller accepts that a crash before the next
    /// checkpoint can lose this commit's header update.
    Never,
}

/// A cooperative stop signal checked at flush boundaries. Cloning shares
/// the same underlying flag, so a caller can hold one end and cancel a
/// commit running on another thread... though this crate has no internal
/// task runtime of its own, so in practice it's checked synchronously
/// within the same call.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(RegistryError::Cancelled("commit cancelled".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Active,
}

/// Drives a hive's base block through begin/commit/rollback. Holds no
/// reference to the hive itself — every call takes the pieces it needs,
/// matching the free-function style the rest of the write path uses.
pub struct TransactionManager {
    state: State,
    durability: Durability,
}

impl TransactionManager {
    pub fn new(durability: Durability) -> Self {
        TransactionManager { state: State::Idle, durability }
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    /// Bumps the primary sequence number, marking the hive dirty relative
    /// to its secondary sequence. Idempotent: calling `begin` again while
    /// already active does nothing.
    pub fn begin(&mut self, backing: &mut Backing, base_block: &mut BaseBlock) -> Result<()> {
        if self.state == State::Active {
            return Ok(());
        }
        base_block.bump_primary_sequence(backing.as_mut_slice())?;
        self.state = State::Active;
        Ok(())
    }

    /// Flushes accumulated writes in dirty-range order, then publishes the
    /// transaction by equalizing the sequence numbers and recomputing the
    /// header checksum. Idempotent: calling `commit` with no active
    /// transaction does nothing. `cancel` is consulted before flushing the
    /// body and again before touching the header — a cancellation
    /// observed at either boundary leaves the hive exactly as it was
    /// (dirty, unpublished), never partially committed.
    pub fn commit(
        &mut self,
        backing: &mut Backing,
        base_block: &mut BaseBlock,
        dirty: &mut DirtyTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.state == State::Idle {
            return Ok(());
        }

        cancel.check()?;
        for range in dirty.ranges() {
            if range.start < BASE_BLOCK_SIZE as u32 {
                continue; // header is flushed separately, after the checksum is final
            }
            backing.flush_range(range.start as usize, (range.end - range.start) as usize)?;
        }

        cancel.check()?;
        base_block.finalize_commit(backing.as_mut_slice())?;
        dirty.mark(0, BASE_BLOCK_SIZE as u32);
        backing.flush_range(0, BASE_BLOCK_SIZE)?;
        self.apply_durability(backing)?;

        dirty.clear();
        self.state = State::Idle;
        Ok(())
    }

    fn apply_durability(&self, backing: &Backing) -> Result<()> {
        match self.durability {
            Durability::Never => Ok(()),
            Durability::Auto => Ok(()),
            Durability::Always => backing.flush(),
        }
    }

    /// Discards the dirty tracker without publishing the transaction: the
    /// primary sequence stays bumped (so the hive is still observably
    /// dirty relative to its secondary sequence) and no header field is
    /// touched. See the module docs for what this does and doesn't undo.
    pub fn rollback(&mut self, dirty: &mut DirtyTracker) {
        dirty.clear();
        self.state = State::Idle;
    }
}
