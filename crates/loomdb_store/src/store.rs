//! Backing store trait definitions.

use crate::error::StoreResult;

/// A transactional key/value backing store.
///
/// Stores are **opaque byte stores** organized into named collections. They
/// provide snapshot-isolated reads and atomic single-writer commits; the
/// engine above owns all semantics (changesets, caches, extensions).
///
/// # Invariants
///
/// - Commit tokens are strictly increasing by 1, starting from the value
///   reported by `committed_snapshot()` at open
/// - A read handle at snapshot `s` observes exactly the state produced by
///   commits with token `<= s`, never a partial commit
/// - Writes staged on a [`WriteHandle`] are invisible to every read handle
///   until `commit` returns
///
/// # Implementors
///
/// - [`super::MemoryStore`] - in-memory MVCC store for testing and embedding
pub trait KvStore: Send + Sync {
    /// Opens a read transaction pinned to the given snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::UnknownSnapshot`] if the store has never
    /// committed `snapshot`.
    fn begin_read(&self, snapshot: u64) -> StoreResult<Box<dyn ReadHandle + '_>>;

    /// Opens a write transaction.
    ///
    /// The store does not serialize writers itself; the engine guarantees at
    /// most one write handle is live at a time (the global write slot).
    fn begin_write(&self) -> StoreResult<Box<dyn WriteHandle + '_>>;

    /// Returns the latest committed snapshot token.
    fn committed_snapshot(&self) -> u64;
}

/// A snapshot-isolated read transaction.
pub trait ReadHandle {
    /// Reads the value for `key` in `collection`, as of this handle's
    /// snapshot.
    fn get(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Returns every live `(key, value)` pair in `collection`, as of this
    /// handle's snapshot, in unspecified order.
    fn scan(&self, collection: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

/// A write transaction.
///
/// Reads through a write handle observe the handle's own staged writes on
/// top of the latest committed state.
pub trait WriteHandle: ReadHandle {
    /// Stages a put of `value` under `key` in `collection`.
    fn put(&mut self, collection: &str, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Stages a deletion of `key` in `collection`.
    fn delete(&mut self, collection: &str, key: &str) -> StoreResult<()>;

    /// Stages removal of every key in `collection`.
    fn clear(&mut self, collection: &str) -> StoreResult<()>;

    /// Atomically applies all staged writes.
    ///
    /// Returns the new commit token. On error, nothing was applied.
    fn commit(self: Box<Self>) -> StoreResult<u64>;

    /// Discards all staged writes.
    fn rollback(self: Box<Self>);
}
