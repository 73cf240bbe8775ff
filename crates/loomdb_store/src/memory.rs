//! In-memory MVCC store.

use crate::error::{StoreError, StoreResult};
use crate::store::{KvStore, ReadHandle, WriteHandle};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Version chain for one key: `(commit token, value-or-tombstone)`,
/// ascending by token.
type VersionChain = Vec<(u64, Option<Vec<u8>>)>;

/// Keyspace: collection name -> key -> version chain.
type Keyspace = HashMap<String, HashMap<String, VersionChain>>;

/// An in-memory MVCC backing store.
///
/// Every commit appends one version per touched key, stamped with the new
/// commit token. Readers resolve each key to the newest version at or below
/// their snapshot, so a read handle never observes a later commit and never
/// blocks a writer beyond the brief version-map lock.
///
/// Data is lost when the store is dropped. For durable deployments the
/// engine is given a [`KvStore`] backed by an external transactional engine
/// instead.
pub struct MemoryStore {
    versions: RwLock<Keyspace>,
    committed: AtomicU64,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store with committed snapshot 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(HashMap::new()),
            committed: AtomicU64::new(0),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    /// Makes the next `commit` fail with [`StoreError::CommitFailed`]
    /// without applying anything.
    ///
    /// Fault injection for exercising the engine's rollback path in tests.
    pub fn inject_commit_failure(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn resolve(chain: &VersionChain, snapshot: u64) -> Option<Vec<u8>> {
        chain
            .iter()
            .rev()
            .find(|(token, _)| *token <= snapshot)
            .and_then(|(_, value)| value.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn begin_read(&self, snapshot: u64) -> StoreResult<Box<dyn ReadHandle + '_>> {
        let committed = self.committed.load(Ordering::SeqCst);
        if snapshot > committed {
            return Err(StoreError::UnknownSnapshot {
                requested: snapshot,
                committed,
            });
        }
        Ok(Box::new(MemoryReadHandle {
            store: self,
            snapshot,
        }))
    }

    fn begin_write(&self) -> StoreResult<Box<dyn WriteHandle + '_>> {
        let base = self.committed.load(Ordering::SeqCst);
        Ok(Box::new(MemoryWriteHandle {
            store: self,
            base,
            staged: HashMap::new(),
            cleared: HashSet::new(),
        }))
    }

    fn committed_snapshot(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }
}

struct MemoryReadHandle<'a> {
    store: &'a MemoryStore,
    snapshot: u64,
}

impl ReadHandle for MemoryReadHandle<'_> {
    fn get(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let versions = self.store.versions.read();
        Ok(versions
            .get(collection)
            .and_then(|keys| keys.get(key))
            .and_then(|chain| MemoryStore::resolve(chain, self.snapshot)))
    }

    fn scan(&self, collection: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let versions = self.store.versions.read();
        let Some(keys) = versions.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|(key, chain)| {
                MemoryStore::resolve(chain, self.snapshot).map(|value| (key.clone(), value))
            })
            .collect())
    }
}

struct MemoryWriteHandle<'a> {
    store: &'a MemoryStore,
    /// Committed snapshot when the write began.
    base: u64,
    /// Staged writes: `(collection, key)` -> value-or-tombstone.
    staged: HashMap<(String, String), Option<Vec<u8>>>,
    /// Collections cleared before any staged write re-populated them.
    cleared: HashSet<String>,
}

impl ReadHandle for MemoryWriteHandle<'_> {
    fn get(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(collection.to_owned(), key.to_owned())) {
            return Ok(staged.clone());
        }
        if self.cleared.contains(collection) {
            return Ok(None);
        }
        let versions = self.store.versions.read();
        Ok(versions
            .get(collection)
            .and_then(|keys| keys.get(key))
            .and_then(|chain| MemoryStore::resolve(chain, self.base)))
    }

    fn scan(&self, collection: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut merged: HashMap<String, Vec<u8>> = HashMap::new();
        if !self.cleared.contains(collection) {
            let versions = self.store.versions.read();
            if let Some(keys) = versions.get(collection) {
                for (key, chain) in keys {
                    if let Some(value) = MemoryStore::resolve(chain, self.base) {
                        merged.insert(key.clone(), value);
                    }
                }
            }
        }
        for ((coll, key), staged) in &self.staged {
            if coll != collection {
                continue;
            }
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl WriteHandle for MemoryWriteHandle<'_> {
    fn put(&mut self, collection: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.staged
            .insert((collection.to_owned(), key.to_owned()), Some(value));
        Ok(())
    }

    fn delete(&mut self, collection: &str, key: &str) -> StoreResult<()> {
        self.staged
            .insert((collection.to_owned(), key.to_owned()), None);
        Ok(())
    }

    fn clear(&mut self, collection: &str) -> StoreResult<()> {
        self.staged.retain(|(coll, _), _| coll != collection);
        self.cleared.insert(collection.to_owned());
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<u64> {
        if self.store.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::commit_failed("injected failure"));
        }

        let mut versions = self.store.versions.write();
        let token = self.store.committed.load(Ordering::SeqCst) + 1;

        // Cleared collections become tombstones for every key live at base,
        // unless a staged put re-creates the key below.
        for collection in &self.cleared {
            if let Some(keys) = versions.get_mut(collection) {
                for (key, chain) in keys.iter_mut() {
                    let replaced = self
                        .staged
                        .contains_key(&(collection.clone(), key.clone()));
                    if !replaced && MemoryStore::resolve(chain, self.base).is_some() {
                        chain.push((token, None));
                    }
                }
            }
        }

        for ((collection, key), staged) in self.staged {
            versions
                .entry(collection)
                .or_default()
                .entry(key)
                .or_default()
                .push((token, staged));
        }

        // Publish the token while still holding the version lock so no
        // reader can observe the token before its versions.
        self.store.committed.store(token, Ordering::SeqCst);
        Ok(token)
    }

    fn rollback(self: Box<Self>) {
        // Staged writes are dropped with the handle.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_one(store: &MemoryStore, collection: &str, key: &str, value: &[u8]) -> u64 {
        let mut write = store.begin_write().unwrap();
        write.put(collection, key, value.to_vec()).unwrap();
        write.commit().unwrap()
    }

    #[test]
    fn put_then_get() {
        let store = MemoryStore::new();
        let token = put_one(&store, "users", "alice", b"v1");
        assert_eq!(token, 1);

        let read = store.begin_read(token).unwrap();
        assert_eq!(read.get("users", "alice").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn commit_tokens_increase_by_one() {
        let store = MemoryStore::new();
        assert_eq!(put_one(&store, "c", "k", b"a"), 1);
        assert_eq!(put_one(&store, "c", "k", b"b"), 2);
        assert_eq!(store.committed_snapshot(), 2);
    }

    #[test]
    fn snapshot_isolation() {
        let store = MemoryStore::new();
        put_one(&store, "c", "k", b"old");

        let read = store.begin_read(1).unwrap();
        put_one(&store, "c", "k", b"new");

        // Pinned reader still sees the old version.
        assert_eq!(read.get("c", "k").unwrap(), Some(b"old".to_vec()));
        let fresh = store.begin_read(2).unwrap();
        assert_eq!(fresh.get("c", "k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn deletion_is_versioned() {
        let store = MemoryStore::new();
        put_one(&store, "c", "k", b"v");

        let mut write = store.begin_write().unwrap();
        write.delete("c", "k").unwrap();
        write.commit().unwrap();

        let old = store.begin_read(1).unwrap();
        assert_eq!(old.get("c", "k").unwrap(), Some(b"v".to_vec()));
        let new = store.begin_read(2).unwrap();
        assert_eq!(new.get("c", "k").unwrap(), None);
    }

    #[test]
    fn write_handle_reads_own_writes() {
        let store = MemoryStore::new();
        let mut write = store.begin_write().unwrap();
        write.put("c", "k", b"staged".to_vec()).unwrap();
        assert_eq!(write.get("c", "k").unwrap(), Some(b"staged".to_vec()));
        write.delete("c", "k").unwrap();
        assert_eq!(write.get("c", "k").unwrap(), None);
        write.rollback();
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let store = MemoryStore::new();
        let mut write = store.begin_write().unwrap();
        write.put("c", "k", b"v".to_vec()).unwrap();
        write.rollback();

        assert_eq!(store.committed_snapshot(), 0);
        let read = store.begin_read(0).unwrap();
        assert_eq!(read.get("c", "k").unwrap(), None);
    }

    #[test]
    fn clear_tombstones_existing_keys() {
        let store = MemoryStore::new();
        put_one(&store, "c", "a", b"1");
        put_one(&store, "c", "b", b"2");

        let mut write = store.begin_write().unwrap();
        write.clear("c").unwrap();
        write.put("c", "b", b"again".to_vec()).unwrap();
        let token = write.commit().unwrap();

        let read = store.begin_read(token).unwrap();
        assert_eq!(read.get("c", "a").unwrap(), None);
        assert_eq!(read.get("c", "b").unwrap(), Some(b"again".to_vec()));

        // Pre-clear snapshot is intact.
        let old = store.begin_read(2).unwrap();
        assert_eq!(old.get("c", "a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn scan_respects_snapshot_and_staging() {
        let store = MemoryStore::new();
        put_one(&store, "c", "a", b"1");

        let mut write = store.begin_write().unwrap();
        write.put("c", "b", b"2".to_vec()).unwrap();
        write.delete("c", "a").unwrap();

        let mut staged = write.scan("c").unwrap();
        staged.sort();
        assert_eq!(staged, vec![("b".to_owned(), b"2".to_vec())]);
        write.rollback();

        let read = store.begin_read(1).unwrap();
        assert_eq!(read.scan("c").unwrap(), vec![("a".to_owned(), b"1".to_vec())]);
    }

    #[test]
    fn read_at_unknown_snapshot_is_rejected() {
        let store = MemoryStore::new();
        let result = store.begin_read(5);
        assert!(matches!(
            result.map(|_| ()),
            Err(StoreError::UnknownSnapshot {
                requested: 5,
                committed: 0
            })
        ));
    }

    #[test]
    fn injected_commit_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.inject_commit_failure();

        let mut write = store.begin_write().unwrap();
        write.put("c", "k", b"v".to_vec()).unwrap();
        assert!(write.commit().is_err());

        assert_eq!(store.committed_snapshot(), 0);
        let read = store.begin_read(0).unwrap();
        assert_eq!(read.get("c", "k").unwrap(), None);

        // Subsequent commits recover.
        assert_eq!(put_one(&store, "c", "k", b"v"), 1);
    }
}
