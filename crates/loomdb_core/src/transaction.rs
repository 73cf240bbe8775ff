//! Read and read-write transactions.
//!
//! Transactions borrow their [`Connection`] mutably, so at most one is
//! active per connection at any time and both kinds observe exactly the
//! connection's applied snapshot. A read-write transaction additionally
//! holds the database-wide write slot from begin to commit or rollback.

use crate::changeset::{ChangeKind, Changeset, ChangesetBuilder};
use crate::connection::Connection;
use crate::database::DatabaseInner;
use crate::error::{EngineError, EngineResult};
use crate::extension::{
    extension_table, is_extension_table, ExtensionState, HookContext, MutationHook,
};
use crate::types::{ConnectionId, ObjectKey, Snapshot};
use loomdb_store::{ReadHandle, WriteHandle};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

/// Lifecycle of a read-write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Active,
    Committing,
    Committed,
    RolledBack,
}

fn guard_collection(collection: &str) -> EngineResult<()> {
    if is_extension_table(collection) {
        return Err(EngineError::invalid_operation(
            "collection names beginning with 'ext:' are reserved for extension tables",
        ));
    }
    Ok(())
}

/// A read-only transaction pinned to one snapshot.
///
/// Every read observes the connection's applied snapshot, regardless of
/// commits happening elsewhere while the transaction is open. Reads fill
/// the connection's object cache and pin what they touch; the pins are
/// dropped when the transaction ends.
pub struct ReadTransaction<'a> {
    snapshot: u64,
    handle: Box<dyn ReadHandle + 'a>,
    cache: &'a mut crate::cache::ObjectCache<ObjectKey, Vec<u8>>,
    ext_states: &'a [(String, Box<dyn ExtensionState>)],
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn begin(conn: &'a mut Connection) -> EngineResult<Self> {
        let Connection {
            db,
            local_snapshot,
            cache,
            ext_states,
            ..
        } = conn;
        let db: &'a Arc<DatabaseInner> = &*db;
        let snapshot = *local_snapshot;
        let handle = db.store.begin_read(snapshot)?;
        Ok(Self {
            snapshot,
            handle,
            cache,
            ext_states: &**ext_states,
        })
    }

    /// Returns the snapshot this transaction reads at.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.snapshot)
    }

    /// Reads one object, consulting the connection's cache first.
    ///
    /// Extension tables are read straight through: they produce no change
    /// records, so cached entries for them would never be invalidated.
    pub fn get(&mut self, collection: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        if is_extension_table(collection) {
            return Ok(self.handle.get(collection, key)?);
        }
        let object_key = ObjectKey::new(collection, key);
        if let Some(value) = self.cache.get(&object_key) {
            let value = value.clone();
            self.cache.pin(&object_key);
            return Ok(Some(value));
        }
        match self.handle.get(collection, key)? {
            Some(value) => {
                self.cache.set(object_key.clone(), value.clone());
                self.cache.pin(&object_key);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Returns every key-value pair in `collection`, bypassing the cache.
    pub fn scan(&self, collection: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        Ok(self.handle.scan(collection)?)
    }

    /// Typed access to the named extension's per-connection state.
    pub fn extension_state<T: Any>(&self, name: &str) -> EngineResult<&T> {
        extension_state(self.ext_states, name)
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.cache.unpin_all();
    }
}

impl std::fmt::Debug for ReadTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

fn extension_state<'s, T: Any>(
    states: &'s [(String, Box<dyn ExtensionState>)],
    name: &str,
) -> EngineResult<&'s T> {
    let (_, state) = states
        .iter()
        .find(|(n, _)| n == name)
        .ok_or_else(|| EngineError::ExtensionNotFound {
            name: name.to_owned(),
        })?;
    state.as_any().downcast_ref::<T>().ok_or_else(|| {
        EngineError::invalid_operation(format!(
            "extension '{name}' state is not of the requested type"
        ))
    })
}

/// One extension's per-transaction hook, with its name and private-table
/// collection resolved once at begin.
struct HookSlot {
    name: String,
    table: String,
    hook: Box<dyn MutationHook>,
}

/// A read-write transaction holding the database-wide write slot.
///
/// Mutations run the extension hook pipeline synchronously: `will_*`
/// callbacks fire before the primary mutation in registration order, and
/// any error vetoes it, rolling back the entire transaction. Reads see the
/// transaction's own staged mutations.
///
/// Dropping an uncommitted transaction rolls it back.
pub struct WriteTransaction<'a> {
    db: &'a Arc<DatabaseInner>,
    conn_id: ConnectionId,
    base_snapshot: u64,
    local_snapshot: &'a mut u64,
    cache: &'a mut crate::cache::ObjectCache<ObjectKey, Vec<u8>>,
    ext_states: &'a mut Vec<(String, Box<dyn ExtensionState>)>,
    write_active: &'a mut bool,
    handle: Option<Box<dyn WriteHandle + 'a>>,
    state: TransactionState,
    builder: ChangesetBuilder,
    /// Net effect per key, applied to the connection cache on commit.
    staged: HashMap<ObjectKey, Option<Vec<u8>>>,
    /// Collections cleared during this transaction, in order.
    cleared: Vec<String>,
    hooks: Vec<HookSlot>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn begin(conn: &'a mut Connection) -> EngineResult<Self> {
        let conn_id = conn.id();
        let Connection {
            db,
            local_snapshot,
            cache,
            ext_states,
            write_active,
            ..
        } = conn;
        let db: &'a Arc<DatabaseInner> = &*db;
        let base_snapshot = *local_snapshot;

        let hooks = {
            let registry = db.extensions.read();
            registry
                .iter()
                .map(|ext| HookSlot {
                    name: ext.name().to_owned(),
                    table: extension_table(ext.name()),
                    hook: ext.hook(),
                })
                .collect()
        };
        let handle = match db.store.begin_write() {
            Ok(handle) => handle,
            Err(e) => {
                // The caller already marked the write active and holds the
                // slot; undo both before surfacing the failure.
                *write_active = false;
                db.write_slot.release();
                return Err(e.into());
            }
        };

        Ok(Self {
            db,
            conn_id,
            base_snapshot,
            local_snapshot,
            cache,
            ext_states,
            write_active,
            handle: Some(handle),
            state: TransactionState::Active,
            builder: ChangesetBuilder::new(),
            staged: HashMap::new(),
            cleared: Vec::new(),
            hooks,
        })
    }

    /// Returns the snapshot this transaction started from.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.base_snapshot)
    }

    fn ensure_active(&self) -> EngineResult<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(EngineError::invalid_operation(
                "transaction is no longer active",
            ))
        }
    }

    /// Reads one object as this transaction currently sees it: staged
    /// mutations first, then the connection cache, then the store.
    pub fn get(&mut self, collection: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        self.ensure_active()?;
        let object_key = ObjectKey::new(collection, key);
        if let Some(staged) = self.staged.get(&object_key) {
            return Ok(staged.clone());
        }
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| EngineError::invalid_operation("transaction handle missing"))?;
        if is_extension_table(collection) {
            // Hooks keep these tables current without change records; the
            // object cache must never hold them.
            return Ok(handle.get(collection, key)?);
        }
        if self.cleared.iter().any(|c| c == collection) {
            // The connection cache still holds pre-clear values; the store
            // handle knows about the clear.
            return Ok(handle.get(collection, key)?);
        }
        if let Some(value) = self.cache.get(&object_key) {
            let value = value.clone();
            self.cache.pin(&object_key);
            return Ok(Some(value));
        }
        match handle.get(collection, key)? {
            Some(value) => {
                self.cache.set(object_key.clone(), value.clone());
                self.cache.pin(&object_key);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Returns every key-value pair in `collection` as this transaction
    /// currently sees it.
    pub fn scan(&self, collection: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        self.ensure_active()?;
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| EngineError::invalid_operation("transaction handle missing"))?;
        Ok(handle.scan(collection)?)
    }

    /// Typed access to the named extension's per-connection state.
    ///
    /// The state reflects the transaction's base snapshot; it is updated
    /// from the hooks' fragments only after a successful commit.
    pub fn extension_state<T: Any>(&self, name: &str) -> EngineResult<&T> {
        extension_state(self.ext_states, name)
    }

    /// Inserts or updates one object, running the hook pipeline.
    ///
    /// Any error, including an extension veto, rolls the transaction back
    /// before returning.
    pub fn put(&mut self, collection: &str, key: &str, value: Vec<u8>) -> EngineResult<()> {
        let result = self.put_inner(collection, key, value);
        if result.is_err() {
            self.abort_internal();
        }
        result
    }

    fn put_inner(&mut self, collection: &str, key: &str, value: Vec<u8>) -> EngineResult<()> {
        self.ensure_active()?;
        guard_collection(collection)?;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| EngineError::invalid_operation("transaction handle missing"))?;

        match handle.get(collection, key)? {
            None => {
                for slot in &mut self.hooks {
                    let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
                    slot.hook.will_insert(&mut ctx, collection, key, &value)?;
                }
                handle.put(collection, key, value.clone())?;
                for slot in &mut self.hooks {
                    let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
                    slot.hook.did_insert(&mut ctx, collection, key, &value)?;
                }
                self.builder.record(collection, key, ChangeKind::Inserted);
            }
            Some(old) => {
                for slot in &mut self.hooks {
                    let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
                    slot.hook
                        .will_update(&mut ctx, collection, key, &old, &value)?;
                }
                handle.put(collection, key, value.clone())?;
                for slot in &mut self.hooks {
                    let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
                    slot.hook
                        .did_update(&mut ctx, collection, key, &old, &value)?;
                }
                self.builder.record(collection, key, ChangeKind::Updated);
            }
        }
        self.staged
            .insert(ObjectKey::new(collection, key), Some(value));
        Ok(())
    }

    /// Removes one object if present, running the hook pipeline. Removing
    /// a missing key is a no-op.
    pub fn remove(&mut self, collection: &str, key: &str) -> EngineResult<()> {
        let result = self.remove_inner(collection, key);
        if result.is_err() {
            self.abort_internal();
        }
        result
    }

    fn remove_inner(&mut self, collection: &str, key: &str) -> EngineResult<()> {
        self.ensure_active()?;
        guard_collection(collection)?;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| EngineError::invalid_operation("transaction handle missing"))?;

        let Some(old) = handle.get(collection, key)? else {
            return Ok(());
        };
        for slot in &mut self.hooks {
            let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
            slot.hook.will_remove(&mut ctx, collection, key, &old)?;
        }
        handle.delete(collection, key)?;
        for slot in &mut self.hooks {
            let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
            slot.hook.did_remove(&mut ctx, collection, key, &old)?;
        }
        self.builder.record(collection, key, ChangeKind::Removed);
        self.staged.insert(ObjectKey::new(collection, key), None);
        Ok(())
    }

    /// Removes every object in `collection`, running the hook pipeline.
    pub fn remove_all(&mut self, collection: &str) -> EngineResult<()> {
        let result = self.remove_all_inner(collection);
        if result.is_err() {
            self.abort_internal();
        }
        result
    }

    fn remove_all_inner(&mut self, collection: &str) -> EngineResult<()> {
        self.ensure_active()?;
        guard_collection(collection)?;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| EngineError::invalid_operation("transaction handle missing"))?;

        for slot in &mut self.hooks {
            let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
            slot.hook.will_clear(&mut ctx, collection)?;
        }
        handle.clear(collection)?;
        for slot in &mut self.hooks {
            let mut ctx = HookContext::new(handle.as_mut(), &slot.table);
            slot.hook.did_clear(&mut ctx, collection)?;
        }
        self.builder.record_cleared(collection);
        self.staged.retain(|key, _| key.collection != collection);
        if !self.cleared.iter().any(|c| c == collection) {
            self.cleared.push(collection.to_owned());
        }
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// Collects each hook's changeset fragment, commits the store write,
    /// publishes the stamped changeset to every other connection, applies
    /// it to this connection's own caches, and releases the write slot.
    /// Returns the snapshot assigned to the commit.
    pub fn commit(mut self) -> EngineResult<Snapshot> {
        self.ensure_active()?;
        self.state = TransactionState::Committing;

        let mut fragments: BTreeMap<String, crate::changeset::Fragment> = BTreeMap::new();
        for slot in mem::take(&mut self.hooks) {
            if let Some(fragment) = slot.hook.finish() {
                fragments.insert(slot.name, fragment);
            }
        }

        let handle = self
            .handle
            .take()
            .ok_or_else(|| EngineError::invalid_operation("transaction handle missing"))?;
        let token = match handle.commit() {
            Ok(token) => token,
            Err(e) => {
                // The store write is gone; put the connection back in a
                // clean state and surface the failure.
                self.abort_internal();
                return Err(e.into());
            }
        };

        let records = mem::take(&mut self.builder).into_records();
        let changeset = Arc::new(Changeset::new(token, records, fragments));
        self.db.publish(self.conn_id, &changeset);

        // Self-visibility: the committing connection applies its own
        // changes directly rather than through its pending queue.
        for collection in mem::take(&mut self.cleared) {
            self.cache.retain(|key, _| key.collection != collection);
        }
        for (key, value) in mem::take(&mut self.staged) {
            match value {
                Some(value) => self.cache.set(key, value),
                None => {
                    self.cache.remove(&key);
                }
            }
        }
        for (name, state) in self.ext_states.iter_mut() {
            if let Some(fragment) = changeset.fragment(name) {
                state.apply(fragment);
            }
        }
        *self.local_snapshot = token;

        self.state = TransactionState::Committed;
        *self.write_active = false;
        self.cache.unpin_all();
        self.db.write_slot.release();
        tracing::debug!(
            connection = %self.conn_id,
            snapshot = token,
            records = changeset.records().len(),
            "transaction committed"
        );
        Ok(Snapshot::new(token))
    }

    /// Rolls the transaction back, discarding every staged mutation.
    pub fn rollback(mut self) {
        self.abort_internal();
    }

    fn abort_internal(&mut self) {
        if !matches!(
            self.state,
            TransactionState::Active | TransactionState::Committing
        ) {
            return;
        }
        if let Some(handle) = self.handle.take() {
            handle.rollback();
        }
        self.builder = ChangesetBuilder::new();
        self.staged.clear();
        self.cleared.clear();
        self.hooks.clear();
        self.state = TransactionState::RolledBack;
        *self.write_active = false;
        self.cache.unpin_all();
        self.db.write_slot.release();
        tracing::debug!(connection = %self.conn_id, "transaction rolled back");
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.abort_internal();
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("connection", &self.conn_id)
            .field("base_snapshot", &self.base_snapshot)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
