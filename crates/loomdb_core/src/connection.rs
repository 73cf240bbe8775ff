//! Connections: long-lived sessions with private caches and lazy
//! changeset application.

use crate::cache::ObjectCache;
use crate::changeset::ChangeKind;
use crate::database::{DatabaseInner, PendingQueue};
use crate::error::{EngineError, EngineResult};
use crate::extension::{extension_table, ExtensionReader, ExtensionState};
use crate::transaction::{ReadTransaction, WriteTransaction};
use crate::types::{ConnectionId, ObjectKey, Snapshot};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A long-lived session with its own caches and transaction sequencing.
///
/// A connection owns one object cache, one state per registered extension,
/// and the last snapshot it has fully applied (`local_snapshot`). Commits
/// made elsewhere land on its pending queue and are applied lazily, at the
/// start of its next transaction: a dormant connection pays no propagation
/// cost until it is actually used, but never serves a stale read once it
/// is.
///
/// A connection is not safe for concurrent use by two transactions;
/// transactions borrow it mutably, which enforces single ownership at
/// compile time. A connection abandoned without ever beginning another
/// transaction accumulates an unbounded pending queue; dropping it frees
/// the queue.
pub struct Connection {
    pub(crate) db: Arc<DatabaseInner>,
    id: ConnectionId,
    /// Snapshot this connection last fully applied. Always
    /// `<= database.snapshot()`.
    pub(crate) local_snapshot: u64,
    pub(crate) cache: ObjectCache<ObjectKey, Vec<u8>>,
    /// Per-extension derived state, in registration order.
    pub(crate) ext_states: Vec<(String, Box<dyn ExtensionState>)>,
    pub(crate) pending: Arc<PendingQueue>,
    poisoned: bool,
    pub(crate) write_active: bool,
}

impl Connection {
    pub(crate) fn new(db: Arc<DatabaseInner>) -> EngineResult<Self> {
        // Queue registration precedes the snapshot read: a commit racing
        // with connection setup is either already visible at the base
        // snapshot (drain skips it) or lands on the queue.
        let pending = db.register_connection();
        let id = DatabaseInner::connection_id_of(&pending);
        let local_snapshot = db.snapshot.load(Ordering::SeqCst);

        let mut ext_states: Vec<(String, Box<dyn ExtensionState>)> = Vec::new();
        {
            let read = db.store.begin_read(local_snapshot)?;
            let extensions = db.extensions.read();
            for ext in extensions.iter() {
                let table = extension_table(ext.name());
                let reader = ExtensionReader::new(read.as_ref(), &table);
                ext_states.push((ext.name().to_owned(), ext.connection_state(&reader)?));
            }
        }

        let cache_capacity = db.config.cache_capacity;
        tracing::debug!(connection = %id, snapshot = local_snapshot, "connection created");
        Ok(Self {
            db,
            id,
            local_snapshot,
            cache: ObjectCache::new(cache_capacity),
            ext_states,
            pending,
            poisoned: false,
            write_active: false,
        })
    }

    /// Returns this connection's ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the snapshot this connection has fully applied.
    #[must_use]
    pub fn local_snapshot(&self) -> Snapshot {
        Snapshot::new(self.local_snapshot)
    }

    /// Returns the number of changesets waiting to be applied.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if a stale-cache failure has poisoned this connection.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Begins a read-only transaction at the current snapshot, draining
    /// the pending queue first.
    pub fn begin_read(&mut self) -> EngineResult<ReadTransaction<'_>> {
        self.db.ensure_open()?;
        self.drain_pending()?;
        ReadTransaction::begin(self)
    }

    /// Begins a read-write transaction, blocking until the global write
    /// slot is free.
    ///
    /// Returns `ConcurrencyViolation` if a read-write transaction is
    /// already active on this connection (possible only if one was leaked;
    /// normal use is prevented at compile time by the mutable borrow).
    pub fn begin_write(&mut self) -> EngineResult<WriteTransaction<'_>> {
        self.db.ensure_open()?;
        if self.write_active {
            return Err(EngineError::concurrency_violation(
                "a read-write transaction is already active on this connection",
            ));
        }
        self.drain_pending()?;
        self.db.write_slot.acquire();
        // A writer elsewhere may have committed while we waited; the queue
        // is final now because we hold the slot.
        if let Err(e) = self.drain_pending() {
            self.db.write_slot.release();
            return Err(e);
        }
        debug_assert_eq!(self.local_snapshot, self.db.snapshot.load(Ordering::SeqCst));
        self.write_active = true;
        // On failure, begin resets the flag and releases the slot itself.
        WriteTransaction::begin(self)
    }

    /// Runs a closure inside a read transaction.
    pub fn read_with<T>(
        &mut self,
        f: impl FnOnce(&mut ReadTransaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut txn = self.begin_read()?;
        f(&mut txn)
    }

    /// Runs a closure inside a write transaction, committing on `Ok` and
    /// rolling back on `Err`.
    pub fn write_with<T>(
        &mut self,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut txn = self.begin_write()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Applies every queued changeset in snapshot order: invalidates the
    /// object cache for each touched key, forwards extension fragments,
    /// and advances `local_snapshot`.
    fn drain_pending(&mut self) -> EngineResult<()> {
        if self.poisoned {
            return Err(EngineError::ConnectionPoisoned);
        }
        while let Some(changeset) = self.pending.pop() {
            let snapshot = changeset.snapshot().as_u64();
            if snapshot <= self.local_snapshot {
                // Enqueued while this connection was being set up; its
                // effects are already part of the base snapshot.
                continue;
            }
            if snapshot != self.local_snapshot + 1 {
                self.poisoned = true;
                return Err(EngineError::StaleCache {
                    expected: self.local_snapshot + 1,
                    actual: snapshot,
                });
            }

            for record in changeset.records() {
                match record.kind {
                    ChangeKind::CollectionCleared => {
                        let collection = record.collection.clone();
                        self.cache.retain(|key, _| key.collection != collection);
                    }
                    _ => {
                        self.cache
                            .remove(&ObjectKey::new(record.collection.as_str(), record.key.as_str()));
                    }
                }
            }
            for (name, state) in &mut self.ext_states {
                if let Some(fragment) = changeset.fragment(name) {
                    state.apply(fragment);
                }
            }
            self.local_snapshot = snapshot;
            tracing::trace!(
                connection = %self.id,
                snapshot,
                records = changeset.records().len(),
                "changeset applied"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_snapshot", &self.local_snapshot)
            .field("pending", &self.pending_len())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}
