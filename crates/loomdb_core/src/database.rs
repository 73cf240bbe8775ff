//! Database handle, write slot, and commit publication.

use crate::changeset::Changeset;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{EngineError, EngineResult};
use crate::extension::{extension_table, Extension, ExtensionRegistry, HookContext};
use crate::types::{ConnectionId, Snapshot};
use loomdb_store::{KvStore, MemoryStore};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// The single permit required to run a read-write transaction.
///
/// Serializes all writers database-wide. Acquisition waits indefinitely;
/// timeout policy, if any, is layered externally.
pub(crate) struct WriteSlot {
    held: Mutex<bool>,
    available: Condvar,
}

impl WriteSlot {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the slot is free, then takes it.
    pub(crate) fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.available.wait(&mut held);
        }
        *held = true;
    }

    /// Releases the slot, waking one waiting writer.
    pub(crate) fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.available.notify_one();
    }
}

/// The pending-changeset queue of one connection.
///
/// Pushed to by other connections' commits (under the write slot), popped
/// by the owning connection during drain. The only cross-thread surface of
/// a connection.
pub(crate) struct PendingQueue {
    id: ConnectionId,
    queue: Mutex<VecDeque<Arc<Changeset>>>,
}

impl PendingQueue {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, changeset: Arc<Changeset>) {
        self.queue.lock().push_back(changeset);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Changeset>> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Shared internals of one database.
pub(crate) struct DatabaseInner {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) config: Config,
    /// Latest committed snapshot. Only increases while the database is
    /// open; advanced exclusively under the write slot.
    pub(crate) snapshot: AtomicU64,
    pub(crate) write_slot: WriteSlot,
    pub(crate) extensions: RwLock<ExtensionRegistry>,
    connections: Mutex<Vec<Weak<PendingQueue>>>,
    next_connection_id: AtomicU64,
    /// Set once the first connection exists; extension registration is
    /// rejected afterwards.
    sealed: AtomicBool,
    open: AtomicBool,
}

impl DatabaseInner {
    pub(crate) fn ensure_open(&self) -> EngineResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::DatabaseClosed)
        }
    }

    /// Registers a new connection's pending queue and hands back the shared
    /// handle. Must run before the connection reads its base snapshot so a
    /// racing commit can never fall between the two (an overlap is handled
    /// by the drain step skipping already-visible changesets).
    pub(crate) fn register_connection(&self) -> Arc<PendingQueue> {
        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::SeqCst));
        let queue = Arc::new(PendingQueue::new(id));
        self.connections.lock().push(Arc::downgrade(&queue));
        self.sealed.store(true, Ordering::SeqCst);
        queue
    }

    pub(crate) fn connection_id_of(queue: &PendingQueue) -> ConnectionId {
        queue.id
    }

    /// The coherence scheduler's publication step. Runs synchronously
    /// inside commit while the write slot is held: stamps the counter and
    /// enqueues the changeset onto every other live connection's queue.
    pub(crate) fn publish(&self, origin: ConnectionId, changeset: &Arc<Changeset>) {
        let token = changeset.snapshot().as_u64();
        debug_assert_eq!(token, self.snapshot.load(Ordering::SeqCst) + 1);
        self.snapshot.store(token, Ordering::SeqCst);

        let mut connections = self.connections.lock();
        connections.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                if queue.id != origin {
                    queue.push(Arc::clone(changeset));
                }
                true
            }
            None => false,
        });
        tracing::debug!(
            snapshot = token,
            records = changeset.records().len(),
            "commit published"
        );
    }

    /// Number of live connections (dead handles pruned lazily).
    pub(crate) fn live_connections(&self) -> usize {
        let mut connections = self.connections.lock();
        connections.retain(|weak| weak.strong_count() > 0);
        connections.len()
    }
}

/// The main database handle.
///
/// `Database` owns the backing store, the snapshot counter, the global
/// write slot, and the extension registry. Connections created from it
/// observe every commit through their pending-changeset queues.
///
/// # Opening a database
///
/// ```rust,ignore
/// use loomdb_core::Database;
/// use loomdb_store::MemoryStore;
/// use std::sync::Arc;
///
/// let db = Database::open(Arc::new(MemoryStore::new()))?;
/// let mut conn = db.connection()?;
/// conn.write_with(|txn| txn.put("users", "alice", b"v1".to_vec()))?;
/// ```
///
/// Extensions must be registered before the first connection is created;
/// registration order is hook invocation order.
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens a database over the given backing store.
    ///
    /// The snapshot counter is initialized from the store's committed
    /// snapshot and torn down at close; it is never implicit or static.
    pub fn open(store: Arc<dyn KvStore>) -> EngineResult<Self> {
        Self::open_with_config(store, Config::default())
    }

    /// Opens a database with custom configuration.
    pub fn open_with_config(store: Arc<dyn KvStore>, config: Config) -> EngineResult<Self> {
        let snapshot = store.committed_snapshot();
        tracing::debug!(snapshot, "database opened");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                store,
                config,
                snapshot: AtomicU64::new(snapshot),
                write_slot: WriteSlot::new(),
                extensions: RwLock::new(ExtensionRegistry::new()),
                connections: Mutex::new(Vec::new()),
                next_connection_id: AtomicU64::new(1),
                sealed: AtomicBool::new(false),
                open: AtomicBool::new(true),
            }),
        })
    }

    /// Opens a fresh in-memory database for testing.
    pub fn in_memory() -> EngineResult<Self> {
        Self::open(Arc::new(MemoryStore::new()))
    }

    /// Registers an extension.
    ///
    /// Must be called before the first connection is created. The
    /// extension's `install` runs inside its own write transaction, so its
    /// private table is populated atomically; the commit advances the
    /// snapshot like any other.
    pub fn register_extension(&self, extension: Arc<dyn Extension>) -> EngineResult<()> {
        self.inner.ensure_open()?;
        if self.inner.sealed.load(Ordering::SeqCst) {
            return Err(EngineError::invalid_operation(
                "extensions must be registered before the first connection is created",
            ));
        }
        if self.inner.extensions.read().get(extension.name()).is_some() {
            return Err(EngineError::invalid_operation(format!(
                "extension '{}' is already registered",
                extension.name()
            )));
        }

        self.inner.write_slot.acquire();
        let installed = self.install(&extension);
        self.inner.write_slot.release();
        installed?;

        tracing::debug!(extension = extension.name(), "extension registered");
        self.inner.extensions.write().register(extension)
    }

    fn install(&self, extension: &Arc<dyn Extension>) -> EngineResult<()> {
        let mut handle = self.inner.store.begin_write()?;
        let table = extension_table(extension.name());
        let result = {
            let mut ctx = HookContext::new(handle.as_mut(), &table);
            extension.install(&mut ctx)
        };
        match result {
            Ok(()) => {
                let token = handle.commit()?;
                debug_assert_eq!(token, self.inner.snapshot.load(Ordering::SeqCst) + 1);
                self.inner.snapshot.store(token, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                handle.rollback();
                Err(e)
            }
        }
    }

    /// Creates a new connection with its own caches and pending queue.
    pub fn connection(&self) -> EngineResult<Connection> {
        self.inner.ensure_open()?;
        Connection::new(Arc::clone(&self.inner))
    }

    /// Returns the latest committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.inner.snapshot.load(Ordering::SeqCst))
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.live_connections()
    }

    /// Closes the database. Subsequent transactions on any connection fail
    /// with `DatabaseClosed`.
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        tracing::debug!("database closed");
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}
