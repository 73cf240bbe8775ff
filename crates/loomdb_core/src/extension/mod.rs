//! Extension SPI: pluggable derived-data modules kept consistent with
//! primary mutations via per-transaction hooks.
//!
//! An [`Extension`] is registered on the database before any connection is
//! created. Registration order determines hook invocation order. Each
//! extension owns one private table in the backing store (written within
//! the same atomic commit as primary mutations) and one per-connection
//! derived cache (an [`ExtensionState`]), kept current by applying the
//! extension's changeset fragments during lazy drain.
//!
//! Hooks receive only a [`HookContext`]: the extension's private-table
//! surface of the in-progress store transaction plus read access to the
//! primary data. No handle capable of starting a transaction is reachable
//! from a hook, which rules out reentrancy at the interface level.

mod graph;
mod index;
mod registry;
mod view;

pub use graph::{DeleteRule, Edge, RelationshipGraph, RelationshipState};
pub use index::{IndexerFn, SecondaryIndex, SecondaryIndexState};
pub use registry::ExtensionRegistry;
pub use view::{OrderedView, OrderedViewState, SortKeyFn};

use crate::changeset::Fragment;
use crate::error::EngineResult;
use loomdb_store::{ReadHandle, WriteHandle};
use std::any::Any;

/// Returns the backing-store collection name of an extension's private
/// table.
#[must_use]
pub fn extension_table(name: &str) -> String {
    format!("ext:{name}")
}

/// Returns true if `collection` names an extension's private table.
#[must_use]
pub fn is_extension_table(collection: &str) -> bool {
    collection.starts_with("ext:")
}

/// A pluggable derived-data module.
///
/// Implementations are shared across connections (`Send + Sync`) and must
/// keep all mutable state either in the backing store (private table), in
/// per-connection [`ExtensionState`]s, or in per-transaction
/// [`MutationHook`]s.
pub trait Extension: Send + Sync {
    /// Unique extension name. Also namespaces the private table.
    fn name(&self) -> &str;

    /// One-time registration work, run inside its own write transaction
    /// when the extension is registered on the database. Typically
    /// backfills the private table from pre-existing primary data.
    fn install(&self, ctx: &mut HookContext<'_, '_>) -> EngineResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Builds the per-connection derived cache, reading the private table
    /// at the connection's snapshot.
    fn connection_state(
        &self,
        reader: &ExtensionReader<'_, '_>,
    ) -> EngineResult<Box<dyn ExtensionState>>;

    /// Creates a fresh hook for one write transaction.
    fn hook(&self) -> Box<dyn MutationHook>;
}

/// Per-connection derived state of one extension.
///
/// Mutated only by the owning connection: either by applying fragments
/// during drain, or immediately after that connection's own commit.
pub trait ExtensionState: Send {
    /// Applies one changeset fragment produced by this extension's hook.
    fn apply(&mut self, fragment: &Fragment);

    /// Downcasting support for typed access through a transaction.
    fn as_any(&self) -> &dyn Any;
}

/// Per-transaction mutation hook of one extension.
///
/// Created fresh for each read-write transaction, invoked synchronously
/// for every logical mutation in registration order, destroyed after
/// commit or rollback. `will_*` callbacks run before the primary mutation
/// is staged and may veto it by returning an error, which rolls back the
/// entire transaction. `did_*` callbacks run after.
#[allow(unused_variables)]
pub trait MutationHook {
    /// Called before `key` is inserted with `new`.
    fn will_insert(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        new: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    /// Called after `key` was inserted with `new`.
    fn did_insert(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        new: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    /// Called before `key` changes from `old` to `new`.
    fn will_update(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        old: &[u8],
        new: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    /// Called after `key` changed from `old` to `new`.
    fn did_update(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        old: &[u8],
        new: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    /// Called before `key` (holding `old`) is removed.
    fn will_remove(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        old: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    /// Called after `key` (which held `old`) was removed.
    fn did_remove(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        old: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    /// Called before `collection` is cleared.
    fn will_clear(&mut self, ctx: &mut HookContext<'_, '_>, collection: &str) -> EngineResult<()> {
        Ok(())
    }

    /// Called after `collection` was cleared.
    fn did_clear(&mut self, ctx: &mut HookContext<'_, '_>, collection: &str) -> EngineResult<()> {
        Ok(())
    }

    /// Consumes the hook at commit, returning this extension's changeset
    /// fragment (or `None` if it observed nothing relevant).
    fn finish(self: Box<Self>) -> Option<Fragment>;
}

/// The mutation surface a hook sees: the extension's private table within
/// the in-progress write transaction, plus read-only access to primary
/// data (staged writes included).
pub struct HookContext<'h, 'a> {
    handle: &'h mut (dyn WriteHandle + 'a),
    table: &'h str,
}

impl<'h, 'a> HookContext<'h, 'a> {
    pub(crate) fn new(handle: &'h mut (dyn WriteHandle + 'a), table: &'h str) -> Self {
        Self { handle, table }
    }

    /// Reads a primary value as the transaction currently sees it.
    pub fn read(&self, collection: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.handle.get(collection, key)?)
    }

    /// Scans a primary collection as the transaction currently sees it.
    pub fn scan(&self, collection: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        Ok(self.handle.scan(collection)?)
    }

    /// Reads from the extension's private table.
    pub fn table_get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.handle.get(self.table, key)?)
    }

    /// Scans the extension's private table.
    pub fn table_scan(&self) -> EngineResult<Vec<(String, Vec<u8>)>> {
        Ok(self.handle.scan(self.table)?)
    }

    /// Writes to the extension's private table. Atomic with the primary
    /// mutation: both persist or neither does.
    pub fn table_put(&mut self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        Ok(self.handle.put(self.table, key, value)?)
    }

    /// Deletes from the extension's private table.
    pub fn table_delete(&mut self, key: &str) -> EngineResult<()> {
        Ok(self.handle.delete(self.table, key)?)
    }

    /// Clears the extension's private table.
    pub fn table_clear(&mut self) -> EngineResult<()> {
        Ok(self.handle.clear(self.table)?)
    }
}

/// Read-only view used to rebuild per-connection state at registration:
/// the extension's private table plus primary data at the connection's
/// snapshot.
pub struct ExtensionReader<'h, 'a> {
    read: &'h (dyn ReadHandle + 'a),
    table: &'h str,
}

impl<'h, 'a> ExtensionReader<'h, 'a> {
    pub(crate) fn new(read: &'h (dyn ReadHandle + 'a), table: &'h str) -> Self {
        Self { read, table }
    }

    /// Reads a primary value at the connection's snapshot.
    pub fn read(&self, collection: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.read.get(collection, key)?)
    }

    /// Scans a primary collection at the connection's snapshot.
    pub fn scan(&self, collection: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        Ok(self.read.scan(collection)?)
    }

    /// Reads from the extension's private table.
    pub fn table_get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.read.get(self.table, key)?)
    }

    /// Scans the extension's private table.
    pub fn table_scan(&self) -> EngineResult<Vec<(String, Vec<u8>)>> {
        Ok(self.read.scan(self.table)?)
    }
}
