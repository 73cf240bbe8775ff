//! Ordered view extension: keeps the keys of one collection sorted by a
//! caller-supplied sort key.

use crate::changeset::Fragment;
use crate::error::EngineResult;
use crate::extension::{
    Extension, ExtensionReader, ExtensionState, HookContext, MutationHook,
};
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Derives the sort key of one object from its key and value.
pub type SortKeyFn = dyn Fn(&str, &[u8]) -> Vec<u8> + Send + Sync;

/// Maintains a persistent ordering over one collection.
///
/// Each object's sort key is derived by the supplied function and stored in
/// the extension's private table, within the same atomic commit as the
/// primary mutation. The per-connection [`OrderedViewState`] holds the
/// resulting order in memory for cheap iteration.
pub struct OrderedView {
    name: String,
    collection: String,
    sort_key: Arc<SortKeyFn>,
}

impl OrderedView {
    /// Creates an ordered view named `name` over `collection`.
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        sort_key: impl Fn(&str, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            sort_key: Arc::new(sort_key),
        }
    }
}

impl Extension for OrderedView {
    fn name(&self) -> &str {
        &self.name
    }

    /// Backfills sort keys for objects that existed before registration.
    fn install(&self, ctx: &mut HookContext<'_, '_>) -> EngineResult<()> {
        for (key, value) in ctx.scan(&self.collection)? {
            let sort_key = (self.sort_key)(&key, &value);
            ctx.table_put(&key, sort_key)?;
        }
        Ok(())
    }

    fn connection_state(
        &self,
        reader: &ExtensionReader<'_, '_>,
    ) -> EngineResult<Box<dyn ExtensionState>> {
        let mut entries = BTreeSet::new();
        for (key, sort_key) in reader.table_scan()? {
            entries.insert((sort_key, key));
        }
        Ok(Box::new(OrderedViewState { entries }))
    }

    fn hook(&self) -> Box<dyn MutationHook> {
        Box::new(OrderedViewHook {
            collection: self.collection.clone(),
            sort_key: Arc::clone(&self.sort_key),
            ops: Vec::new(),
        })
    }
}

/// One edit to the view's order.
enum ViewOp {
    /// Key gained the sort key `new` (replacing `old` if present).
    Set {
        key: String,
        old: Option<Vec<u8>>,
        new: Vec<u8>,
    },
    /// Key left the view; it was sorted under `old`.
    Remove { key: String, old: Vec<u8> },
    /// The whole view was emptied.
    Clear,
}

struct ViewFragment {
    ops: Vec<ViewOp>,
}

struct OrderedViewHook {
    collection: String,
    sort_key: Arc<SortKeyFn>,
    ops: Vec<ViewOp>,
}

impl OrderedViewHook {
    fn upsert(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        key: &str,
        new_value: &[u8],
    ) -> EngineResult<()> {
        let old = ctx.table_get(key)?;
        let new = (self.sort_key)(key, new_value);
        if old.as_deref() == Some(new.as_slice()) {
            return Ok(());
        }
        ctx.table_put(key, new.clone())?;
        self.ops.push(ViewOp::Set {
            key: key.to_owned(),
            old,
            new,
        });
        Ok(())
    }
}

impl MutationHook for OrderedViewHook {
    fn did_insert(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        new: &[u8],
    ) -> EngineResult<()> {
        if collection == self.collection {
            self.upsert(ctx, key, new)?;
        }
        Ok(())
    }

    fn did_update(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        _old: &[u8],
        new: &[u8],
    ) -> EngineResult<()> {
        if collection == self.collection {
            self.upsert(ctx, key, new)?;
        }
        Ok(())
    }

    fn did_remove(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        _old: &[u8],
    ) -> EngineResult<()> {
        if collection != self.collection {
            return Ok(());
        }
        if let Some(old) = ctx.table_get(key)? {
            ctx.table_delete(key)?;
            self.ops.push(ViewOp::Remove {
                key: key.to_owned(),
                old,
            });
        }
        Ok(())
    }

    fn did_clear(&mut self, ctx: &mut HookContext<'_, '_>, collection: &str) -> EngineResult<()> {
        if collection == self.collection {
            ctx.table_clear()?;
            self.ops.push(ViewOp::Clear);
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Option<Fragment> {
        if self.ops.is_empty() {
            None
        } else {
            Some(Arc::new(ViewFragment { ops: self.ops }))
        }
    }
}

/// Per-connection materialization of one ordered view.
pub struct OrderedViewState {
    /// Sorted by sort key, then key.
    entries: BTreeSet<(Vec<u8>, String)>,
}

impl OrderedViewState {
    /// Returns the number of keys in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the keys in sort order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(_, key)| key.as_str()).collect()
    }

    /// Returns the first key in sort order.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.entries.iter().next().map(|(_, key)| key.as_str())
    }
}

impl ExtensionState for OrderedViewState {
    fn apply(&mut self, fragment: &Fragment) {
        let Some(fragment) = fragment.downcast_ref::<ViewFragment>() else {
            return;
        };
        for op in &fragment.ops {
            match op {
                ViewOp::Set { key, old, new } => {
                    if let Some(old) = old {
                        self.entries.remove(&(old.clone(), key.clone()));
                    }
                    self.entries.insert((new.clone(), key.clone()));
                }
                ViewOp::Remove { key, old } => {
                    self.entries.remove(&(old.clone(), key.clone()));
                }
                ViewOp::Clear => self.entries.clear(),
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::sync::Arc;

    fn books_by_title() -> Arc<OrderedView> {
        // Values are "title" payloads; sort directly by value.
        Arc::new(OrderedView::new("by_title", "books", |_, value| {
            value.to_vec()
        }))
    }

    #[test]
    fn view_tracks_inserts_in_sort_order() {
        let db = Database::in_memory().unwrap();
        db.register_extension(books_by_title()).unwrap();
        let mut conn = db.connection().unwrap();

        conn.write_with(|txn| {
            txn.put("books", "1", b"Walden".to_vec())?;
            txn.put("books", "2", b"Emma".to_vec())?;
            txn.put("books", "3", b"Ulysses".to_vec())
        })
        .unwrap();

        conn.read_with(|txn| {
            let view: &OrderedViewState = txn.extension_state("by_title")?;
            assert_eq!(view.keys(), vec!["2", "3", "1"]);
            assert_eq!(view.first(), Some("2"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_moves_key_within_view() {
        let db = Database::in_memory().unwrap();
        db.register_extension(books_by_title()).unwrap();
        let mut conn = db.connection().unwrap();

        conn.write_with(|txn| {
            txn.put("books", "1", b"Aaa".to_vec())?;
            txn.put("books", "2", b"Bbb".to_vec())
        })
        .unwrap();
        conn.write_with(|txn| txn.put("books", "1", b"Zzz".to_vec()))
            .unwrap();

        conn.read_with(|txn| {
            let view: &OrderedViewState = txn.extension_state("by_title")?;
            assert_eq!(view.keys(), vec!["2", "1"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn remove_and_clear_shrink_view() {
        let db = Database::in_memory().unwrap();
        db.register_extension(books_by_title()).unwrap();
        let mut conn = db.connection().unwrap();

        conn.write_with(|txn| {
            txn.put("books", "1", b"A".to_vec())?;
            txn.put("books", "2", b"B".to_vec())
        })
        .unwrap();
        conn.write_with(|txn| txn.remove("books", "1")).unwrap();
        conn.read_with(|txn| {
            let view: &OrderedViewState = txn.extension_state("by_title")?;
            assert_eq!(view.keys(), vec!["2"]);
            Ok(())
        })
        .unwrap();

        conn.write_with(|txn| txn.remove_all("books")).unwrap();
        conn.read_with(|txn| {
            let view: &OrderedViewState = txn.extension_state("by_title")?;
            assert!(view.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn install_backfills_existing_objects() {
        use loomdb_store::{KvStore, MemoryStore};

        let store = Arc::new(MemoryStore::new());
        {
            let db = Database::open(Arc::clone(&store) as Arc<dyn KvStore>).unwrap();
            let mut conn = db.connection().unwrap();
            conn.write_with(|txn| {
                txn.put("books", "1", b"Walden".to_vec())?;
                txn.put("books", "2", b"Emma".to_vec())
            })
            .unwrap();
        }

        // Registration is rejected once a connection exists, so reopen over
        // the same store and register before connecting.
        let db = Database::open(store as Arc<dyn KvStore>).unwrap();
        db.register_extension(books_by_title()).unwrap();
        let mut conn = db.connection().unwrap();
        conn.read_with(|txn| {
            let view: &OrderedViewState = txn.extension_state("by_title")?;
            assert_eq!(view.keys(), vec!["2", "1"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn other_collections_are_ignored() {
        let db = Database::in_memory().unwrap();
        db.register_extension(books_by_title()).unwrap();
        let mut conn = db.connection().unwrap();

        conn.write_with(|txn| txn.put("authors", "1", b"Thoreau".to_vec()))
            .unwrap();
        conn.read_with(|txn| {
            let view: &OrderedViewState = txn.extension_state("by_title")?;
            assert!(view.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
