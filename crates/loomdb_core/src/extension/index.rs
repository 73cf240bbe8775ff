//! Secondary index extension: maps a derived term back to the primary
//! keys that carry it.

use crate::cache::BidiCache;
use crate::changeset::Fragment;
use crate::error::EngineResult;
use crate::extension::{
    Extension, ExtensionReader, ExtensionState, HookContext, MutationHook,
};
use std::any::Any;
use std::sync::Arc;

/// Derives the index term of one object, or `None` to leave it unindexed.
///
/// Arguments are collection, key, and value.
pub type IndexerFn = dyn Fn(&str, &str, &[u8]) -> Option<Vec<u8>> + Send + Sync;

/// Maintains a term-to-keys index over one collection.
///
/// The term of each object is derived by the supplied function and stored
/// in the extension's private table within the same atomic commit as the
/// primary mutation. The per-connection [`SecondaryIndexState`] answers
/// reverse lookups from memory.
pub struct SecondaryIndex {
    name: String,
    collection: String,
    indexer: Arc<IndexerFn>,
}

impl SecondaryIndex {
    /// Creates a secondary index named `name` over `collection`.
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        indexer: impl Fn(&str, &str, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            indexer: Arc::new(indexer),
        }
    }
}

impl Extension for SecondaryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&self, ctx: &mut HookContext<'_, '_>) -> EngineResult<()> {
        for (key, value) in ctx.scan(&self.collection)? {
            if let Some(term) = (self.indexer)(&self.collection, &key, &value) {
                ctx.table_put(&key, term)?;
            }
        }
        Ok(())
    }

    fn connection_state(
        &self,
        reader: &ExtensionReader<'_, '_>,
    ) -> EngineResult<Box<dyn ExtensionState>> {
        let mut terms = BidiCache::new();
        for (key, term) in reader.table_scan()? {
            terms.set(key, term);
        }
        Ok(Box::new(SecondaryIndexState { terms }))
    }

    fn hook(&self) -> Box<dyn MutationHook> {
        Box::new(SecondaryIndexHook {
            collection: self.collection.clone(),
            indexer: Arc::clone(&self.indexer),
            ops: Vec::new(),
        })
    }
}

enum IndexOp {
    Set { key: String, term: Vec<u8> },
    Remove { key: String },
    Clear,
}

struct IndexFragment {
    ops: Vec<IndexOp>,
}

struct SecondaryIndexHook {
    collection: String,
    indexer: Arc<IndexerFn>,
    ops: Vec<IndexOp>,
}

impl SecondaryIndexHook {
    fn reindex(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        key: &str,
        new_value: &[u8],
    ) -> EngineResult<()> {
        let old_term = ctx.table_get(key)?;
        match (self.indexer)(&self.collection, key, new_value) {
            Some(term) => {
                if old_term.as_deref() == Some(term.as_slice()) {
                    return Ok(());
                }
                ctx.table_put(key, term.clone())?;
                self.ops.push(IndexOp::Set {
                    key: key.to_owned(),
                    term,
                });
            }
            None => {
                if old_term.is_some() {
                    ctx.table_delete(key)?;
                    self.ops.push(IndexOp::Remove {
                        key: key.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl MutationHook for SecondaryIndexHook {
    fn did_insert(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        new: &[u8],
    ) -> EngineResult<()> {
        if collection == self.collection {
            self.reindex(ctx, key, new)?;
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
            self.reindex(ctx, key, new)?;
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
        if ctx.table_get(key)?.is_some() {
            ctx.table_delete(key)?;
            self.ops.push(IndexOp::Remove {
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    fn did_clear(&mut self, ctx: &mut HookContext<'_, '_>, collection: &str) -> EngineResult<()> {
        if collection == self.collection {
            ctx.table_clear()?;
            self.ops.push(IndexOp::Clear);
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Option<Fragment> {
        if self.ops.is_empty() {
            None
        } else {
            Some(Arc::new(IndexFragment { ops: self.ops }))
        }
    }
}

/// Per-connection materialization of one secondary index.
pub struct SecondaryIndexState {
    terms: BidiCache<String, Vec<u8>>,
}

impl SecondaryIndexState {
    /// Returns every primary key whose term equals `term`.
    #[must_use]
    pub fn keys_matching(&self, term: &[u8]) -> Vec<&str> {
        self.terms
            .keys_for(&term.to_vec())
            .into_iter()
            .map(String::as_str)
            .collect()
    }

    /// Returns the indexed term of `key`, if any.
    #[must_use]
    pub fn term_of(&self, key: &str) -> Option<&[u8]> {
        self.terms.get(&key.to_owned()).map(Vec::as_slice)
    }

    /// Returns the number of indexed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl ExtensionState for SecondaryIndexState {
    fn apply(&mut self, fragment: &Fragment) {
        let Some(fragment) = fragment.downcast_ref::<IndexFragment>() else {
            return;
        };
        for op in &fragment.ops {
            match op {
                IndexOp::Set { key, term } => self.terms.set(key.clone(), term.clone()),
                IndexOp::Remove { key } => {
                    self.terms.remove(key);
                }
                IndexOp::Clear => self.terms.remove_all(),
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
