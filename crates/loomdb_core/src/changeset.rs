//! Immutable changesets and the per-transaction builder.

use crate::types::Snapshot;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Opaque per-extension changeset fragment.
///
/// Produced by an extension's hook at commit and interpreted only by that
/// extension's per-connection state during lazy apply.
pub type Fragment = Arc<dyn Any + Send + Sync>;

/// Kind of mutation recorded in a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Key was inserted (no previous value existed).
    Inserted,
    /// Key was updated (a previous value existed).
    Updated,
    /// Key was removed.
    Removed,
    /// Every key in the collection was removed.
    CollectionCleared,
}

/// One mutation record.
///
/// For `CollectionCleared` the key is empty; the record covers the whole
/// collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Collection name.
    pub collection: String,
    /// Key within the collection (empty for `CollectionCleared`).
    pub key: String,
    /// Kind of mutation.
    pub kind: ChangeKind,
}

/// Accumulates mutation records during one write transaction.
///
/// Records are kept in mutation order with per-key consolidation, so a key
/// touched several times yields a single record describing the net effect
/// relative to the transaction's base snapshot.
#[derive(Debug, Default)]
pub struct ChangesetBuilder {
    records: Vec<Option<ChangeRecord>>,
    index: HashMap<(String, String), usize>,
}

impl ChangesetBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.iter().all(Option::is_none)
    }

    /// Records a mutation of one key, consolidating with any earlier
    /// record for the same key.
    pub fn record(&mut self, collection: &str, key: &str, kind: ChangeKind) {
        debug_assert!(kind != ChangeKind::CollectionCleared);
        let map_key = (collection.to_owned(), key.to_owned());
        if let Some(&at) = self.index.get(&map_key) {
            let existing = self.records[at]
                .as_ref()
                .map(|record| record.kind)
                .unwrap_or(kind);
            let merged = Self::merge(existing, kind);
            self.records[at] = Some(ChangeRecord {
                collection: collection.to_owned(),
                key: key.to_owned(),
                kind: merged,
            });
            return;
        }
        self.records.push(Some(ChangeRecord {
            collection: collection.to_owned(),
            key: key.to_owned(),
            kind,
        }));
        self.index.insert(map_key, self.records.len() - 1);
    }

    /// Records a collection clear, dropping every earlier record for that
    /// collection (they are subsumed by the clear).
    pub fn record_cleared(&mut self, collection: &str) {
        for slot in &mut self.records {
            if slot
                .as_ref()
                .is_some_and(|record| record.collection == collection)
            {
                *slot = None;
            }
        }
        self.index.retain(|(coll, _), _| coll != collection);
        self.records.push(Some(ChangeRecord {
            collection: collection.to_owned(),
            key: String::new(),
            kind: ChangeKind::CollectionCleared,
        }));
    }

    /// Consumes the builder, returning the consolidated records in
    /// mutation order.
    #[must_use]
    pub fn into_records(self) -> Vec<ChangeRecord> {
        self.records.into_iter().flatten().collect()
    }

    /// Net effect of a later mutation on top of an earlier record for the
    /// same key, relative to the transaction's base snapshot.
    fn merge(earlier: ChangeKind, later: ChangeKind) -> ChangeKind {
        use ChangeKind::{Inserted, Removed, Updated};
        match (earlier, later) {
            // The key did not exist at base; it exists now.
            (Inserted, Updated) | (Inserted, Inserted) => Inserted,
            // The key existed at base and is gone now. An insert-then-remove
            // also folds to Removed: other connections may hold a cached
            // miss, and a removal record is a safe invalidation either way.
            (_, Removed) => Removed,
            // Removed then re-inserted: existed at base, exists now with a
            // different value.
            (Removed, Inserted) => Updated,
            (Updated, _) => Updated,
            (kind, _) => kind,
        }
    }
}

/// An immutable record of one committed transaction's mutations.
///
/// Stamped with the snapshot assigned at commit, carrying the consolidated
/// primary records plus each extension's opaque fragment. Shared via `Arc`
/// across every live connection's pending queue and never mutated after
/// creation.
pub struct Changeset {
    snapshot: u64,
    records: Vec<ChangeRecord>,
    fragments: BTreeMap<String, Fragment>,
}

impl Changeset {
    /// Creates a changeset stamped with `snapshot`.
    pub(crate) fn new(
        snapshot: u64,
        records: Vec<ChangeRecord>,
        fragments: BTreeMap<String, Fragment>,
    ) -> Self {
        Self {
            snapshot,
            records,
            fragments,
        }
    }

    /// Returns the snapshot this changeset was committed at.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.snapshot)
    }

    /// Returns the consolidated mutation records.
    #[must_use]
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Returns the fragment contributed by the named extension, if any.
    #[must_use]
    pub fn fragment(&self, extension: &str) -> Option<&Fragment> {
        self.fragments.get(extension)
    }

    /// Returns true if the changeset carries no records and no fragments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.fragments.is_empty()
    }
}

impl std::fmt::Debug for Changeset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Changeset")
            .field("snapshot", &self.snapshot)
            .field("records", &self.records.len())
            .field("fragments", &self.fragments.len())
            .finish()
    }
}
