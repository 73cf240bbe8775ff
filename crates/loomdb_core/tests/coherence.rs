//! Integration tests for multi-connection snapshot and cache coherence.

use loomdb_core::extension::{
    DeleteRule, Edge, OrderedView, OrderedViewState, RelationshipGraph, RelationshipState,
    SecondaryIndex, SecondaryIndexState,
};
use loomdb_core::{Database, EngineError, Snapshot};
use loomdb_store::{KvStore, MemoryStore};
use std::sync::Arc;
use std::thread;

fn value(n: u64) -> Vec<u8> {
    n.to_le_bytes().to_vec()
}

fn parse(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[test]
fn snapshots_increase_by_one_per_commit() {
    let db = Database::in_memory().unwrap();
    let mut conn = db.connection().unwrap();

    for i in 1..=5u64 {
        let snapshot = conn
            .write_with(|txn| {
                txn.put("counters", "c", value(i))?;
                Ok(txn.snapshot())
            })
            .unwrap();
        assert_eq!(snapshot, Snapshot::new(i - 1));
        assert_eq!(db.snapshot(), Snapshot::new(i));
    }
}

#[test]
fn open_read_transaction_is_snapshot_isolated() {
    let db = Arc::new(Database::in_memory().unwrap());
    let mut reader = db.connection().unwrap();

    {
        let mut writer = db.connection().unwrap();
        writer
            .write_with(|txn| txn.put("c", "k", value(1)))
            .unwrap();
    }

    let mut txn = reader.begin_read().unwrap();
    assert_eq!(txn.get("c", "k").unwrap(), Some(value(1)));

    // Another connection commits while the read transaction stays open.
    let db2 = Arc::clone(&db);
    thread::spawn(move || {
        let mut writer = db2.connection().unwrap();
        writer
            .write_with(|txn| txn.put("c", "k", value(2)))
            .unwrap();
    })
    .join()
    .unwrap();

    // The open transaction keeps seeing its snapshot.
    assert_eq!(txn.get("c", "k").unwrap(), Some(value(1)));
    assert_eq!(db.snapshot(), Snapshot::new(2));
    drop(txn);

    // The next transaction drains the queue and sees the new value.
    assert_eq!(
        reader.read_with(|txn| txn.get("c", "k")).unwrap(),
        Some(value(2))
    );
}

#[test]
fn cached_values_are_invalidated_by_remote_commits() {
    let db = Database::in_memory().unwrap();
    let mut a = db.connection().unwrap();
    let mut b = db.connection().unwrap();

    a.write_with(|txn| txn.put("users", "alice", b"v1".to_vec()))
        .unwrap();

    // B reads and caches the value.
    assert_eq!(
        b.read_with(|txn| txn.get("users", "alice")).unwrap(),
        Some(b"v1".to_vec())
    );

    // A updates it; B's cached copy must not survive the drain.
    a.write_with(|txn| txn.put("users", "alice", b"v2".to_vec()))
        .unwrap();
    assert_eq!(b.pending_len(), 1);
    assert_eq!(
        b.read_with(|txn| txn.get("users", "alice")).unwrap(),
        Some(b"v2".to_vec())
    );

    // Removal invalidates too.
    a.write_with(|txn| txn.remove("users", "alice")).unwrap();
    assert_eq!(b.read_with(|txn| txn.get("users", "alice")).unwrap(), None);
}

#[test]
fn collection_clear_invalidates_only_that_collection() {
    let db = Database::in_memory().unwrap();
    let mut a = db.connection().unwrap();
    let mut b = db.connection().unwrap();

    a.write_with(|txn| {
        txn.put("users", "alice", b"u".to_vec())?;
        txn.put("posts", "p1", b"p".to_vec())
    })
    .unwrap();
    b.read_with(|txn| {
        txn.get("users", "alice")?;
        txn.get("posts", "p1")?;
        Ok(())
    })
    .unwrap();

    a.write_with(|txn| txn.remove_all("users")).unwrap();

    assert_eq!(b.read_with(|txn| txn.get("users", "alice")).unwrap(), None);
    assert_eq!(
        b.read_with(|txn| txn.get("posts", "p1")).unwrap(),
        Some(b"p".to_vec())
    );
}

#[test]
fn concurrent_writers_serialize_without_losing_updates() {
    let db = Arc::new(Database::in_memory().unwrap());
    {
        let mut conn = db.connection().unwrap();
        conn.write_with(|txn| txn.put("counters", "c", value(0)))
            .unwrap();
    }

    const THREADS: u64 = 4;
    const INCREMENTS: u64 = 25;

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let mut conn = db.connection().unwrap();
            for _ in 0..INCREMENTS {
                conn.write_with(|txn| {
                    let current = txn.get("counters", "c")?.map(|v| parse(&v)).unwrap_or(0);
                    txn.put("counters", "c", value(current + 1))
                })
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut conn = db.connection().unwrap();
    let total = conn
        .read_with(|txn| txn.get("counters", "c"))
        .unwrap()
        .map(|v| parse(&v))
        .unwrap();
    assert_eq!(total, THREADS * INCREMENTS);
    // One snapshot per commit: the seed write plus every increment.
    assert_eq!(db.snapshot(), Snapshot::new(1 + THREADS * INCREMENTS));
}

#[test]
fn committing_connection_sees_its_own_writes_immediately() {
    let db = Database::in_memory().unwrap();
    let mut conn = db.connection().unwrap();

    conn.write_with(|txn| txn.put("c", "k", b"v".to_vec()))
        .unwrap();

    // Self-visibility is applied directly, not through the pending queue.
    assert_eq!(conn.pending_len(), 0);
    assert_eq!(conn.local_snapshot(), db.snapshot());
    assert_eq!(
        conn.read_with(|txn| txn.get("c", "k")).unwrap(),
        Some(b"v".to_vec())
    );
}

#[test]
fn failed_store_commit_leaves_every_connection_unchanged() {
    let store = Arc::new(MemoryStore::new());
    let db = Database::open(Arc::clone(&store) as Arc<dyn KvStore>).unwrap();
    let mut a = db.connection().unwrap();
    let mut b = db.connection().unwrap();

    store.inject_commit_failure();
    let mut txn = a.begin_write().unwrap();
    txn.put("c", "k", b"v".to_vec()).unwrap();
    assert!(matches!(txn.commit(), Err(EngineError::Store(_))));

    assert_eq!(db.snapshot(), Snapshot::new(0));
    assert_eq!(a.read_with(|txn| txn.get("c", "k")).unwrap(), None);
    assert_eq!(b.read_with(|txn| txn.get("c", "k")).unwrap(), None);
    assert_eq!(b.pending_len(), 0);
}

#[test]
fn extension_states_stay_in_lockstep_across_connections() {
    let db = Database::in_memory().unwrap();
    db.register_extension(Arc::new(OrderedView::new(
        "by_value",
        "books",
        |_, value| value.to_vec(),
    )))
    .unwrap();
    let mut a = db.connection().unwrap();
    let mut b = db.connection().unwrap();

    a.write_with(|txn| {
        txn.put("books", "1", b"Walden".to_vec())?;
        txn.put("books", "2", b"Emma".to_vec())
    })
    .unwrap();

    // B applies the fragment during drain without touching the store.
    b.read_with(|txn| {
        let view: &OrderedViewState = txn.extension_state("by_value")?;
        assert_eq!(view.keys(), vec!["2", "1"]);
        Ok(())
    })
    .unwrap();

    // And stays current across an update committed by A.
    a.write_with(|txn| txn.put("books", "2", b"Zuleika".to_vec()))
        .unwrap();
    b.read_with(|txn| {
        let view: &OrderedViewState = txn.extension_state("by_value")?;
        assert_eq!(view.keys(), vec!["1", "2"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn extension_table_reads_stay_fresh_across_drains() {
    let db = Database::in_memory().unwrap();
    db.register_extension(Arc::new(OrderedView::new(
        "by_value",
        "books",
        |_, value| value.to_vec(),
    )))
    .unwrap();
    let mut a = db.connection().unwrap();
    let mut b = db.connection().unwrap();

    a.write_with(|txn| txn.put("books", "1", b"Aaa".to_vec()))
        .unwrap();
    assert_eq!(
        b.read_with(|txn| txn.get("ext:by_value", "1")).unwrap(),
        Some(b"Aaa".to_vec())
    );

    // The rewrite touches only the private table through the hook, so no
    // change record invalidates it; B must read it through the store, not
    // a cached copy.
    a.write_with(|txn| txn.put("books", "1", b"Zzz".to_vec()))
        .unwrap();
    assert_eq!(
        b.read_with(|txn| txn.get("ext:by_value", "1")).unwrap(),
        Some(b"Zzz".to_vec())
    );
}

#[test]
fn multiple_extensions_fire_in_registration_order_and_stay_atomic() {
    let db = Database::in_memory().unwrap();
    db.register_extension(Arc::new(OrderedView::new(
        "by_value",
        "books",
        |_, value| value.to_vec(),
    )))
    .unwrap();
    db.register_extension(Arc::new(SecondaryIndex::new(
        "by_len",
        "books",
        |_, _, value| Some(vec![u8::try_from(value.len()).unwrap_or(u8::MAX)]),
    )))
    .unwrap();
    let mut conn = db.connection().unwrap();

    conn.write_with(|txn| {
        txn.put("books", "1", b"abc".to_vec())?;
        txn.put("books", "2", b"xy".to_vec())
    })
    .unwrap();

    conn.read_with(|txn| {
        let view: &OrderedViewState = txn.extension_state("by_value")?;
        assert_eq!(view.keys(), vec!["1", "2"]);
        let index: &SecondaryIndexState = txn.extension_state("by_len")?;
        assert_eq!(index.keys_matching(&[3]), vec!["1"]);
        assert_eq!(index.keys_matching(&[2]), vec!["2"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn graph_veto_keeps_other_connections_untouched() {
    let db = Database::in_memory().unwrap();
    db.register_extension(Arc::new(RelationshipGraph::new(
        "graph",
        |collection, _, value| {
            if collection != "files" {
                return Vec::new();
            }
            match std::str::from_utf8(value)
                .ok()
                .and_then(|text| text.strip_prefix("owner:"))
            {
                Some(owner) => vec![Edge::new("owner", "users", owner, DeleteRule::Restrict)],
                None => Vec::new(),
            }
        },
    )))
    .unwrap();
    let mut a = db.connection().unwrap();
    let mut b = db.connection().unwrap();

    a.write_with(|txn| {
        txn.put("users", "alice", b"Alice".to_vec())?;
        txn.put("files", "f1", b"owner:alice".to_vec())
    })
    .unwrap();
    let before = db.snapshot();

    // A bundles an allowed write with a vetoed removal; nothing survives.
    let mut txn = a.begin_write().unwrap();
    txn.put("users", "zed", b"Zed".to_vec()).unwrap();
    assert!(matches!(
        txn.remove("users", "alice"),
        Err(EngineError::ExtensionVeto { .. })
    ));
    drop(txn);

    assert_eq!(db.snapshot(), before);
    assert_eq!(b.read_with(|txn| txn.get("users", "zed")).unwrap(), None);
    assert_eq!(b.pending_len(), 0);
    b.read_with(|txn| {
        let graph: &RelationshipState = txn.extension_state("graph")?;
        assert_eq!(graph.source_count(), 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn late_connection_starts_from_current_snapshot() {
    let db = Database::in_memory().unwrap();
    db.register_extension(Arc::new(SecondaryIndex::new(
        "by_first_byte",
        "books",
        |_, _, value| value.first().map(|b| vec![*b]),
    )))
    .unwrap();
    let mut a = db.connection().unwrap();
    a.write_with(|txn| txn.put("books", "1", b"abc".to_vec()))
        .unwrap();

    // A connection created now rebuilds extension state from the private
    // table instead of replaying changesets.
    let mut late = db.connection().unwrap();
    assert_eq!(late.local_snapshot(), db.snapshot());
    assert_eq!(late.pending_len(), 0);
    late.read_with(|txn| {
        let index: &SecondaryIndexState = txn.extension_state("by_first_byte")?;
        assert_eq!(index.keys_matching(b"a"), vec!["1"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn consolidated_changeset_reaches_other_connection_once() {
    let db = Database::in_memory().unwrap();
    let mut a = db.connection().unwrap();
    let mut b = db.connection().unwrap();

    b.read_with(|txn| txn.get("c", "k").map(|_| ())).unwrap();

    // Several touches of one key within a transaction consolidate into a
    // single changeset at a single snapshot.
    a.write_with(|txn| {
        txn.put("c", "k", b"v1".to_vec())?;
        txn.put("c", "k", b"v2".to_vec())?;
        txn.remove("c", "k")?;
        txn.put("c", "k", b"v3".to_vec())
    })
    .unwrap();

    assert_eq!(b.pending_len(), 1);
    assert_eq!(
        b.read_with(|txn| txn.get("c", "k")).unwrap(),
        Some(b"v3".to_vec())
    );
    assert_eq!(b.local_snapshot(), db.snapshot());
}
