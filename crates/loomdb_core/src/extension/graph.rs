//! Relationship graph extension: declared edges between objects with
//! delete-time rules.

use crate::changeset::Fragment;
use crate::error::{EngineError, EngineResult};
use crate::extension::{
    Extension, ExtensionReader, ExtensionState, HookContext, MutationHook,
};
use crate::cache::EdgeCache;
use crate::types::ObjectKey;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// What happens to an edge's source when its destination is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteRule {
    /// Removing the destination fails while the edge exists.
    Restrict,
    /// The edge is silently dropped from the source's edge list.
    Unlink,
}

/// One directed edge declared by a source object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge name, e.g. "owner" or "attachment".
    pub name: String,
    /// Destination collection.
    pub destination_collection: String,
    /// Destination key.
    pub destination_key: String,
    /// Rule applied when the destination is removed.
    pub rule: DeleteRule,
}

impl Edge {
    /// Creates an edge.
    pub fn new(
        name: impl Into<String>,
        destination_collection: impl Into<String>,
        destination_key: impl Into<String>,
        rule: DeleteRule,
    ) -> Self {
        Self {
            name: name.into(),
            destination_collection: destination_collection.into(),
            destination_key: destination_key.into(),
            rule,
        }
    }

    /// Returns the destination as an object key.
    #[must_use]
    pub fn destination(&self) -> ObjectKey {
        ObjectKey::new(
            self.destination_collection.as_str(),
            self.destination_key.as_str(),
        )
    }
}

/// Derives the edges declared by one object from its collection, key, and
/// value.
type EdgesFn = dyn Fn(&str, &str, &[u8]) -> Vec<Edge> + Send + Sync;

/// Maintains declared relationships between objects, spanning every
/// collection.
///
/// Each source object's edge list is derived by the supplied function and
/// stored CBOR-encoded in the extension's private table. Removing an
/// object enforces the edges pointing at it: a [`DeleteRule::Restrict`]
/// edge vetoes the removal, a [`DeleteRule::Unlink`] edge is dropped from
/// its source's list. Clearing a collection bypasses `Restrict` and
/// unlinks everything pointing into it.
pub struct RelationshipGraph {
    name: String,
    edges: Arc<EdgesFn>,
}

impl RelationshipGraph {
    /// Creates a relationship graph named `name`.
    pub fn new(
        name: impl Into<String>,
        edges: impl Fn(&str, &str, &[u8]) -> Vec<Edge> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            edges: Arc::new(edges),
        }
    }
}

/// Private-table keys are "collection<US>key"; the separator cannot occur
/// in either part of a well-formed name.
const SOURCE_SEPARATOR: char = '\u{1f}';

fn encode_source(collection: &str, key: &str) -> String {
    format!("{collection}{SOURCE_SEPARATOR}{key}")
}

fn decode_source(encoded: &str) -> EngineResult<ObjectKey> {
    encoded
        .split_once(SOURCE_SEPARATOR)
        .map(|(collection, key)| ObjectKey::new(collection, key))
        .ok_or_else(|| EngineError::codec(format!("malformed edge source '{encoded}'")))
}

fn encode_edges(edges: &[Edge]) -> EngineResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(edges, &mut buf)
        .map_err(|e| EngineError::codec(format!("edge list encode: {e}")))?;
    Ok(buf)
}

fn decode_edges(bytes: &[u8]) -> EngineResult<Vec<Edge>> {
    ciborium::de::from_reader(bytes).map_err(|e| EngineError::codec(format!("edge list decode: {e}")))
}

impl Extension for RelationshipGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection_state(
        &self,
        reader: &ExtensionReader<'_, '_>,
    ) -> EngineResult<Box<dyn ExtensionState>> {
        let mut state = RelationshipState {
            sources: HashMap::new(),
            links: EdgeCache::new(),
        };
        for (encoded, bytes) in reader.table_scan()? {
            let source = decode_source(&encoded)?;
            let edges = decode_edges(&bytes)?;
            state.set_source(source, edges);
        }
        Ok(Box::new(state))
    }

    fn hook(&self) -> Box<dyn MutationHook> {
        Box::new(RelationshipHook {
            name: self.name.clone(),
            edges: Arc::clone(&self.edges),
            ops: Vec::new(),
        })
    }
}

enum GraphOp {
    SetSource { source: ObjectKey, edges: Vec<Edge> },
    RemoveSource { source: ObjectKey },
}

struct GraphFragment {
    ops: Vec<GraphOp>,
}

struct RelationshipHook {
    name: String,
    edges: Arc<EdgesFn>,
    ops: Vec<GraphOp>,
}

impl RelationshipHook {
    fn refresh_source(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        value: &[u8],
    ) -> EngineResult<()> {
        let encoded_source = encode_source(collection, key);
        let old = ctx.table_get(&encoded_source)?;
        let edges = (self.edges)(collection, key, value);
        if edges.is_empty() {
            if old.is_some() {
                ctx.table_delete(&encoded_source)?;
                self.ops.push(GraphOp::RemoveSource {
                    source: ObjectKey::new(collection, key),
                });
            }
            return Ok(());
        }
        let bytes = encode_edges(&edges)?;
        if old.as_deref() == Some(bytes.as_slice()) {
            return Ok(());
        }
        ctx.table_put(&encoded_source, bytes)?;
        self.ops.push(GraphOp::SetSource {
            source: ObjectKey::new(collection, key),
            edges,
        });
        Ok(())
    }
}

impl MutationHook for RelationshipHook {
    fn did_insert(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        new: &[u8],
    ) -> EngineResult<()> {
        self.refresh_source(ctx, collection, key, new)
    }

    fn did_update(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        _old: &[u8],
        new: &[u8],
    ) -> EngineResult<()> {
        self.refresh_source(ctx, collection, key, new)
    }

    /// Enforces `Restrict` edges pointing at the object about to be
    /// removed.
    fn will_remove(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        _old: &[u8],
    ) -> EngineResult<()> {
        let removed = ObjectKey::new(collection, key);
        for (encoded, bytes) in ctx.table_scan()? {
            let source = decode_source(&encoded)?;
            if source == removed {
                // An object may always take its own outgoing edges with it.
                continue;
            }
            for edge in decode_edges(&bytes)? {
                if edge.rule == DeleteRule::Restrict && edge.destination() == removed {
                    return Err(EngineError::veto(
                        self.name.as_str(),
                        format!(
                            "edge '{}' from {source} restricts removal of {removed}",
                            edge.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Drops the removed object's own edge list and unlinks edges that
    /// pointed at it.
    fn did_remove(
        &mut self,
        ctx: &mut HookContext<'_, '_>,
        collection: &str,
        key: &str,
        _old: &[u8],
    ) -> EngineResult<()> {
        let removed = ObjectKey::new(collection, key);
        let encoded_removed = encode_source(collection, key);
        if ctx.table_get(&encoded_removed)?.is_some() {
            ctx.table_delete(&encoded_removed)?;
            self.ops.push(GraphOp::RemoveSource {
                source: removed.clone(),
            });
        }

        for (encoded, bytes) in ctx.table_scan()? {
            let source = decode_source(&encoded)?;
            let edges = decode_edges(&bytes)?;
            let kept: Vec<Edge> = edges
                .iter()
                .filter(|edge| edge.destination() != removed)
                .cloned()
                .collect();
            if kept.len() == edges.len() {
                continue;
            }
            if kept.is_empty() {
                ctx.table_delete(&encoded)?;
                self.ops.push(GraphOp::RemoveSource { source });
            } else {
                ctx.table_put(&encoded, encode_edges(&kept)?)?;
                self.ops.push(GraphOp::SetSource {
                    source,
                    edges: kept,
                });
            }
        }
        Ok(())
    }

    /// Clearing a collection bypasses `Restrict`: the sources inside it
    /// lose their edge lists and edges pointing into it are unlinked.
    fn did_clear(&mut self, ctx: &mut HookContext<'_, '_>, collection: &str) -> EngineResult<()> {
        for (encoded, bytes) in ctx.table_scan()? {
            let source = decode_source(&encoded)?;
            if source.collection == collection {
                ctx.table_delete(&encoded)?;
                self.ops.push(GraphOp::RemoveSource { source });
                continue;
            }
            let edges = decode_edges(&bytes)?;
            let kept: Vec<Edge> = edges
                .iter()
                .filter(|edge| edge.destination_collection != collection)
                .cloned()
                .collect();
            if kept.len() == edges.len() {
                continue;
            }
            if kept.is_empty() {
                ctx.table_delete(&encoded)?;
                self.ops.push(GraphOp::RemoveSource { source });
            } else {
                ctx.table_put(&encoded, encode_edges(&kept)?)?;
                self.ops.push(GraphOp::SetSource {
                    source,
                    edges: kept,
                });
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Option<Fragment> {
        if self.ops.is_empty() {
            None
        } else {
            Some(Arc::new(GraphFragment { ops: self.ops }))
        }
    }
}

/// Per-connection materialization of the relationship graph.
pub struct RelationshipState {
    sources: HashMap<ObjectKey, Vec<Edge>>,
    links: EdgeCache<ObjectKey>,
}

impl RelationshipState {
    fn set_source(&mut self, source: ObjectKey, edges: Vec<Edge>) {
        self.remove_source(&source);
        for edge in &edges {
            self.links.add(source.clone(), edge.destination());
        }
        self.sources.insert(source, edges);
    }

    fn remove_source(&mut self, source: &ObjectKey) {
        if let Some(old) = self.sources.remove(source) {
            for edge in &old {
                self.links.remove(source, &edge.destination());
            }
        }
    }

    /// Returns the edges declared by `collection`/`key`.
    #[must_use]
    pub fn edges_from(&self, collection: &str, key: &str) -> &[Edge] {
        self.sources
            .get(&ObjectKey::new(collection, key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns every object linked to `collection`/`key`, from either
    /// direction.
    #[must_use]
    pub fn neighbors(&self, collection: &str, key: &str) -> Vec<&ObjectKey> {
        self.links.neighbors_of(&ObjectKey::new(collection, key))
    }

    /// Returns true if the two objects are linked in either direction.
    #[must_use]
    pub fn is_linked(&self, a: &ObjectKey, b: &ObjectKey) -> bool {
        self.links.contains(a, b)
    }

    /// Returns the number of objects that declare at least one edge.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

impl ExtensionState for RelationshipState {
    fn apply(&mut self, fragment: &Fragment) {
        let Some(fragment) = fragment.downcast_ref::<GraphFragment>() else {
            return;
        };
        for op in &fragment.ops {
            match op {
                GraphOp::SetSource { source, edges } => {
                    self.set_source(source.clone(), edges.clone());
                }
                GraphOp::RemoveSource { source } => self.remove_source(source),
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
