//! Symmetric many-to-many edge cache.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A many-to-many edge set queryable from either endpoint.
///
/// Edges are undirected: `add(a, b)` makes `b` a neighbor of `a` and `a` a
/// neighbor of `b`, and the two directions stay consistent on every
/// mutation. Used by the relationship extension for neighbor queries.
pub struct EdgeCache<T> {
    adjacency: HashMap<T, HashSet<T>>,
    edge_count: usize,
}

impl<T: Eq + Hash + Clone> EdgeCache<T> {
    /// Creates an empty edge cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adjacency: HashMap::new(),
            edge_count: 0,
        }
    }

    /// Returns the number of distinct edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Returns true if no edges are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edge_count == 0
    }

    /// Returns true if an edge between `a` and `b` exists.
    #[must_use]
    pub fn contains(&self, a: &T, b: &T) -> bool {
        self.adjacency
            .get(a)
            .is_some_and(|neighbors| neighbors.contains(b))
    }

    /// Returns the neighbors of `node`.
    #[must_use]
    pub fn neighbors_of(&self, node: &T) -> Vec<&T> {
        match self.adjacency.get(node) {
            Some(neighbors) => neighbors.iter().collect(),
            None => Vec::new(),
        }
    }

    /// Adds an edge between `a` and `b`. Returns false if it already
    /// existed.
    pub fn add(&mut self, a: T, b: T) -> bool {
        let inserted = self.adjacency.entry(a.clone()).or_default().insert(b.clone());
        if a != b {
            self.adjacency.entry(b).or_default().insert(a);
        }
        if inserted {
            self.edge_count += 1;
        }
        inserted
    }

    /// Removes the edge between `a` and `b`. Returns false if it did not
    /// exist.
    pub fn remove(&mut self, a: &T, b: &T) -> bool {
        let removed = match self.adjacency.get_mut(a) {
            Some(neighbors) => neighbors.remove(b),
            None => false,
        };
        if removed {
            if a != b {
                if let Some(neighbors) = self.adjacency.get_mut(b) {
                    neighbors.remove(a);
                    if neighbors.is_empty() {
                        self.adjacency.remove(b);
                    }
                }
            }
            if self.adjacency.get(a).is_some_and(HashSet::is_empty) {
                self.adjacency.remove(a);
            }
            self.edge_count -= 1;
        }
        removed
    }

    /// Removes `node` and every edge incident to it.
    pub fn remove_node(&mut self, node: &T) {
        let Some(neighbors) = self.adjacency.remove(node) else {
            return;
        };
        self.edge_count -= neighbors.len();
        for neighbor in neighbors {
            if neighbor == *node {
                continue;
            }
            if let Some(back) = self.adjacency.get_mut(&neighbor) {
                back.remove(node);
                if back.is_empty() {
                    self.adjacency.remove(&neighbor);
                }
            }
        }
    }

    /// Removes every edge.
    pub fn clear(&mut self) {
        self.adjacency.clear();
        self.edge_count = 0;
    }
}

impl<T: Eq + Hash + Clone> Default for EdgeCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
