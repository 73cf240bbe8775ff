//! Core type definitions for LoomDB.

use std::fmt;

/// A monotonically increasing snapshot number.
///
/// Each successful commit produces the next snapshot. A snapshot identifies
/// a consistent point-in-time view of the store: a reader pinned to
/// snapshot `s` observes exactly the mutations committed at snapshots
/// `<= s`, never a partial commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snapshot(pub u64);

impl Snapshot {
    /// Creates a snapshot number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw snapshot value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next snapshot number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snap:{}", self.0)
    }
}

/// Unique identifier for a connection within one database.
///
/// Connection IDs are monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Creates a connection ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Fully qualified address of an object: collection plus key.
///
/// Used as the cache key for a connection's object cache and when applying
/// changeset records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Collection name.
    pub collection: String,
    /// Key within the collection.
    pub key: String,
}

impl ObjectKey {
    /// Creates an object key.
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_ordering_and_next() {
        let s1 = Snapshot::new(1);
        let s2 = s1.next();
        assert!(s1 < s2);
        assert_eq!(s2.as_u64(), 2);
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(format!("{}", ConnectionId::new(7)), "conn:7");
    }

    #[test]
    fn object_key_equality() {
        let a = ObjectKey::new("users", "alice");
        let b = ObjectKey::new("users", "alice");
        let c = ObjectKey::new("posts", "alice");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{a}"), "users/alice");
    }
}
