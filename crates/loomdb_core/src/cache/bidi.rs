//! Bidirectional cache with reverse lookup.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A key-value cache that also answers reverse lookups.
///
/// The forward map (`key -> value`) and reverse map (`value -> keys`) are
/// kept consistent on every mutation. Entries live in an arena and both
/// maps store arena indices, so neither direction owns the other.
///
/// Used by extensions whose derived state is a value-to-keys association,
/// e.g. a secondary index mapping an index key back to primary keys.
pub struct BidiCache<K, V> {
    slots: Vec<Option<(K, V)>>,
    free: Vec<usize>,
    forward: HashMap<K, usize>,
    reverse: HashMap<V, HashSet<usize>>,
}

impl<K, V> BidiCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Returns the number of key-value associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Returns the value associated with `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let index = *self.forward.get(key)?;
        self.slots[index].as_ref().map(|(_, value)| value)
    }

    /// Returns every key currently associated with `value`.
    #[must_use]
    pub fn keys_for(&self, value: &V) -> Vec<&K> {
        match self.reverse.get(value) {
            Some(indices) => indices
                .iter()
                .filter_map(|&index| self.slots[index].as_ref().map(|(key, _)| key))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Associates `key` with `value`, replacing any previous association.
    pub fn set(&mut self, key: K, value: V) {
        if let Some(&index) = self.forward.get(&key) {
            let old_value = self.slots[index].as_ref().map(|(_, v)| v.clone());
            if old_value.as_ref() == Some(&value) {
                return;
            }
            if let Some(old) = old_value {
                self.unlink_reverse(&old, index);
            }
            self.slots[index] = Some((key, value.clone()));
            self.reverse.entry(value).or_default().insert(index);
            return;
        }

        let slot = Some((key.clone(), value.clone()));
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.forward.insert(key, index);
        self.reverse.entry(value).or_default().insert(index);
    }

    /// Removes the association for `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.forward.remove(key)?;
        let (_, value) = self.slots[index].take()?;
        self.unlink_reverse(&value, index);
        self.free.push(index);
        Some(value)
    }

    /// Removes every association.
    pub fn remove_all(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.forward.clear();
        self.reverse.clear();
    }

    fn unlink_reverse(&mut self, value: &V, index: usize) {
        if let Some(indices) = self.reverse.get_mut(value) {
            indices.remove(&index);
            if indices.is_empty() {
                self.reverse.remove(value);
            }
        }
    }
}

impl<K, V> Default for BidiCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_reverse_lookup() {
        let mut cache: BidiCache<String, u32> = BidiCache::new();
        cache.set("a".into(), 1);
        cache.set("b".into(), 1);
        cache.set("c".into(), 2);

        assert_eq!(cache.get(&"a".into()), Some(&1));
        let mut keys = cache.keys_for(&1);
        keys.sort();
        assert_eq!(keys, vec![&"a".to_owned(), &"b".to_owned()]);
        assert_eq!(cache.keys_for(&2), vec![&"c".to_owned()]);
    }

    #[test]
    fn reassignment_moves_reverse_entry() {
        let mut cache: BidiCache<String, u32> = BidiCache::new();
        cache.set("a".into(), 1);
        cache.set("a".into(), 2);

        assert!(cache.keys_for(&1).is_empty());
        assert_eq!(cache.keys_for(&2), vec![&"a".to_owned()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reassignment_to_same_value_is_noop() {
        let mut cache: BidiCache<String, u32> = BidiCache::new();
        cache.set("a".into(), 1);
        cache.set("a".into(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.keys_for(&1), vec![&"a".to_owned()]);
    }

    #[test]
    fn remove_cleans_both_directions() {
        let mut cache: BidiCache<String, u32> = BidiCache::new();
        cache.set("a".into(), 1);
        cache.set("b".into(), 1);

        assert_eq!(cache.remove(&"a".into()), Some(1));
        assert_eq!(cache.get(&"a".into()), None);
        assert_eq!(cache.keys_for(&1), vec![&"b".to_owned()]);

        assert_eq!(cache.remove(&"b".into()), Some(1));
        assert!(cache.keys_for(&1).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn slots_are_reused() {
        let mut cache: BidiCache<u32, u32> = BidiCache::new();
        cache.set(1, 10);
        cache.remove(&1);
        cache.set(2, 20);
        assert_eq!(cache.get(&2), Some(&20));
        assert_eq!(cache.keys_for(&20), vec![&2]);
    }
}
