//! Bounded LRU object cache with pinning.

use std::collections::HashMap;
use std::hash::Hash;

/// One cache slot. Slots live in an arena and link into an intrusive LRU
/// list by index, so the list needs no separate allocation per entry.
struct Slot<K, V> {
    key: K,
    value: V,
    pinned: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A bounded key-value cache with least-recently-used eviction.
///
/// Entries can be pinned; a pinned entry is never evicted. Transactions pin
/// every entry they read so an in-flight read cannot have its working set
/// evicted underneath it, and unpin everything when they end.
///
/// A capacity of zero disables the bound entirely.
pub struct ObjectCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> ObjectCache<K, V> {
    /// Creates a cache bounded to `capacity` entries (0 = unbounded).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Returns the configured capacity (0 = unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns true if `key` is cached.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Looks up `key`, marking the entry most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.detach(index);
        self.push_front(index);
        self.slots[index].as_ref().map(|slot| &slot.value)
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// If the cache is over capacity afterwards, the least recently used
    /// unpinned entry is evicted. If every entry is pinned, the cache
    /// temporarily exceeds its bound rather than evicting a pinned entry.
    pub fn set(&mut self, key: K, value: V) {
        if let Some(&index) = self.map.get(&key) {
            if let Some(slot) = self.slots[index].as_mut() {
                slot.value = value;
            }
            self.detach(index);
            self.push_front(index);
            return;
        }

        let slot = Slot {
            key: key.clone(),
            value,
            pinned: false,
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, index);
        self.push_front(index);

        if self.capacity > 0 && self.map.len() > self.capacity {
            // The entry just inserted is exempt; if everything else is
            // pinned the cache overflows instead.
            self.evict_one(Some(index));
        }
    }

    /// Removes `key`, returning its value if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.detach(index);
        self.free.push(index);
        self.slots[index].take().map(|slot| slot.value)
    }

    /// Removes every entry.
    pub fn remove_all(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Removes every entry whose key fails the predicate.
    ///
    /// Invalidation removes entries regardless of pinning; pinning only
    /// guards against capacity eviction, and drain runs between
    /// transactions when nothing is pinned.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let doomed: Vec<K> = self
            .map
            .keys()
            .filter(|key| {
                let index = self.map[*key];
                self.slots[index]
                    .as_ref()
                    .is_some_and(|slot| !keep(&slot.key, &slot.value))
            })
            .cloned()
            .collect();
        for key in doomed {
            self.remove(&key);
        }
    }

    /// Pins `key` against eviction. Returns true if the entry exists.
    pub fn pin(&mut self, key: &K) -> bool {
        match self.map.get(key) {
            Some(&index) => {
                if let Some(slot) = self.slots[index].as_mut() {
                    slot.pinned = true;
                }
                true
            }
            None => false,
        }
    }

    /// Unpins every entry, then trims back down to capacity if pins made
    /// the cache overflow.
    pub fn unpin_all(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.pinned = false;
        }
        if self.capacity > 0 {
            while self.map.len() > self.capacity {
                if !self.evict_one(None) {
                    break;
                }
            }
        }
    }

    /// Evicts the least recently used unpinned entry, skipping `protect`.
    /// Returns false if no entry is evictable.
    fn evict_one(&mut self, protect: Option<usize>) -> bool {
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            let Some(slot) = self.slots[index].as_ref() else {
                break;
            };
            if slot.pinned || Some(index) == protect {
                cursor = slot.prev;
                continue;
            }
            let key = slot.key.clone();
            self.remove(&key);
            return true;
        }
        false
    }

    fn detach(&mut self, index: usize) {
        let (prev, next) = match self.slots[index].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(slot) = self.slots[p].as_mut() {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(slot) = self.slots[n].as_mut() {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(slot) = self.slots[index].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[index].as_mut() {
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(slot) = self.slots[h].as_mut() {
                slot.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }
}

impl<K: Eq + Hash + Clone, V> std::fmt::Debug for ObjectCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
