//! Ordered map module for the Erkao VM.
//!
//! This module provides the insertion-preserving string-keyed table backing
//! maps, instance fields, class method tables and environment bindings.
//!
//! Entries live in a flat vector in insertion order; a separate power-of-two
//! probe table maps key hashes to entry positions. Entry positions are the
//! *stable indices* the inline caches record: inserting a fresh key may
//! compact and rehash the table (invalidating every prior index), while
//! removing a key only tombstones its slot. A cache therefore revalidates a
//! hit by checking the key still stored at its recorded index.

use xxhash_rust::xxh3::xxh3_64;

use crate::heap::Handle;

const EMPTY: u32 = u32::MAX;
const TOMBSTONE: u32 = u32::MAX - 1;
const MIN_CAPACITY: usize = 8;

/// Hashes an interned-string handle.
///
/// Interning makes handle identity coincide with content identity, so the
/// handle bits themselves are the hash input; no heap access is needed from
/// inside a map operation.
fn hash_key(key: Handle) -> u64 {
    xxh3_64(&key.to_bits().to_le_bytes())
}

#[derive(Debug, Clone)]
struct MapEntry<V> {
    key: Handle,
    value: V,
}

/// An insertion-ordered map from interned-string handles to `V`, with
/// tombstoning removal and cache-checkable entry indices.
#[derive(Debug, Clone)]
pub struct OrderedMap<V> {
    /// Entries in insertion order; `None` marks a removed slot awaiting
    /// the next compaction
    entries: Vec<Option<MapEntry<V>>>,
    /// Open-addressing probe table of entry positions
    index: Vec<u32>,
    /// Count of live (non-tombstoned) entries
    live: usize,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedMap<V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: vec![EMPTY; MIN_CAPACITY],
            live: 0,
        }
    }

    /// Creates an empty map pre-sized for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (capacity.max(MIN_CAPACITY) * 2).next_power_of_two();
        Self {
            entries: Vec::with_capacity(capacity),
            index: vec![EMPTY; slots],
            live: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if the map holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Looks up the entry index for `key`.
    pub fn index_of(&self, key: Handle) -> Option<u32> {
        let mask = self.index.len() - 1;
        let mut slot = (hash_key(key) as usize) & mask;
        loop {
            match self.index[slot] {
                EMPTY => return None,
                TOMBSTONE => {}
                entry_idx => {
                    if let Some(entry) = &self.entries[entry_idx as usize] {
                        if entry.key == key {
                            return Some(entry_idx);
                        }
                    }
                }
            }
            slot = (slot + 1) & mask;
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: Handle) -> Option<&V> {
        self.index_of(key).and_then(|idx| self.value_at(idx))
    }

    /// Returns the value stored under `key`, mutably.
    pub fn get_mut(&mut self, key: Handle) -> Option<&mut V> {
        let idx = self.index_of(key)?;
        self.entries[idx as usize].as_mut().map(|e| &mut e.value)
    }

    /// Returns the key stored at `idx`, used by inline caches to revalidate
    /// a recorded entry position.
    pub fn key_at(&self, idx: u32) -> Option<Handle> {
        self.entries
            .get(idx as usize)
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.key)
    }

    /// Returns the value stored at `idx`.
    pub fn value_at(&self, idx: u32) -> Option<&V> {
        self.entries
            .get(idx as usize)
            .and_then(|slot| slot.as_ref())
            .map(|entry| &entry.value)
    }

    /// Overwrites the value at a known live index.
    pub fn set_at(&mut self, idx: u32, value: V) {
        if let Some(Some(entry)) = self.entries.get_mut(idx as usize) {
            entry.value = value;
        }
    }

    /// Inserts or overwrites `key`. Returns the entry index the value now
    /// lives at and whether the key was new; a `true` result means a
    /// compaction may have shifted previously observed indices.
    pub fn insert(&mut self, key: Handle, value: V) -> (u32, bool) {
        if let Some(idx) = self.index_of(key) {
            if let Some(entry) = self.entries[idx as usize].as_mut() {
                entry.value = value;
            }
            return (idx, false);
        }

        if (self.entries.len() + 1) * 4 > self.index.len() * 3 {
            self.rehash();
        }

        let entry_idx = self.entries.len() as u32;
        self.entries.push(Some(MapEntry { key, value }));
        self.live += 1;

        let mask = self.index.len() - 1;
        let mut slot = (hash_key(key) as usize) & mask;
        loop {
            match self.index[slot] {
                EMPTY | TOMBSTONE => {
                    self.index[slot] = entry_idx;
                    return (entry_idx, true);
                }
                _ => slot = (slot + 1) & mask,
            }
        }
    }

    /// Removes `key`, tombstoning its entry slot. Entry indices of the
    /// remaining keys are unchanged until the next rehash.
    pub fn remove(&mut self, key: Handle) -> Option<V> {
        let mask = self.index.len() - 1;
        let mut slot = (hash_key(key) as usize) & mask;
        loop {
            match self.index[slot] {
                EMPTY => return None,
                TOMBSTONE => {}
                entry_idx => {
                    let matches = self.entries[entry_idx as usize]
                        .as_ref()
                        .is_some_and(|e| e.key == key);
                    if matches {
                        self.index[slot] = TOMBSTONE;
                        self.live -= 1;
                        return self.entries[entry_idx as usize].take().map(|e| e.value);
                    }
                }
            }
            slot = (slot + 1) & mask;
        }
    }

    /// Drops tombstones and rebuilds the probe table. Every previously
    /// observed entry index is invalid afterwards.
    fn rehash(&mut self) {
        let mut compacted: Vec<Option<MapEntry<V>>> = Vec::with_capacity(self.live * 2);
        for slot in self.entries.drain(..) {
            if slot.is_some() {
                compacted.push(slot);
            }
        }
        self.entries = compacted;

        let slots = ((self.live.max(MIN_CAPACITY / 2) + 1) * 2).next_power_of_two();
        self.index = vec![EMPTY; slots];
        let mask = slots - 1;
        for (entry_idx, slot_entry) in self.entries.iter().enumerate() {
            let Some(entry) = slot_entry.as_ref() else {
                continue;
            };
            let mut slot = (hash_key(entry.key) as usize) & mask;
            while self.index[slot] != EMPTY {
                slot = (slot + 1) & mask;
            }
            self.index[slot] = entry_idx as u32;
        }
    }

    /// Iterates live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &V)> {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref().map(|e| (e.key, &e.value)))
    }

    /// Returns the key of the `n`-th live entry in insertion order.
    pub fn nth_key(&self, n: usize) -> Option<Handle> {
        self.iter().nth(n).map(|(k, _)| k)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.iter_mut().for_each(|s| *s = EMPTY);
        self.live = 0;
    }

    /// Approximate heap footprint of the table structure itself.
    pub fn shallow_bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Option<MapEntry<V>>>()
            + self.index.capacity() * std::mem::size_of::<u32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> Handle {
        Handle::from_bits(((n as u64) << 32) | 1)
    }

    #[test]
    fn test_insert_get_overwrite() {
        let mut map = OrderedMap::new();
        let (idx, fresh) = map.insert(key(1), 10);
        assert!(fresh);
        assert_eq!(map.get(key(1)), Some(&10));

        let (idx2, fresh2) = map.insert(key(1), 20);
        assert!(!fresh2);
        assert_eq!(idx, idx2);
        assert_eq!(map.get(key(1)), Some(&20));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_insertion_order_iteration() {
        let mut map = OrderedMap::new();
        for n in 0..5 {
            map.insert(key(n), n);
        }
        let keys: Vec<_> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (0..5).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_keeps_indices_stable() {
        let mut map = OrderedMap::new();
        map.insert(key(1), 1);
        let (idx2, _) = map.insert(key(2), 2);
        map.insert(key(3), 3);

        map.remove(key(1));
        // Index recorded before the removal still resolves
        assert_eq!(map.key_at(idx2), Some(key(2)));
        assert_eq!(map.value_at(idx2), Some(&2));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(key(1)), None);
    }

    #[test]
    fn test_rehash_invalidates_indices_but_preserves_order() {
        let mut map = OrderedMap::new();
        let (first_idx, _) = map.insert(key(0), 0);
        map.remove(key(0));
        for n in 1..100 {
            map.insert(key(n), n);
        }
        // The tombstone was dropped by some rehash along the way
        assert_ne!(map.key_at(first_idx), Some(key(0)));
        let values: Vec<_> = map.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, (1..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_nth_key_skips_tombstones() {
        let mut map = OrderedMap::new();
        map.insert(key(1), 1);
        map.insert(key(2), 2);
        map.insert(key(3), 3);
        map.remove(key(2));
        assert_eq!(map.nth_key(0), Some(key(1)));
        assert_eq!(map.nth_key(1), Some(key(3)));
        assert_eq!(map.nth_key(2), None);
    }
}
