//! Dirty-tracked, id-keyed registry shared by the catalog and the page buffer.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Extracts the registry key from a cached entity.
pub trait Keyed {
    type Key: Copy + Eq + Hash;

    fn key(&self) -> Self::Key;
}

#[derive(Debug, Clone)]
pub struct Registry<V: Keyed> {
    entries: HashMap<V::Key, V>,
    dirty: HashSet<V::Key>,
}

impl<V: Keyed> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Keyed> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// Insert or replace by key. The dirty flag is left as it was.
    pub fn put(&mut self, value: V) -> Option<V> {
        self.entries.insert(value.key(), value)
    }

    /// Insert or replace and mark dirty.
    pub fn put_dirty(&mut self, value: V) -> Option<V> {
        let key = value.key();
        self.dirty.insert(key);
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &V::Key) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &V::Key) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &V::Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &V::Key) -> Option<V> {
        self.dirty.remove(key);
        self.entries.remove(key)
    }

    /// Returns false when the key is not cached.
    pub fn mark_dirty(&mut self, key: &V::Key) -> bool {
        if self.entries.contains_key(key) {
            self.dirty.insert(*key);
            true
        } else {
            false
        }
    }

    pub fn is_dirty(&self, key: &V::Key) -> bool {
        self.dirty.contains(key)
    }

    pub fn clear_dirty(&mut self, key: &V::Key) {
        self.dirty.remove(key);
    }

    pub fn clear_all_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn dirty_keys(&self) -> Vec<V::Key> {
        self.dirty.iter().copied().collect()
    }

    pub fn dirty_values(&self) -> impl Iterator<Item = &V> + '_ {
        self.dirty.iter().filter_map(|key| self.entries.get(key))
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> + '_ {
        self.entries.values()
    }

    pub fn entries(&self) -> &HashMap<V::Key, V> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
