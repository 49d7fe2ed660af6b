//! In-memory stand-in for a kernel hash map
//!
//! `SimMap` mirrors what the probes can rely on from `BPF_MAP_TYPE_HASH`:
//! a hard capacity, insert-only-if-absent that reports `Exists` before
//! `Full`, and a lookup-then-write update that is not atomic across
//! concurrent callers.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::map::{BoundedMap, InsertError};

/// Fixed-capacity concurrent map used to run the probe logic in tests.
pub struct SimMap<K, V> {
    entries: DashMap<K, V>,
    occupied: AtomicUsize,
    capacity: usize,
}

impl<K, V> SimMap<K, V>
where
    K: Eq + Hash + Copy,
    V: Copy,
{
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: DashMap::new(),
            occupied: AtomicUsize::new(0),
            capacity: capacity as usize,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|r| *r)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, value) = self.entries.remove(key)?;
        self.occupied.fetch_sub(1, Ordering::SeqCst);
        Some(value)
    }

    /// Copy of every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<K, V>
    where
        K: Ord,
    {
        self.entries.iter().map(|r| (*r.key(), *r.value())).collect()
    }

    /// Removes and returns every entry, the way a reader closes a window.
    pub fn drain(&self) -> Vec<(K, V)> {
        let keys: Vec<K> = self.entries.iter().map(|r| *r.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.remove(&key).map(|value| (key, value)))
            .collect()
    }
}

impl<K, V> BoundedMap<K, V> for SimMap<K, V>
where
    K: Eq + Hash + Copy,
    V: Copy,
{
    fn update_in_place<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        // Read and write are separate steps, like a pointer returned by
        // bpf_map_lookup_elem.
        let Some(mut value) = self.get(key) else {
            return false;
        };
        std::thread::yield_now();
        f(&mut value);
        if let Some(mut slot) = self.entries.get_mut(key) {
            *slot = value;
        }
        true
    }

    fn insert_if_absent(&self, key: &K, value: &V) -> Result<(), InsertError> {
        match self.entries.entry(*key) {
            Entry::Occupied(_) => Err(InsertError::Exists),
            Entry::Vacant(slot) => {
                if self.occupied.fetch_add(1, Ordering::SeqCst) >= self.capacity {
                    self.occupied.fetch_sub(1, Ordering::SeqCst);
                    return Err(InsertError::Full);
                }
                slot.insert(*value);
                Ok(())
            }
        }
    }
}
