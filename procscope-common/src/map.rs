//! Bounded associative store seam
//!
//! Both probes only need two operations from their map: mutate an existing
//! entry in place, and insert a new entry only if the key is absent. The
//! kernel hash map provides both (`bpf_map_lookup_elem` and
//! `bpf_map_update_elem(.., BPF_NOEXIST)`); tests use [`crate::sim::SimMap`].

const EEXIST: i64 = 17;
const E2BIG: i64 = 7;

/// Reason an insert-only-if-absent write was rejected.
///
/// Probes discard these; they exist so tests can tell the cases apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// The key already has an entry.
    Exists,
    /// The map is at capacity and the key is new.
    Full,
    /// Any other errno returned by the map.
    Other(i64),
}

impl InsertError {
    /// Classifies a (negative) errno returned by a map update helper.
    pub fn from_errno(ret: i64) -> Self {
        match -ret {
            EEXIST => InsertError::Exists,
            E2BIG => InsertError::Full,
            _ => InsertError::Other(ret),
        }
    }
}

/// Fixed-capacity map shared by concurrent probe invocations.
///
/// Individual operations are memory-safe, but nothing makes a lookup
/// followed by a write atomic: `update_in_place` may lose an update when two
/// invocations modify the same key at once.
pub trait BoundedMap<K, V> {
    /// Applies `f` to the entry stored under `key`.
    ///
    /// Returns `false` without calling `f` when the key is absent.
    fn update_in_place<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool;

    /// Inserts `value` only if `key` has no entry yet.
    fn insert_if_absent(&self, key: &K, value: &V) -> Result<(), InsertError>;
}
