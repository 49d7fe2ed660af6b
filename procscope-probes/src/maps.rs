//! Kernel hash maps behind the `BoundedMap` seam

use aya_ebpf::{bindings::BPF_NOEXIST, maps::HashMap};
use procscope_common::{BoundedMap, InsertError};

/// Borrowed `BPF_MAP_TYPE_HASH` map as seen by the probe logic.
pub struct KernelMap<'a, K, V>(pub &'a HashMap<K, V>);

impl<K, V> BoundedMap<K, V> for KernelMap<'_, K, V> {
    #[inline(always)]
    fn update_in_place<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        match self.0.get_ptr_mut(key) {
            Some(ptr) => {
                // SAFETY: the element stays valid until the program returns.
                // Other CPUs may write it concurrently; the lost update is
                // accepted.
                f(unsafe { &mut *ptr });
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn insert_if_absent(&self, key: &K, value: &V) -> Result<(), InsertError> {
        self.0
            .insert(key, value, BPF_NOEXIST as u64)
            .map_err(|ret| InsertError::from_errno(ret as i64))
    }
}
