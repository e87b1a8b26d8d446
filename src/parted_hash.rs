// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Partitioned spin-protected hash containers.
//
// Keys are striped over a prime number of partitions; each partition has
// its own cacheline-aligned spin lock and its own table, so register /
// unregister traffic from unrelated keys never contends. `for_each`
// visits one partition at a time and is only eventually consistent
// across partitions.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::spin_lock::SpinLock;

/// Number of partitions. Prime, for mixing.
pub const NUM_PARTITIONS: usize = 29;

fn partitioner<K: Hash>(k: &K) -> usize {
    let mut h = DefaultHasher::new();
    k.hash(&mut h);
    (h.finish() % NUM_PARTITIONS as u64) as usize
}

#[repr(align(64))]
struct AlignedPart<T>(SpinLock<T>);

// ---------------------------------------------------------------------------
// PartitionedSpinHashSet
// ---------------------------------------------------------------------------

/// A concurrent hash set striped over [`NUM_PARTITIONS`] spin locks.
pub struct PartitionedSpinHashSet<K> {
    parts: [AlignedPart<HashSet<K>>; NUM_PARTITIONS],
}

impl<K: Hash + Eq> PartitionedSpinHashSet<K> {
    pub fn new() -> Self {
        Self {
            parts: std::array::from_fn(|_| AlignedPart(SpinLock::new(HashSet::new()))),
        }
    }

    /// Insert `k`. Returns `true` if it was not present.
    pub fn put(&self, k: K) -> bool {
        self.parts[partitioner(&k)].0.lock().insert(k)
    }

    /// Remove `k`. Returns `true` if it was present.
    pub fn remove(&self, k: &K) -> bool {
        self.parts[partitioner(k)].0.lock().remove(k)
    }

    pub fn contains(&self, k: &K) -> bool {
        self.parts[partitioner(k)].0.lock().contains(k)
    }

    /// Total number of keys. Sums per-partition counts without a global
    /// lock, so the value is approximate under concurrent mutation.
    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.0.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every key. `fn` returns `false` to stop early. Partitions are
    /// locked one at a time.
    pub fn for_each(&self, mut f: impl FnMut(&K) -> bool) {
        for p in &self.parts {
            let set = p.0.lock();
            for k in set.iter() {
                if !f(k) {
                    return;
                }
            }
        }
    }
}

impl<K: Hash + Eq + Clone> PartitionedSpinHashSet<K> {
    /// Snapshot all keys, one partition at a time.
    pub fn all_keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        for p in &self.parts {
            out.extend(p.0.lock().iter().cloned());
        }
        out
    }
}

impl<K: Hash + Eq> Default for PartitionedSpinHashSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// PartitionedSpinHashMap
// ---------------------------------------------------------------------------

/// The map companion of [`PartitionedSpinHashSet`], striped the same way.
/// Backs the heap table, the route table, and the RPC client pool.
pub struct PartitionedSpinHashMap<K, V> {
    parts: [AlignedPart<HashMap<K, V>>; NUM_PARTITIONS],
}

impl<K: Hash + Eq, V> PartitionedSpinHashMap<K, V> {
    pub fn new() -> Self {
        Self {
            parts: std::array::from_fn(|_| AlignedPart(SpinLock::new(HashMap::new()))),
        }
    }

    /// Insert or replace. Returns the previous value, if any.
    pub fn insert(&self, k: K, v: V) -> Option<V> {
        self.parts[partitioner(&k)].0.lock().insert(k, v)
    }

    pub fn remove(&self, k: &K) -> Option<V> {
        self.parts[partitioner(k)].0.lock().remove(k)
    }

    pub fn contains(&self, k: &K) -> bool {
        self.parts[partitioner(k)].0.lock().contains_key(k)
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.0.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq, V: Clone> PartitionedSpinHashMap<K, V> {
    pub fn get(&self, k: &K) -> Option<V> {
        self.parts[partitioner(k)].0.lock().get(k).cloned()
    }

    /// Return the value for `k`, inserting `make()` under the partition
    /// lock if absent. Concurrent callers for the same key all receive the
    /// one inserted value.
    pub fn get_or_insert_with(&self, k: &K, make: impl FnOnce() -> V) -> V
    where
        K: Clone,
    {
        let mut part = self.parts[partitioner(k)].0.lock();
        part.entry(k.clone()).or_insert_with(make).clone()
    }

    /// Visit every entry. `fn` returns `false` to stop early.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for p in &self.parts {
            let map = p.0.lock();
            for (k, v) in map.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    /// Snapshot all values, one partition at a time.
    pub fn all_values(&self) -> Vec<V> {
        let mut out = Vec::new();
        for p in &self.parts {
            out.extend(p.0.lock().values().cloned());
        }
        out
    }
}

impl<K: Hash + Eq, V> Default for PartitionedSpinHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
