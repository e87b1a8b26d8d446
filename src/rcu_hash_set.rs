// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Hash set for read-skewed workloads whose reads must not block a
// migration barrier. Readers run under the RCU read lock; writers
// serialize on an internal mutex and publish structural changes inside
// the writer barrier.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

use crate::rcu_lock::RcuLock;

pub struct RcuHashSet<K> {
    set: UnsafeCell<HashSet<K>>,
    writer: Mutex<()>,
    rcu: RcuLock,
}

// The UnsafeCell is only written inside `rcu.writer_sync`, after every
// concurrent reader has exited its critical section.
unsafe impl<K: Send> Send for RcuHashSet<K> {}
unsafe impl<K: Send + Sync> Sync for RcuHashSet<K> {}

impl<K: Hash + Eq> RcuHashSet<K> {
    pub fn new() -> Self {
        Self {
            set: UnsafeCell::new(HashSet::new()),
            writer: Mutex::new(()),
            rcu: RcuLock::new(),
        }
    }

    /// Insert `k`. Returns `true` if it was not present.
    pub fn put(&self, k: K) -> bool {
        let _w = self.writer.lock().expect("rcu hash set writer poisoned");
        self.rcu.writer_sync(|| unsafe { (*self.set.get()).insert(k) })
    }

    /// Remove `k`. Returns `true` if it was present.
    pub fn remove(&self, k: &K) -> bool {
        let _w = self.writer.lock().expect("rcu hash set writer poisoned");
        self.rcu.writer_sync(|| unsafe { (*self.set.get()).remove(k) })
    }

    pub fn contains(&self, k: &K) -> bool {
        let _g = self.rcu.reader_lock();
        unsafe { (*self.set.get()).contains(k) }
    }

    pub fn len(&self) -> usize {
        let _g = self.rcu.reader_lock();
        unsafe { (*self.set.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every key under the read lock. `fn` returns `false` to stop
    /// early. The closure must not call back into a writer.
    pub fn for_each(&self, mut f: impl FnMut(&K) -> bool) {
        let _g = self.rcu.reader_lock();
        for k in unsafe { (*self.set.get()).iter() } {
            if !f(k) {
                return;
            }
        }
    }
}

impl<K: Hash + Eq> Default for RcuHashSet<K> {
    fn default() -> Self {
        Self::new()
    }
}
