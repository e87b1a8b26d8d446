// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Waiter tokens: the unit of parked-thread identity that travels with a
// migrating heap.
//
// A thread that blocks on a proclet Mutex or CondVar registers a wait slot
// in a process-global table and enqueues its token on the primitive. The
// token is a plain u64, so the migrator can serialize an entire waiter
// queue and the destination node can wake the exact same threads after
// rehydration. Wakes are idempotent; a token outlives at most one park.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use slab::Slab;

use crate::spin_lock::SpinLock;

/// Identity of a parked waiter: `(generation << 32) | slot_key`.
///
/// The generation tag keeps a recycled slab slot from waking the wrong
/// thread when a stale token arrives off the wire.
pub type WaiterToken = u64;

struct WaitSlot {
    gen: u32,
    woken: Mutex<bool>,
    cv: Condvar,
}

fn table() -> &'static SpinLock<Slab<Arc<WaitSlot>>> {
    static TABLE: OnceLock<SpinLock<Slab<Arc<WaitSlot>>>> = OnceLock::new();
    TABLE.get_or_init(|| SpinLock::new(Slab::new()))
}

static NEXT_GEN: AtomicU32 = AtomicU32::new(1);

/// A registered wait slot owned by the thread that is about to park.
///
/// Dropping the entry removes it from the global table, invalidating the
/// token.
pub struct WaitEntry {
    token: WaiterToken,
    slot: Arc<WaitSlot>,
}

impl WaitEntry {
    /// Register a fresh wait slot and return the owning entry.
    pub fn new() -> Self {
        let gen = NEXT_GEN.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(WaitSlot {
            gen,
            woken: Mutex::new(false),
            cv: Condvar::new(),
        });
        let key = table().lock().insert(Arc::clone(&slot));
        let token = ((gen as u64) << 32) | key as u64;
        Self { token, slot }
    }

    /// The serializable identity of this waiter.
    pub fn token(&self) -> WaiterToken {
        self.token
    }

    /// Block the calling thread until [`wake`] is called with this token.
    pub fn park(&self) {
        let mut woken = self.slot.woken.lock().expect("wait slot poisoned");
        while !*woken {
            woken = self.slot.cv.wait(woken).expect("wait slot poisoned");
        }
    }

    /// Re-arm the slot so the entry can park again with the same token.
    pub fn rearm(&self) {
        *self.slot.woken.lock().expect("wait slot poisoned") = false;
    }
}

impl Default for WaitEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitEntry {
    fn drop(&mut self) {
        let key = (self.token & 0xffff_ffff) as usize;
        let mut tab = table().lock();
        if tab.get(key).is_some_and(|s| s.gen == self.slot.gen) {
            tab.remove(key);
        }
    }
}

/// Wake the thread parked under `token`. Returns `false` if the token is
/// stale (the waiter already left or never existed).
pub fn wake(token: WaiterToken) -> bool {
    let key = (token & 0xffff_ffff) as usize;
    let gen = (token >> 32) as u32;
    let slot = {
        let tab = table().lock();
        match tab.get(key) {
            Some(s) if s.gen == gen => Arc::clone(s),
            _ => return false,
        }
    };
    *slot.woken.lock().expect("wait slot poisoned") = true;
    slot.cv.notify_one();
    true
}
