// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RCU lock with striped per-CPU reader counters.
//
// Each reader stripe is one cacheline-aligned 64-bit word: the active
// reader count `c` in the low 32 bits, an exit version `ver` in the high
// 32. Readers touch only their own stripe; the writer's two-phase barrier
// is the single cross-stripe fence the runtime provides:
//
//   1. set `sync_barrier` (readers arriving now back off and yield);
//   2. snapshot every stripe, then wait per stripe until `c == 0` or
//      `ver` has advanced past the snapshot — either way no reader from
//      before phase 1 is still inside;
//   3. run the structural mutation;
//   4. clear `sync_barrier`.
//
// `ver` only advances when a stripe drains to zero, so an advanced `ver`
// proves every pre-snapshot reader on that stripe has exited.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::limits::NCPU;
use crate::spin_lock::SpinLock;

const C_MASK: u64 = 0xffff_ffff;
const C_ONE: u64 = 1;
const VER_ONE: u64 = 1 << 32;

#[repr(align(64))]
struct Stripe {
    word: AtomicU64,
}

const _: () = assert!(std::mem::align_of::<Stripe>() == crate::limits::CACHE_LINE_BYTES);

impl Stripe {
    /// Announce a reader: bump `c`. SeqCst so the store is ordered before
    /// the barrier load in `reader_lock` (intent marker).
    fn enter(&self) -> u64 {
        self.word.fetch_add(C_ONE, Ordering::SeqCst)
    }

    /// Retire a reader: drop `c`, and bump `ver` when the stripe drains.
    fn exit(&self) {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            let c = cur & C_MASK;
            assert!(c > 0, "rcu reader counter underflow");
            let mut next = cur - C_ONE;
            if c == 1 {
                next = next.wrapping_add(VER_ONE);
            }
            match self.word.compare_exchange_weak(
                cur,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

/// Round-robin stripe assignment, one stable index per thread.
fn my_stripe(n: usize) -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static STRIPE: std::cell::Cell<usize> = std::cell::Cell::new(usize::MAX);
    }
    STRIPE.with(|s| {
        if s.get() == usize::MAX {
            s.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        s.get() % n
    })
}

/// A read-copy-update lock: wait-free-ish readers, a quiescing writer.
pub struct RcuLock {
    stripes: Vec<Stripe>,
    sync_barrier: AtomicBool,
    writer: SpinLock<()>,
}

impl RcuLock {
    /// Create a lock with one stripe per available CPU (capped at
    /// [`NCPU`]).
    pub fn new() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(NCPU);
        Self {
            stripes: (0..n).map(|_| Stripe { word: AtomicU64::new(0) }).collect(),
            sync_barrier: AtomicBool::new(false),
            writer: SpinLock::new(()),
        }
    }

    /// Enter a read-side critical section.
    ///
    /// The counter increment lands before the barrier check, so a writer
    /// that misses the barrier race still sees the reader in its stripe
    /// snapshot. A reader that observes a live barrier undoes its entry
    /// and yields until the barrier clears.
    pub fn reader_lock(&self) -> RcuReadGuard<'_> {
        let idx = my_stripe(self.stripes.len());
        let stripe = &self.stripes[idx];
        loop {
            stripe.enter();
            if !self.sync_barrier.load(Ordering::SeqCst) {
                return RcuReadGuard { lock: self, idx };
            }
            stripe.exit();
            while self.sync_barrier.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        }
    }

    /// Run `mutate` after every pre-barrier reader has exited.
    ///
    /// Writers serialize on an internal lock; readers arriving during the
    /// barrier yield, so the wait is bounded under cooperative scheduling.
    pub fn writer_sync<R>(&self, mutate: impl FnOnce() -> R) -> R {
        let _w = self.writer.lock();
        self.sync_barrier.store(true, Ordering::SeqCst);

        let snaps: Vec<u64> = self
            .stripes
            .iter()
            .map(|s| s.word.load(Ordering::SeqCst))
            .collect();
        for (stripe, snap) in self.stripes.iter().zip(snaps) {
            let snap_ver = snap & !C_MASK;
            let mut k = 0u32;
            loop {
                let cur = stripe.word.load(Ordering::SeqCst);
                if cur & C_MASK == 0 || cur & !C_MASK != snap_ver {
                    break;
                }
                crate::spin_lock::adaptive_yield(&mut k);
            }
        }

        let out = mutate();
        self.sync_barrier.store(false, Ordering::SeqCst);
        out
    }

    /// Whether a writer barrier is currently raised. Test hook.
    pub fn barrier_raised(&self) -> bool {
        self.sync_barrier.load(Ordering::SeqCst)
    }
}

impl Default for RcuLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side guard. Exits the critical section on drop.
pub struct RcuReadGuard<'a> {
    lock: &'a RcuLock,
    idx: usize,
}

impl Drop for RcuReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.stripes[self.idx].exit();
    }
}
