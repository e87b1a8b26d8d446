// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Proclet mutex with a FIFO waiter queue addressable for migration.
//
// The public `Mutex` is a copyable handle `(heap id, region offset)`;
// the core lives in the heap's primitive sidecar and is resolved through
// the global heap registry on every operation, so a handle keeps working
// after its heap migrates to another in-process node.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::heap::{self, HeapId, HeapState};
use crate::spin_lock::SpinLock;
use crate::waiter::{self, WaitEntry, WaiterToken};

pub(crate) struct MutexCore {
    held: AtomicBool,
    waiters: SpinLock<VecDeque<WaiterToken>>,
}

impl MutexCore {
    pub(crate) fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Rehydrated core: unheld, with the transferred waiter queue. The
    /// serialized order is authoritative FIFO.
    pub(crate) fn with_waiters(waiters: Vec<WaiterToken>) -> Self {
        Self {
            held: AtomicBool::new(false),
            waiters: SpinLock::new(waiters.into()),
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn waiter_snapshot(&self) -> Vec<WaiterToken> {
        self.waiters.lock().iter().copied().collect()
    }
}

/// Handle to a mutex living on a proclet heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mutex {
    heap: HeapId,
    offset: u64,
}

impl Mutex {
    pub(crate) fn from_parts(heap: HeapId, offset: u64) -> Self {
        Self { heap, offset }
    }

    pub fn heap_id(&self) -> HeapId {
        self.heap
    }

    /// The mutex's stable identity inside its heap region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Acquire the mutex, parking FIFO on contention.
    ///
    /// # Panics
    /// Panics if the owning heap no longer exists anywhere in the
    /// process.
    pub fn lock(&self) {
        let mut entry: Option<WaitEntry> = None;
        let mut requeue_front = false;
        loop {
            let heap = heap::live_heap(self.heap);
            let hdr = heap.header();
            {
                // The read guard makes a concurrent migration barrier
                // flush this enqueue before the waiter snapshot runs.
                let _rcu = hdr.rcu.reader_lock();
                match hdr.state() {
                    HeapState::Resident | HeapState::Quiescing => {
                        let core = heap
                            .mutex_core(self.offset)
                            .expect("mutex offset not registered on heap");
                        if core.try_acquire() {
                            return;
                        }
                        let e = entry.get_or_insert_with(WaitEntry::new);
                        {
                            let mut q = core.waiters.lock();
                            if requeue_front {
                                q.push_front(e.token());
                            } else {
                                q.push_back(e.token());
                            }
                        }
                        // Retry after enqueueing: an unlock that ran
                        // between the failed CAS and the enqueue saw an
                        // empty queue and will never wake us.
                        if core.try_acquire() {
                            let mut q = core.waiters.lock();
                            if let Some(pos) = q.iter().position(|&t| t == e.token()) {
                                q.remove(pos);
                            }
                            return;
                        }
                    }
                    state => {
                        // Mid-transfer: wait it out, then resolve the new
                        // incarnation.
                        drop(_rcu);
                        hdr.wait_state_change(state);
                        continue;
                    }
                }
            }
            let e = entry.as_ref().expect("enqueued without entry");
            let suspended = heap::suspend_current_invocation(self.heap);
            drop(heap);
            e.park();
            if let Some(header) = suspended {
                header.invocation_begin();
            }
            e.rearm();
            // Lost the retry race to a barging locker: go back to the
            // queue head so FIFO order holds.
            requeue_front = true;
        }
    }

    /// Acquire without blocking. Returns `true` on success.
    pub fn try_lock(&self) -> bool {
        let heap = heap::live_heap(self.heap);
        heap.mutex_core(self.offset)
            .expect("mutex offset not registered on heap")
            .try_acquire()
    }

    /// Release the mutex and wake the queue head, if any.
    pub fn unlock(&self) {
        let heap = heap::live_heap(self.heap);
        let hdr = heap.header();
        let _rcu = hdr.rcu.reader_lock();
        let core = heap
            .mutex_core(self.offset)
            .expect("mutex offset not registered on heap");
        core.held.store(false, Ordering::Release);
        let mut q = core.waiters.lock();
        while let Some(token) = q.pop_front() {
            if waiter::wake(token) {
                break;
            }
        }
    }

    /// Snapshot the FIFO waiter queue. Migrator hook.
    pub fn get_waiters(&self) -> Vec<WaiterToken> {
        let heap = heap::live_heap(self.heap);
        heap.mutex_core(self.offset)
            .expect("mutex offset not registered on heap")
            .waiter_snapshot()
    }
}
