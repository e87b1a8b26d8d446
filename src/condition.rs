// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Proclet condition variable.
//
// Like `Mutex`, the public type is a copyable handle resolved through
// the heap registry, so a waiter that sleeps across a migration wakes
// against the destination incarnation and reacquires its mutex there.
// Signals issued while the owning heap is mid-transfer are recorded in
// the header's pending list and replayed on the destination.

use std::collections::VecDeque;

use crate::heap::{self, HeapId, HeapState, PendingSignal, SignalMode};
use crate::mutex::Mutex;
use crate::spin_lock::SpinLock;
use crate::waiter::{self, WaitEntry, WaiterToken};

pub(crate) struct CondVarCore {
    waiters: SpinLock<VecDeque<WaiterToken>>,
}

impl CondVarCore {
    pub(crate) fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    pub(crate) fn with_waiters(waiters: Vec<WaiterToken>) -> Self {
        Self {
            waiters: SpinLock::new(waiters.into()),
        }
    }

    pub(crate) fn waiter_snapshot(&self) -> Vec<WaiterToken> {
        self.waiters.lock().iter().copied().collect()
    }

    /// Wake the FIFO head, skipping tokens whose waiters already left.
    pub(crate) fn wake_one(&self) {
        let mut q = self.waiters.lock();
        while let Some(token) = q.pop_front() {
            if waiter::wake(token) {
                break;
            }
        }
    }

    pub(crate) fn wake_all(&self) {
        let mut q = self.waiters.lock();
        for token in q.drain(..) {
            waiter::wake(token);
        }
    }
}

/// Handle to a condition variable living on a proclet heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CondVar {
    heap: HeapId,
    offset: u64,
}

impl CondVar {
    pub(crate) fn from_parts(heap: HeapId, offset: u64) -> Self {
        Self { heap, offset }
    }

    pub fn heap_id(&self) -> HeapId {
        self.heap
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Release `mutex`, park until signalled, then reacquire `mutex`.
    ///
    /// The caller's token is enqueued before the mutex is released, so a
    /// signal racing with the wait cannot be lost. While parked, the
    /// caller's invocation (if any) leaves the heap's in-flight count so
    /// the heap can quiesce; the reacquisition resolves the heap afresh
    /// and therefore lands on the destination after a migration.
    pub fn wait(&self, mutex: &Mutex) {
        let entry = WaitEntry::new();
        loop {
            let heap = heap::live_heap(self.heap);
            let hdr = heap.header();
            let _rcu = hdr.rcu.reader_lock();
            match hdr.state() {
                HeapState::Resident | HeapState::Quiescing => {
                    heap.condvar_core(self.offset)
                        .expect("condvar offset not registered on heap")
                        .waiters
                        .lock()
                        .push_back(entry.token());
                    break;
                }
                state => {
                    drop(_rcu);
                    hdr.wait_state_change(state);
                }
            }
        }
        mutex.unlock();
        let suspended = heap::suspend_current_invocation(self.heap);
        entry.park();
        if let Some(header) = suspended {
            header.invocation_begin();
        }
        mutex.lock();
    }

    /// Wake the longest-parked waiter.
    pub fn signal(&self) {
        self.deliver(SignalMode::Signal);
    }

    /// Wake every parked waiter.
    pub fn signal_all(&self) {
        self.deliver(SignalMode::Broadcast);
    }

    fn deliver(&self, mode: SignalMode) {
        loop {
            let heap = heap::live_heap(self.heap);
            let hdr = heap.header();
            let _rcu = hdr.rcu.reader_lock();
            match hdr.state() {
                HeapState::Migrating => {
                    // Queue for replay on the destination; the waiter
                    // tokens travel in the transfer record.
                    hdr.push_pending(PendingSignal { offset: self.offset, mode });
                    return;
                }
                HeapState::Evacuated => {
                    // Stale incarnation; resolve again.
                    drop(_rcu);
                    std::thread::yield_now();
                }
                _ => {
                    let core = heap
                        .condvar_core(self.offset)
                        .expect("condvar offset not registered on heap");
                    match mode {
                        SignalMode::Signal => core.wake_one(),
                        SignalMode::Broadcast => core.wake_all(),
                    }
                    return;
                }
            }
        }
    }

    /// Snapshot the FIFO waiter queue. Migrator hook.
    pub fn get_waiters(&self) -> Vec<WaiterToken> {
        let heap = heap::live_heap(self.heap);
        heap.condvar_core(self.offset)
            .expect("condvar offset not registered on heap")
            .waiter_snapshot()
    }
}
