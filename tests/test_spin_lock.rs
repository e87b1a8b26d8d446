// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unit tests for the adaptive-backoff spin lock.

use std::sync::Arc;
use std::thread;

use proclet::SpinLock;

#[test]
fn lock_unlock() {
    let lock = SpinLock::new(0u32);
    {
        let mut g = lock.lock();
        *g = 7;
    }
    assert_eq!(*lock.lock(), 7);
}

#[test]
fn try_lock_contended() {
    let lock = SpinLock::new(());
    let g = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(g);
    assert!(lock.try_lock().is_some());
}

#[test]
fn critical_section() {
    let lock = Arc::new(SpinLock::new(0u64));
    let iterations = 10_000;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for _ in 0..iterations {
                    *lock.lock() += 1;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*lock.lock(), 4 * iterations);
}
