// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RPC client pool tests: lazy construction, identity under races, and
// no eviction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use proclet::{NodeAddr, RpcClient, RpcClientMgr};

struct CountingClient {
    key: u32,
}

#[test]
fn lazy_construction() {
    let built = Arc::new(AtomicUsize::new(0));
    let b = Arc::clone(&built);
    let mgr = RpcClientMgr::new(move |k: &u32| {
        b.fetch_add(1, Ordering::SeqCst);
        CountingClient { key: *k }
    });

    assert_eq!(built.load(Ordering::SeqCst), 0);
    let c = mgr.get(&5);
    assert_eq!(c.key, 5);
    assert_eq!(built.load(Ordering::SeqCst), 1);

    // Same key: same client, no new construction.
    let c2 = mgr.get(&5);
    assert!(Arc::ptr_eq(&c, &c2));
    assert_eq!(built.load(Ordering::SeqCst), 1);

    // Different key: new client.
    let c3 = mgr.get(&6);
    assert_eq!(c3.key, 6);
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert_eq!(mgr.len(), 2);
}

// Many threads race get() on one key; exactly one client is constructed
// and every caller receives that same instance (identity, not just
// equivalence).
#[test]
fn idempotent_client_pool() {
    let built = Arc::new(AtomicUsize::new(0));
    let b = Arc::clone(&built);
    let mgr = Arc::new(RpcClientMgr::new(move |k: &u32| {
        b.fetch_add(1, Ordering::SeqCst);
        CountingClient { key: *k }
    }));

    let num_threads = 100;
    let barrier = Arc::new(Barrier::new(num_threads));
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut clients = Vec::with_capacity(10);
                for _ in 0..10 {
                    clients.push(mgr.get(&77));
                }
                clients
            })
        })
        .collect();

    let mut all: Vec<Arc<CountingClient>> = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }

    assert_eq!(built.load(Ordering::SeqCst), 1, "exactly one construction");
    for c in &all {
        assert!(Arc::ptr_eq(c, &all[0]), "same client pointer for equal keys");
    }
    assert_eq!(mgr.len(), 1);
}

// The real client pool keys by node address; construction does not dial.
#[test]
fn real_client_pool_is_lazy_about_connecting() {
    let mgr = RpcClientMgr::new(|addr: &NodeAddr| RpcClient::new(*addr));
    // Nothing listens on this address; get() must still succeed.
    let addr: NodeAddr = "127.0.0.1:1".parse().unwrap();
    let c = mgr.get(&addr);
    assert_eq!(c.addr(), addr);
    assert!(Arc::ptr_eq(&c, &mgr.get(&addr)));
}
