// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end migration tests with two (or three) in-process nodes:
// pressure-driven eviction, waiter survival, FIFO preservation, abort
// and retry, and idempotent reload.

use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use proclet::config::{MonitorConfig, NodeConfig, PeerConfig, RuntimeConfig};
use proclet::heap::HeapState;
use proclet::proto::frame::{read_frame, write_frame, Encoder, KIND_ACK};
use proclet::proto::rpc::{RPC_STATUS, RPC_STATUS_REPLY};
use proclet::{NodeAddr, Pressure, ProcletHeap, Resource, Runtime};

// Blob proclet methods: PUT appends bytes and replies with the offset;
// GET reads `(u64 offset, u32 len)` back out.
const M_PUT: u32 = 1;
const M_GET: u32 = 2;

fn blob_dispatcher(heap: &ProcletHeap, method: u32, payload: &[u8]) -> Vec<u8> {
    match method {
        M_PUT => {
            let off = heap.alloc(payload.len());
            heap.write_at(off, payload);
            off.to_le_bytes().to_vec()
        }
        M_GET => {
            let off = u64::from_le_bytes(payload[0..8].try_into().unwrap());
            let len = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;
            heap.read_at(off, len)
        }
        other => panic!("unknown blob method {other}"),
    }
}

fn mk_runtime(peers: Vec<(NodeAddr, u16)>, poll_interval_us: u64) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = RuntimeConfig {
        node: NodeConfig { addr: "127.0.0.1:0".into(), loader_port: 0 },
        peers: peers
            .into_iter()
            .map(|(addr, loader_port)| PeerConfig { addr: addr.to_string(), loader_port })
            .collect(),
        monitor: MonitorConfig { poll_interval_us, reserve_mem_mbs: 0 },
    };
    let rt = Runtime::init(cfg).expect("runtime init");
    rt.set_dispatcher(Arc::new(blob_dispatcher));
    // Keep destination eligibility independent of the test machine.
    rt.heap_manager()
        .mock_set_free_resource(Some(Resource { cores: 8, mem_mbs: 1 << 20 }));
    rt
}

/// A destination whose monitor stays quiet.
fn mk_dest() -> Runtime {
    mk_runtime(Vec::new(), 3_600_000_000)
}

fn peer_of(rt: &Runtime) -> (NodeAddr, u16) {
    (rt.node(), rt.migrator().loader_addr().port())
}

fn wait_for(pred: impl Fn() -> bool, what: &str) {
    for _ in 0..3000 {
        if pred() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

fn get_payload(off: u64, len: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(12);
    p.extend_from_slice(&off.to_le_bytes());
    p.extend_from_slice(&len.to_le_bytes());
    p
}

// Scenario: mock memory pressure evicts a heap to the peer; a follow-up
// RPC by HeapId reaches the new home and the data is intact.
#[test]
fn migrate_under_memory_pressure() {
    let dest = mk_dest();
    let src = mk_runtime(vec![peer_of(&dest)], 10_000);

    let heap = src.create_proclet().expect("create");
    let id = heap.id();
    let m = heap.new_mutex();
    drop(heap);

    let data = vec![0xC3u8; 2 << 20];
    let reply = src.invoke(id, M_PUT, &data).expect("put");
    let off = u64::from_le_bytes(reply.try_into().unwrap());

    src.monitor().mock_set_pressure(Pressure { cpu_pressure: false, mem_mbs_to_release: 1 });
    wait_for(|| !src.heap_manager().contains(id), "heap to evacuate");
    wait_for(|| dest.heap_manager().contains(id), "heap to arrive");

    // Same bytes, reached over RPC through the updated route.
    let fetched = src.invoke(id, M_GET, &get_payload(off, data.len() as u32)).expect("get");
    assert_eq!(fetched, data);

    // The primitive sidecar was recovered at the same offset.
    let dest_heap = dest.heap_manager().get(id).expect("resident on dest");
    assert_eq!(dest_heap.header().state(), HeapState::Resident);
    assert!(dest_heap.header().mutexes.contains(&m.offset()));
    assert_eq!(src.heap_manager().lookup_route(id), Some(dest.node()));

    // The pooled client to the destination is one stable instance.
    let c1 = src.clients().get(&dest.node());
    assert!(Arc::ptr_eq(&c1, &src.clients().get(&dest.node())));

    src.shutdown();
    assert!(src.is_shutting_down());
    dest.shutdown();
}

// Scenario: a thread parked in CondVar::wait survives the migration of
// its heap; FIFO order is preserved; signals after the move wake it on
// the destination, where it reacquires its mutex.
#[test]
fn waiters_survive_migration_in_fifo_order() {
    let dest = mk_dest();
    let src = mk_runtime(vec![peer_of(&dest)], 3_600_000_000);

    let heap = src.create_proclet().expect("create");
    let id = heap.id();
    let m = heap.new_mutex();
    let v = heap.new_condvar();

    let order = Arc::new(StdMutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..3usize {
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            m.lock();
            v.wait(&m);
            order.lock().unwrap().push(i);
            m.unlock();
        }));
        wait_for(|| v.get_waiters().len() == i + 1, "waiter to park");
    }
    let queue_before = v.get_waiters();
    drop(heap);

    assert_eq!(src.migrator().migrate(vec![id]).expect("migrate"), 1);
    assert!(!src.heap_manager().contains(id));
    let dest_heap = dest.heap_manager().get(id).expect("resident on dest");

    // Post-migration FIFO order equals pre-migration order.
    assert_eq!(v.get_waiters(), queue_before);
    assert!(dest_heap.header().condvars.contains(&v.offset()));

    // Wake one at a time; each waiter reacquires the mutex on the
    // destination incarnation.
    for expect in 0..3usize {
        v.signal();
        wait_for(
            || order.lock().unwrap().len() == expect + 1,
            "woken waiter to run",
        );
        assert_eq!(order.lock().unwrap()[expect], expect);
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(v.get_waiters().is_empty());

    src.shutdown();
    dest.shutdown();
}

// A heap with no waiters and no in-flight work migrates cleanly.
#[test]
fn empty_heap_migrates() {
    let dest = mk_dest();
    let src = mk_runtime(vec![peer_of(&dest)], 3_600_000_000);

    let heap = src.create_proclet().expect("create");
    let id = heap.id();
    heap.alloc(64);
    drop(heap);

    assert_eq!(src.migrator().migrate(vec![id]).expect("migrate"), 1);
    assert!(dest.heap_manager().contains(id));

    src.shutdown();
    dest.shutdown();
}

// Scenario: the destination dies mid-transfer. The heap rolls back to
// Resident, and the next attempt picks the other peer and succeeds.
#[test]
fn migration_abort_then_retry_on_other_peer() {
    // Fake peer: answers STATUS with plentiful resources, but its loader
    // closes every connection before acking.
    let rpc_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let fake_rpc = NodeAddr::new(Ipv4Addr::LOCALHOST, rpc_listener.local_addr().unwrap().port());
    let loader_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let fake_loader_port = loader_listener.local_addr().unwrap().port();

    thread::spawn(move || {
        while let Ok((mut stream, _)) = rpc_listener.accept() {
            thread::spawn(move || loop {
                let Ok((kind, _payload)) = read_frame(&mut stream) else { return };
                if kind == RPC_STATUS {
                    let mut e = Encoder::new();
                    e.put_u32(64); // cores
                    e.put_u32(1 << 20); // mem_mbs
                    if write_frame(&mut stream, RPC_STATUS_REPLY, &e.finish()).is_err() {
                        return;
                    }
                }
            });
        }
    });
    thread::spawn(move || {
        while let Ok((stream, _)) = loader_listener.accept() {
            drop(stream); // die mid-transfer
        }
    });

    let dest = mk_dest();
    let src = mk_runtime(
        vec![(fake_rpc, fake_loader_port), peer_of(&dest)],
        3_600_000_000,
    );

    let heap = src.create_proclet().expect("create");
    let id = heap.id();
    let payload = vec![7u8; 4096];
    let off = heap.alloc(payload.len());
    heap.write_at(off, &payload);

    // First pass hits the fake peer and aborts; the heap is Resident
    // again.
    assert!(src.migrator().migrate(vec![id]).is_err());
    assert!(src.heap_manager().contains(id));
    assert_eq!(heap.header().state(), HeapState::Resident);

    // Next pass rotates to the live peer and succeeds.
    assert_eq!(src.migrator().migrate(vec![id]).expect("migrate"), 1);
    wait_for(|| dest.heap_manager().contains(id), "heap to arrive");
    let fetched = dest
        .invoke(id, M_GET, &get_payload(off, payload.len() as u32))
        .expect("get on dest");
    assert_eq!(fetched, payload);

    src.shutdown();
    dest.shutdown();
}

// A duplicate HEAP_XFER for an already-resident heap is acked and
// ignored, so a lost ACK cannot fork the heap.
#[test]
fn duplicate_transfer_is_idempotent() {
    let dest = mk_dest();
    let src = mk_runtime(vec![peer_of(&dest)], 3_600_000_000);

    let heap = src.create_proclet().expect("create");
    let id = heap.id();
    let off = heap.alloc(8);
    heap.write_at(off, b"payload!");
    let xfer = proclet::proto::frame::HeapXfer {
        heap_id: id,
        src_node_addr: src.node(),
        offset_us: 0,
        heap_bytes: heap.snapshot_bytes(),
        prims: heap.snapshot_prims(),
        signals: Vec::new(),
    };
    drop(heap);

    let loader = dest.migrator().loader_addr().socket_addr();
    for _ in 0..2 {
        let mut stream = TcpStream::connect(loader).unwrap();
        write_frame(&mut stream, proclet::proto::frame::KIND_HEAP_XFER, &xfer.encode()).unwrap();
        let (kind, payload) = read_frame(&mut stream).unwrap();
        assert_eq!(kind, KIND_ACK);
        assert_eq!(proclet::proto::frame::decode_ack(&payload).unwrap(), id);
    }
    assert_eq!(dest.heap_manager().num_heaps(), 1);

    src.shutdown();
    dest.shutdown();
}

// Destruction routes to the owning node after a migration.
#[test]
fn destroy_follows_the_heap() {
    let dest = mk_dest();
    let src = mk_runtime(vec![peer_of(&dest)], 3_600_000_000);

    let heap = src.create_proclet().expect("create");
    let id = heap.id();
    heap.alloc(16);
    drop(heap);

    assert_eq!(src.migrator().migrate(vec![id]).expect("migrate"), 1);
    assert!(dest.heap_manager().contains(id));

    src.destroy_proclet(id).expect("remote destroy");
    assert!(!dest.heap_manager().contains(id));

    src.shutdown();
    dest.shutdown();
}
