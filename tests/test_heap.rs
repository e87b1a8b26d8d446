// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Heap, heap-manager, and victim-selection tests.

use std::net::Ipv4Addr;

use proclet::heap::{self, HeapContext, HeapState};
use proclet::limits::MAX_NUM_HEAPS;
use proclet::{HeapManager, NodeAddr, NodeStatus, Pressure, ProcletHeap, Resource};

fn addr(port: u16) -> NodeAddr {
    NodeAddr::new(Ipv4Addr::LOCALHOST, port)
}

#[test]
fn node_addr_packing() {
    let a = NodeAddr::new(Ipv4Addr::new(10, 1, 2, 3), 9000);
    let b = NodeAddr::from_raw(a.raw());
    assert_eq!(a, b);
    assert_eq!(b.ip(), Ipv4Addr::new(10, 1, 2, 3));
    assert_eq!(b.port(), 9000);
    assert_eq!("10.1.2.3:9000".parse::<NodeAddr>().unwrap(), a);
    assert_eq!(a.with_port(1).port(), 1);
}

#[test]
fn alloc_read_write() {
    let heap = ProcletHeap::new(0xa11c_0001, addr(1));
    let a = heap.alloc(16);
    let b = heap.alloc(3);
    let c = heap.alloc(5);
    assert_eq!(a, 0);
    assert_eq!(b, 16);
    // Allocations are 8-byte aligned.
    assert_eq!(c, 24);

    heap.write_at(a, b"0123456789abcdef");
    heap.write_at(c, b"hello");
    assert_eq!(heap.read_at(a, 16), b"0123456789abcdef");
    assert_eq!(heap.read_at(c, 5), b"hello");
    assert_eq!(heap.size_bytes(), 29);
}

#[test]
#[should_panic(expected = "past brk")]
fn read_out_of_bounds_panics() {
    let heap = ProcletHeap::new(0xa11c_0002, addr(1));
    heap.alloc(8);
    heap.read_at(0, 64);
}

#[test]
fn registry_resolves_and_expires() {
    let id = 0xa11c_0003;
    let heap = ProcletHeap::new(id, addr(1));
    assert!(heap::lookup_heap(id).is_some());
    drop(heap);
    assert!(heap::lookup_heap(id).is_none());
}

#[test]
fn heap_context_nests() {
    assert_eq!(heap::current_heap(), None);
    {
        let _outer = HeapContext::enter(1);
        assert_eq!(heap::current_heap(), Some(1));
        {
            let _inner = HeapContext::enter(2);
            assert_eq!(heap::current_heap(), Some(2));
        }
        assert_eq!(heap::current_heap(), Some(1));
    }
    assert_eq!(heap::current_heap(), None);
}

#[test]
fn logical_time_offset() {
    let heap = ProcletHeap::new(0xa11c_0004, addr(1));
    let before = heap.header().microtime();
    heap.header().set_offset_us(1_000_000);
    let after = heap.header().microtime();
    assert!(after >= before + 900_000, "offset must shift logical time");

    // A deadline in the logical past returns immediately.
    heap.header().sleep_until(after);
    // A near-future logical deadline waits it out.
    let deadline = heap.header().microtime() + 20_000;
    heap.header().sleep_until(deadline);
    assert!(heap.header().microtime() >= deadline);
}

#[test]
fn snapshot_and_restore_prims() {
    let src = ProcletHeap::new(0xa11c_0005, addr(1));
    let m = src.new_mutex();
    let v = src.new_condvar();

    let snaps = src.snapshot_prims();
    assert_eq!(snaps.len(), 2);

    let dst = ProcletHeap::new(0xa11c_0006, addr(2));
    for s in &snaps {
        dst.restore_prim(s);
    }
    assert!(dst.header().mutexes.contains(&m.offset()));
    assert!(dst.header().condvars.contains(&v.offset()));
}

// ---------------------------------------------------------------------------
// HeapManager
// ---------------------------------------------------------------------------

#[test]
fn create_get_remove() {
    let hm = HeapManager::new(addr(9001));
    let heap = hm.create_heap().expect("create");
    let id = heap.id();

    assert!(hm.contains(id));
    assert!(hm.get(id).is_some());
    assert_eq!(hm.num_heaps(), 1);

    assert!(hm.remove(id).is_some());
    assert!(!hm.contains(id));
    assert_eq!(hm.num_heaps(), 0);
}

#[test]
fn heap_table_capacity() {
    let hm = HeapManager::new(addr(9002));
    let mut heaps = Vec::with_capacity(MAX_NUM_HEAPS);
    for _ in 0..MAX_NUM_HEAPS {
        heaps.push(hm.create_heap().expect("create"));
    }
    assert_eq!(hm.num_heaps(), MAX_NUM_HEAPS);

    // One past the limit fails.
    assert!(hm.create_heap().is_err());

    // Ids are unique.
    let mut ids: Vec<_> = heaps.iter().map(|h| h.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), MAX_NUM_HEAPS);

    // Freeing one slot makes room again.
    hm.remove(heaps[0].id());
    assert!(hm.create_heap().is_ok());
}

#[test]
fn route_table() {
    let hm = HeapManager::new(addr(9003));
    assert!(hm.lookup_route(1).is_none());
    hm.set_route(1, addr(9100));
    assert_eq!(hm.lookup_route(1), Some(addr(9100)));
    hm.set_route(1, addr(9200));
    assert_eq!(hm.lookup_route(1), Some(addr(9200)));
}

// The monitor never selects a heap whose state is not Resident.
#[test]
fn pick_heaps_skips_non_resident() {
    let hm = HeapManager::new(addr(9004));
    let a = hm.create_heap().unwrap();
    let b = hm.create_heap().unwrap();
    a.alloc(2 << 20);
    b.alloc(2 << 20);

    b.header().set_state(HeapState::Quiescing);
    let victims = hm.pick_heaps(&Pressure { cpu_pressure: false, mem_mbs_to_release: 1000 });
    assert_eq!(victims, vec![a.id()]);

    b.header().set_state(HeapState::Resident);
    let victims = hm.pick_heaps(&Pressure { cpu_pressure: false, mem_mbs_to_release: 1000 });
    assert_eq!(victims.len(), 2);
}

#[test]
fn pick_heaps_none_under_no_pressure() {
    let hm = HeapManager::new(addr(9005));
    hm.create_heap().unwrap();
    assert!(hm.pick_heaps(&Pressure::none()).is_empty());
}

// Smallest idle heaps go first; selection stops once the deficit is
// covered.
#[test]
fn pick_heaps_covers_memory_deficit() {
    let hm = HeapManager::new(addr(9006));
    let small = hm.create_heap().unwrap();
    let big = hm.create_heap().unwrap();
    small.alloc(1 << 20);
    big.alloc(8 << 20);
    // Make `small` the older of the two.
    big.header().touch_invoked();

    let victims = hm.pick_heaps(&Pressure { cpu_pressure: false, mem_mbs_to_release: 1 });
    assert_eq!(victims, vec![small.id()]);

    let victims = hm.pick_heaps(&Pressure { cpu_pressure: false, mem_mbs_to_release: 6 });
    assert_eq!(victims, vec![small.id(), big.id()]);
}

// CPU pressure claims busy heaps only; idle heaps shed no cores.
#[test]
fn pick_heaps_cpu_pressure_prefers_busy() {
    let hm = HeapManager::new(addr(9008));
    let idle = hm.create_heap().unwrap();
    let busy = hm.create_heap().unwrap();
    busy.header().invocation_begin();

    let victims = hm.pick_heaps(&Pressure { cpu_pressure: true, mem_mbs_to_release: 0 });
    assert_eq!(victims, vec![busy.id()]);
    assert!(!victims.contains(&idle.id()));

    busy.header().invocation_end();
}

#[test]
fn has_enough_resource_boundaries() {
    let want = Resource { cores: 0, mem_mbs: 100 };

    let plenty = NodeStatus {
        free_resource: Resource { cores: 8, mem_mbs: 4096 },
        addr: addr(9100),
    };
    assert!(plenty.has_enough_resource(&want));

    // Core starvation disqualifies even with abundant memory.
    let starved = NodeStatus {
        free_resource: Resource { cores: 1, mem_mbs: 1 << 20 },
        addr: addr(9100),
    };
    assert!(!starved.has_enough_resource(&want));

    let tight_mem = NodeStatus {
        free_resource: Resource { cores: 8, mem_mbs: 99 },
        addr: addr(9100),
    };
    assert!(!tight_mem.has_enough_resource(&want));
}

#[test]
fn mock_free_resource_overrides_probe() {
    let hm = HeapManager::new(addr(9007));
    hm.mock_set_free_resource(Some(Resource { cores: 3, mem_mbs: 77 }));
    assert_eq!(hm.free_resource(), Resource { cores: 3, mem_mbs: 77 });
    hm.mock_set_free_resource(None);
    // Real probe: just sane, nonzero core count.
    assert!(hm.free_resource().cores >= 1);
}
