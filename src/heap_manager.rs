// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Owner of all locally resident proclet heaps, the HeapId → home-node
// route table, and the victim-selection policy the pressure monitor
// drives.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::heap::{HeapId, HeapState, NodeAddr, ProcletHeap};
use crate::limits::{MAX_NUM_HEAPS, MIN_CORES_TO_SHED, MIN_NUM_CORES};
use crate::monitor::Pressure;
use crate::parted_hash::PartitionedSpinHashMap;
use crate::spin_lock::SpinLock;

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Free capacity on a node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resource {
    pub cores: u32,
    pub mem_mbs: u32,
}

/// A candidate destination's advertised state.
#[derive(Copy, Clone, Debug)]
pub struct NodeStatus {
    pub free_resource: Resource,
    pub addr: NodeAddr,
}

impl NodeStatus {
    /// Whether the node can absorb `r` and still keep a minimum of
    /// runnable cores. Core starvation disqualifies a destination even
    /// when memory is abundant.
    pub fn has_enough_resource(&self, r: &Resource) -> bool {
        self.free_resource.mem_mbs >= r.mem_mbs && self.free_resource.cores >= MIN_NUM_CORES
    }
}

// ---------------------------------------------------------------------------
// HeapManager
// ---------------------------------------------------------------------------

pub struct HeapManager {
    node: NodeAddr,
    id_salt: u64,
    next_seq: AtomicU64,
    count: AtomicUsize,
    heaps: PartitionedSpinHashMap<HeapId, Arc<ProcletHeap>>,
    routes: PartitionedSpinHashMap<HeapId, NodeAddr>,
    mock_free: SpinLock<Option<Resource>>,
}

impl HeapManager {
    pub fn new(node: NodeAddr) -> Arc<Self> {
        let mut h = DefaultHasher::new();
        node.raw().hash(&mut h);
        Arc::new(Self {
            node,
            id_salt: h.finish() << 32,
            next_seq: AtomicU64::new(1),
            count: AtomicUsize::new(0),
            heaps: PartitionedSpinHashMap::new(),
            routes: PartitionedSpinHashMap::new(),
            mock_free: SpinLock::new(None),
        })
    }

    pub fn node(&self) -> NodeAddr {
        self.node
    }

    /// Create a fresh resident heap. Fails once the node holds
    /// [`MAX_NUM_HEAPS`].
    pub fn create_heap(&self) -> io::Result<Arc<ProcletHeap>> {
        if self.count.fetch_add(1, Ordering::AcqRel) >= MAX_NUM_HEAPS {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(io::Error::other(format!(
                "heap table full ({MAX_NUM_HEAPS} heaps)"
            )));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = self.id_salt | seq;
        let heap = ProcletHeap::new(id, self.node);
        self.heaps.insert(id, Arc::clone(&heap));
        Ok(heap)
    }

    /// Take ownership of a rehydrated heap (loader path).
    pub fn adopt(&self, heap: Arc<ProcletHeap>) -> io::Result<()> {
        if self.count.fetch_add(1, Ordering::AcqRel) >= MAX_NUM_HEAPS {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(io::Error::other(format!(
                "heap table full ({MAX_NUM_HEAPS} heaps)"
            )));
        }
        heap.header().set_home(self.node);
        heap.header().set_state(HeapState::Resident);
        self.heaps.insert(heap.id(), heap);
        Ok(())
    }

    pub fn get(&self, id: HeapId) -> Option<Arc<ProcletHeap>> {
        self.heaps.get(&id)
    }

    pub fn contains(&self, id: HeapId) -> bool {
        self.heaps.contains(&id)
    }

    /// Drop a heap from the local table (evacuation or destruction).
    pub fn remove(&self, id: HeapId) -> Option<Arc<ProcletHeap>> {
        let heap = self.heaps.remove(&id);
        if heap.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        heap
    }

    pub fn num_heaps(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Drop every local heap. Shutdown path.
    pub fn clear(&self) {
        for heap in self.heaps.all_values() {
            self.remove(heap.id());
        }
    }

    // -- route table ----------------------------------------------------------

    /// Last known home of a heap that is not resident here.
    pub fn lookup_route(&self, id: HeapId) -> Option<NodeAddr> {
        self.routes.get(&id)
    }

    pub fn set_route(&self, id: HeapId, home: NodeAddr) {
        self.routes.insert(id, home);
    }

    // -- victim selection -----------------------------------------------------

    /// Pick heaps to evict under `pressure`.
    ///
    /// Only Resident heaps are eligible. Preference order: heaps with no
    /// held primitives first, then oldest last-invocation, then smallest
    /// — shed cheap, idle state first. Victims accumulate until the
    /// memory deficit is covered and, under CPU pressure, their active
    /// threads account for [`MIN_CORES_TO_SHED`] cores.
    pub fn pick_heaps(&self, pressure: &Pressure) -> Vec<HeapId> {
        if pressure.is_none() {
            return Vec::new();
        }

        let mut candidates: Vec<Arc<ProcletHeap>> = self
            .heaps
            .all_values()
            .into_iter()
            .filter(|h| h.header().state() == HeapState::Resident)
            .collect();
        candidates.sort_by_key(|h| {
            (
                h.held_prim_count(),
                h.header().last_invoked_us(),
                h.size_bytes(),
            )
        });

        let mut victims = Vec::new();
        let mut mem_mbs = 0u32;
        let mut cores = 0u32;
        for heap in candidates {
            let need_mem = mem_mbs < pressure.mem_mbs_to_release;
            let need_cores = pressure.cpu_pressure && cores < MIN_CORES_TO_SHED;
            if !need_mem && !need_cores {
                break;
            }
            // An idle heap sheds no cores; only memory pressure claims it.
            let busy = heap.header().in_flight();
            if !need_mem && busy == 0 {
                continue;
            }
            mem_mbs += heap.size_mbs();
            cores += busy;
            victims.push(heap.id());
        }
        victims
    }

    // -- free resources -------------------------------------------------------

    /// Override the free-resource probe. Tests only.
    pub fn mock_set_free_resource(&self, r: Option<Resource>) {
        *self.mock_free.lock() = r;
    }

    /// Current free capacity: the mock when set, otherwise the real
    /// probe.
    pub fn free_resource(&self) -> Resource {
        if let Some(r) = *self.mock_free.lock() {
            return r;
        }
        probe_free_resource()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            free_resource: self.free_resource(),
            addr: self.node,
        }
    }
}

#[cfg(target_os = "linux")]
fn probe_free_resource() -> Resource {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let mem_mbs = unsafe {
        let mut info: libc::sysinfo = std::mem::zeroed();
        if libc::sysinfo(&mut info) == 0 {
            ((info.freeram as u64 * info.mem_unit as u64) >> 20) as u32
        } else {
            0
        }
    };
    Resource { cores, mem_mbs }
}

#[cfg(not(target_os = "linux"))]
fn probe_free_resource() -> Resource {
    Resource {
        cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        mem_mbs: 0,
    }
}
