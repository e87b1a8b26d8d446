// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Proclet heaps: a contiguous byte region with a bump cursor, plus a
// header that tracks the synchronization primitives living on it.
//
// The region is opaque bytes; primitives are a sidecar keyed by the
// 8-byte slot allocated for each one inside the region, so the migrator
// can serialize "bytes + (offset, kind, waiters) records" without
// walking heap memory. A process-global registry maps HeapId to the
// heap's current incarnation — the in-process rendition of the
// cluster-wide logical address space: handle-based primitive operations
// resolve through it and transparently land on the destination after a
// migration.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, OnceLock, Weak};

use crate::condition::CondVarCore;
use crate::mutex::MutexCore;
use crate::parted_hash::{PartitionedSpinHashMap, PartitionedSpinHashSet};
use crate::rcu_lock::RcuLock;
use crate::spin_lock::SpinLock;
use crate::time;
use crate::waiter::WaiterToken;

/// Stable global identifier of a proclet heap.
pub type HeapId = u64;

// ---------------------------------------------------------------------------
// NodeAddr
// ---------------------------------------------------------------------------

/// A node's RPC endpoint, packed as `(ipv4 << 16) | port` so it fits the
/// wire format's u64 address fields.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr(u64);

impl NodeAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self(((u32::from(ip) as u64) << 16) | port as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn ip(self) -> Ipv4Addr {
        Ipv4Addr::from((self.0 >> 16) as u32)
    }

    pub fn port(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port()))
    }

    /// Same host, different port. Used to derive the loader endpoint.
    pub fn with_port(self, port: u16) -> Self {
        Self::new(self.ip(), port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port())
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({self})")
    }
}

impl std::str::FromStr for NodeAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sa: SocketAddrV4 = s.parse()?;
        Ok(Self::new(*sa.ip(), sa.port()))
    }
}

// ---------------------------------------------------------------------------
// Heap state machine
// ---------------------------------------------------------------------------

/// Lifecycle of a heap on its current node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapState {
    Resident = 0,
    Quiescing = 1,
    Migrating = 2,
    Evacuated = 3,
}

impl HeapState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Resident,
            1 => Self::Quiescing,
            2 => Self::Migrating,
            3 => Self::Evacuated,
            other => unreachable!("invalid heap state {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pending signals and primitive snapshots
// ---------------------------------------------------------------------------

/// How a queued condition-variable wake should be applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalMode {
    Signal = 1,
    Broadcast = 2,
}

impl SignalMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Signal),
            2 => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// A signal issued while the heap was mid-migration, to be replayed on
/// the destination after rehydration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingSignal {
    pub offset: u64,
    pub mode: SignalMode,
}

/// Wire identity of a registered primitive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimKind {
    Mutex = 1,
    CondVar = 2,
}

impl PrimKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Mutex),
            2 => Some(Self::CondVar),
            _ => None,
        }
    }
}

/// One primitive's transfer record: kind, heap offset, FIFO waiter queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimSnapshot {
    pub kind: PrimKind,
    pub offset: u64,
    pub waiters: Vec<WaiterToken>,
}

// ---------------------------------------------------------------------------
// HeapHeader
// ---------------------------------------------------------------------------

/// Per-heap metadata: identity, state, primitive registration sets,
/// in-flight invocation count, and the RCU lock the migrator quiesces
/// before snapshotting.
pub struct HeapHeader {
    id: HeapId,
    home: AtomicU64,
    state: AtomicU8,
    /// Offsets of every live condition variable on this heap.
    pub condvars: PartitionedSpinHashSet<u64>,
    /// Offsets of every live mutex on this heap.
    pub mutexes: PartitionedSpinHashSet<u64>,
    /// Flushed by the migration barrier before the waiter snapshot.
    pub rcu: RcuLock,
    pending_signals: SpinLock<Vec<PendingSignal>>,
    in_flight: AtomicU32,
    offset_us: AtomicI64,
    last_invoked_us: AtomicU64,
    latch: StdMutex<u64>,
    latch_cv: Condvar,
}

impl HeapHeader {
    fn new(id: HeapId, home: NodeAddr) -> Self {
        Self {
            id,
            home: AtomicU64::new(home.raw()),
            state: AtomicU8::new(HeapState::Resident as u8),
            condvars: PartitionedSpinHashSet::new(),
            mutexes: PartitionedSpinHashSet::new(),
            rcu: RcuLock::new(),
            pending_signals: SpinLock::new(Vec::new()),
            in_flight: AtomicU32::new(0),
            offset_us: AtomicI64::new(0),
            last_invoked_us: AtomicU64::new(time::microtime()),
            latch: StdMutex::new(0),
            latch_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn home(&self) -> NodeAddr {
        NodeAddr::from_raw(self.home.load(Ordering::Acquire))
    }

    pub fn set_home(&self, addr: NodeAddr) {
        self.home.store(addr.raw(), Ordering::Release);
    }

    pub fn state(&self) -> HeapState {
        HeapState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unconditional transition; wakes everything parked on the latch.
    pub fn set_state(&self, next: HeapState) {
        self.state.store(next as u8, Ordering::Release);
        self.pulse();
    }

    /// CAS transition. Returns `false` if the heap left `from` already.
    pub fn try_transition(&self, from: HeapState, to: HeapState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.pulse();
        }
        ok
    }

    fn pulse(&self) {
        let mut epoch = self.latch.lock().expect("heap latch poisoned");
        *epoch += 1;
        self.latch_cv.notify_all();
    }

    /// Block until the state leaves `seen` (any transition pulse wakes).
    pub fn wait_state_change(&self, seen: HeapState) -> HeapState {
        let mut epoch = self.latch.lock().expect("heap latch poisoned");
        loop {
            let cur = self.state();
            if cur != seen {
                return cur;
            }
            let start = *epoch;
            while *epoch == start {
                epoch = self.latch_cv.wait(epoch).expect("heap latch poisoned");
            }
        }
    }

    // -- invocation accounting ------------------------------------------------

    pub fn invocation_begin(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn invocation_end(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "in-flight invocation count underflow");
        if prev == 1 {
            self.pulse();
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Block until no invocation is in flight. Called with the heap in
    /// Quiescing, so no new invocation can start behind our back.
    pub fn await_quiesced(&self) {
        let mut epoch = self.latch.lock().expect("heap latch poisoned");
        while self.in_flight() != 0 {
            epoch = self.latch_cv.wait(epoch).expect("heap latch poisoned");
        }
    }

    // -- pending signals ------------------------------------------------------

    pub fn push_pending(&self, sig: PendingSignal) {
        self.pending_signals.lock().push(sig);
    }

    pub fn drain_pending(&self) -> Vec<PendingSignal> {
        std::mem::take(&mut *self.pending_signals.lock())
    }

    // -- logical time ---------------------------------------------------------

    /// Microseconds on this heap's logical clock.
    pub fn microtime(&self) -> u64 {
        let t = time::microtime() as i64 + self.offset_us.load(Ordering::Acquire);
        t.max(0) as u64
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us.load(Ordering::Acquire)
    }

    pub fn set_offset_us(&self, off: i64) {
        self.offset_us.store(off, Ordering::Release);
    }

    /// Sleep until the heap's logical clock reaches `deadline_us`.
    pub fn sleep_until(&self, deadline_us: u64) {
        let now = self.microtime();
        if deadline_us > now {
            time::sleep_us(deadline_us - now);
        }
    }

    pub fn touch_invoked(&self) {
        self.last_invoked_us.store(time::microtime(), Ordering::Release);
    }

    pub fn last_invoked_us(&self) -> u64 {
        self.last_invoked_us.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// ProcletHeap
// ---------------------------------------------------------------------------

struct Region {
    bytes: Vec<u8>,
    brk: usize,
}

pub(crate) enum Prim {
    Mutex(Arc<MutexCore>),
    CondVar(Arc<CondVarCore>),
}

/// A proclet's heap: header + contiguous region + primitive sidecar.
pub struct ProcletHeap {
    header: Arc<HeapHeader>,
    region: SpinLock<Region>,
    prims: SpinLock<HashMap<u64, Prim>>,
}

impl ProcletHeap {
    /// Create an empty resident heap and publish it in the global
    /// registry.
    pub fn new(id: HeapId, home: NodeAddr) -> Arc<Self> {
        let heap = Arc::new(Self {
            header: Arc::new(HeapHeader::new(id, home)),
            region: SpinLock::new(Region { bytes: Vec::new(), brk: 0 }),
            prims: SpinLock::new(HashMap::new()),
        });
        registry().insert(id, Arc::downgrade(&heap));
        heap
    }

    /// Rehydrate a heap from transferred bytes (loader path). Primitives
    /// are restored separately via [`restore_prim`].
    pub fn from_bytes(id: HeapId, home: NodeAddr, bytes: Vec<u8>, offset_us: i64) -> Arc<Self> {
        let brk = bytes.len();
        let heap = Arc::new(Self {
            header: Arc::new(HeapHeader::new(id, home)),
            region: SpinLock::new(Region { bytes, brk }),
            prims: SpinLock::new(HashMap::new()),
        });
        heap.header.set_offset_us(offset_us);
        registry().insert(id, Arc::downgrade(&heap));
        heap
    }

    pub fn id(&self) -> HeapId {
        self.header.id
    }

    pub fn header(&self) -> &Arc<HeapHeader> {
        &self.header
    }

    // -- region ---------------------------------------------------------------

    /// Bump-allocate `len` bytes (8-byte aligned) and return the offset.
    pub fn alloc(&self, len: usize) -> u64 {
        let mut region = self.region.lock();
        let off = (region.brk + 7) & !7;
        let end = off + len;
        if region.bytes.len() < end {
            region.bytes.resize(end, 0);
        }
        region.brk = end;
        off as u64
    }

    /// Copy `data` into the region at `off`.
    ///
    /// # Panics
    /// Panics when the range falls outside the allocated region.
    pub fn write_at(&self, off: u64, data: &[u8]) {
        let mut region = self.region.lock();
        let start = off as usize;
        let end = start + data.len();
        assert!(end <= region.brk, "heap write past brk ({end} > {})", region.brk);
        region.bytes[start..end].copy_from_slice(data);
    }

    /// Copy `len` bytes out of the region at `off`.
    pub fn read_at(&self, off: u64, len: usize) -> Vec<u8> {
        let region = self.region.lock();
        let start = off as usize;
        let end = start + len;
        assert!(end <= region.brk, "heap read past brk ({end} > {})", region.brk);
        region.bytes[start..end].to_vec()
    }

    /// Bytes currently allocated in the region.
    pub fn size_bytes(&self) -> usize {
        self.region.lock().brk
    }

    /// Region size in whole megabytes, rounded up.
    pub fn size_mbs(&self) -> u32 {
        self.size_bytes().div_ceil(1 << 20) as u32
    }

    /// Clone the used prefix of the region for transfer.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        let region = self.region.lock();
        region.bytes[..region.brk].to_vec()
    }

    // -- primitives -----------------------------------------------------------

    /// Create a mutex on this heap. Allocates its identity slot in the
    /// region and registers it in the header.
    pub fn new_mutex(&self) -> crate::mutex::Mutex {
        let offset = self.alloc(8);
        self.prims
            .lock()
            .insert(offset, Prim::Mutex(Arc::new(MutexCore::new())));
        self.header.mutexes.put(offset);
        crate::mutex::Mutex::from_parts(self.id(), offset)
    }

    /// Create a condition variable on this heap.
    pub fn new_condvar(&self) -> crate::condition::CondVar {
        let offset = self.alloc(8);
        self.prims
            .lock()
            .insert(offset, Prim::CondVar(Arc::new(CondVarCore::new())));
        self.header.condvars.put(offset);
        crate::condition::CondVar::from_parts(self.id(), offset)
    }

    /// Destroy the primitive at `offset`, unregistering it from the
    /// header. Waiters must be gone.
    pub fn release_prim(&self, offset: u64) {
        if self.prims.lock().remove(&offset).is_some() {
            self.header.mutexes.remove(&offset);
            self.header.condvars.remove(&offset);
        }
    }

    pub(crate) fn mutex_core(&self, offset: u64) -> Option<Arc<MutexCore>> {
        match self.prims.lock().get(&offset) {
            Some(Prim::Mutex(core)) => Some(Arc::clone(core)),
            _ => None,
        }
    }

    pub(crate) fn condvar_core(&self, offset: u64) -> Option<Arc<CondVarCore>> {
        match self.prims.lock().get(&offset) {
            Some(Prim::CondVar(core)) => Some(Arc::clone(core)),
            _ => None,
        }
    }

    /// Number of mutexes currently held. Victim-selection input.
    pub fn held_prim_count(&self) -> usize {
        self.prims
            .lock()
            .values()
            .filter(|p| matches!(p, Prim::Mutex(m) if m.is_held()))
            .count()
    }

    /// Walk every registered primitive and record `(kind, offset,
    /// waiters)` in FIFO order. Called with the heap quiesced.
    pub fn snapshot_prims(&self) -> Vec<PrimSnapshot> {
        let mut out = Vec::new();
        let prims = self.prims.lock();
        for (&offset, prim) in prims.iter() {
            match prim {
                Prim::Mutex(core) => out.push(PrimSnapshot {
                    kind: PrimKind::Mutex,
                    offset,
                    waiters: core.waiter_snapshot(),
                }),
                Prim::CondVar(core) => out.push(PrimSnapshot {
                    kind: PrimKind::CondVar,
                    offset,
                    waiters: core.waiter_snapshot(),
                }),
            }
        }
        out.sort_by_key(|s| s.offset);
        out
    }

    /// Re-create a primitive at its recorded offset with its serialized
    /// waiter queue. Loader path; the queue order is authoritative.
    pub fn restore_prim(&self, snap: &PrimSnapshot) {
        match snap.kind {
            PrimKind::Mutex => {
                self.prims.lock().insert(
                    snap.offset,
                    Prim::Mutex(Arc::new(MutexCore::with_waiters(snap.waiters.clone()))),
                );
                self.header.mutexes.put(snap.offset);
            }
            PrimKind::CondVar => {
                self.prims.lock().insert(
                    snap.offset,
                    Prim::CondVar(Arc::new(CondVarCore::with_waiters(snap.waiters.clone()))),
                );
                self.header.condvars.put(snap.offset);
            }
        }
    }

    /// Apply a replayed signal to the condition variable at `offset`.
    pub fn apply_signal(&self, offset: u64, mode: SignalMode) {
        if let Some(core) = self.condvar_core(offset) {
            match mode {
                SignalMode::Signal => core.wake_one(),
                SignalMode::Broadcast => core.wake_all(),
            }
        }
    }
}

impl Drop for ProcletHeap {
    fn drop(&mut self) {
        // Only reap the registry entry if it still refers to a dead heap;
        // a rehydrated incarnation on another in-process node may have
        // replaced it already.
        let id = self.header.id;
        if registry().get(&id).is_some_and(|w| w.upgrade().is_none()) {
            registry().remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Global heap registry
// ---------------------------------------------------------------------------

fn registry() -> &'static PartitionedSpinHashMap<HeapId, Weak<ProcletHeap>> {
    static REGISTRY: OnceLock<PartitionedSpinHashMap<HeapId, Weak<ProcletHeap>>> = OnceLock::new();
    REGISTRY.get_or_init(PartitionedSpinHashMap::new)
}

/// Resolve a heap id to its current incarnation, wherever it lives in
/// this process.
pub fn lookup_heap(id: HeapId) -> Option<Arc<ProcletHeap>> {
    registry().get(&id).and_then(|w| w.upgrade())
}

/// Resolve or die. Primitive handles use this: a primitive must never
/// survive its heap.
pub(crate) fn live_heap(id: HeapId) -> Arc<ProcletHeap> {
    lookup_heap(id).unwrap_or_else(|| panic!("heap {id:#x} is gone; primitive outlived its heap"))
}

// ---------------------------------------------------------------------------
// Current-heap context
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: std::cell::Cell<Option<HeapId>> = const { std::cell::Cell::new(None) };
}

/// RAII guard marking the calling thread as running an invocation on a
/// heap. Set on RPC entry, cleared on exit.
pub struct HeapContext {
    prev: Option<HeapId>,
}

impl HeapContext {
    pub fn enter(id: HeapId) -> Self {
        let prev = CURRENT.with(|c| c.replace(Some(id)));
        Self { prev }
    }
}

impl Drop for HeapContext {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}

/// The heap the calling thread is currently invoking on, if any.
pub fn current_heap() -> Option<HeapId> {
    CURRENT.with(|c| c.get())
}

/// Drop the current invocation out of its heap's in-flight count while
/// the thread parks on a primitive. Returns the header that was
/// decremented; the caller re-increments that same header after the
/// park so the count stays balanced even if the heap moved meanwhile.
pub(crate) fn suspend_current_invocation(owning: HeapId) -> Option<Arc<HeapHeader>> {
    if current_heap() != Some(owning) {
        return None;
    }
    lookup_heap(owning).map(|heap| {
        let header = Arc::clone(heap.header());
        header.invocation_end();
        header
    })
}
