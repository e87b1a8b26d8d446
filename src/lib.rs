// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Node-local runtime for migratable proclet heaps.
//
// A proclet is a self-contained heap plus the synchronization primitives
// that live on it. Proclets are invoked by identifier — directly when
// resident, over RPC when remote — and live-migrate between nodes when
// the pressure monitor decides to shed load. Migration serializes the
// heap bytes, the primitive sidecar, and every FIFO waiter queue, and
// rehydrates them on the destination so parked waiters wake against the
// heap's new incarnation.

pub mod config;
pub mod condition;
pub mod heap;
pub mod heap_manager;
pub mod limits;
pub mod monitor;
pub mod mutex;
pub mod parted_hash;
pub mod proto;
pub mod rcu_hash_set;
pub mod rcu_lock;
pub mod runtime;
pub mod spin_lock;
pub mod time;
pub mod waiter;

pub use condition::CondVar;
pub use config::RuntimeConfig;
pub use heap::{lookup_heap, HeapId, HeapState, NodeAddr, ProcletHeap};
pub use heap_manager::{HeapManager, NodeStatus, Resource};
pub use monitor::{Monitor, Pressure};
pub use mutex::Mutex;
pub use parted_hash::{PartitionedSpinHashMap, PartitionedSpinHashSet};
pub use proto::{Migrator, RpcClient, RpcClientMgr};
pub use rcu_hash_set::RcuHashSet;
pub use rcu_lock::RcuLock;
pub use runtime::{Dispatcher, Runtime};
pub use spin_lock::SpinLock;
