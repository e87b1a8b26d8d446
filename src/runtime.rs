// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide runtime façade. Owns the singletons and ties their
// lifetimes together: heap manager, RPC server + client pool, migrator,
// monitor — initialized in dependency order, torn down in reverse.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::{info, warn};

use crate::config::RuntimeConfig;
use crate::heap::{HeapContext, HeapId, HeapState, NodeAddr, ProcletHeap};
use crate::heap_manager::{HeapManager, NodeStatus};
use crate::monitor::Monitor;
use crate::proto::migrator::{Migrator, Peer};
use crate::proto::rpc::{
    RpcClient, RpcClientMgr, RpcRequest, RpcResponse, RpcServer, ERR_NO_DISPATCHER,
};
use crate::spin_lock::SpinLock;

/// Application-supplied invocation dispatcher: `(heap, method, payload)
/// → reply bytes`. Runs on the node where the heap is resident.
pub type Dispatcher = Arc<dyn Fn(&ProcletHeap, u32, &[u8]) -> Vec<u8> + Send + Sync>;

const MAX_ROUTE_HOPS: usize = 8;

struct Shared {
    heap_manager: OnceLock<Arc<HeapManager>>,
    dispatcher: SpinLock<Option<Dispatcher>>,
}

pub struct Runtime {
    node: NodeAddr,
    shared: Arc<Shared>,
    heap_manager: Arc<HeapManager>,
    clients: Arc<RpcClientMgr<NodeAddr, RpcClient>>,
    migrator: Arc<Migrator>,
    monitor: Arc<Monitor>,
    rpc_server: RpcServer,
    peers: Vec<Peer>,
    shutting_down: AtomicBool,
}

impl Runtime {
    /// Bring the node up: RPC server, heap manager, client pool,
    /// migrator (binds the loader port), monitor (starts polling).
    pub fn init(cfg: RuntimeConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            heap_manager: OnceLock::new(),
            dispatcher: SpinLock::new(None),
        });

        let handler_shared = Arc::clone(&shared);
        let rpc_server = RpcServer::start(
            cfg.node_addr()?,
            Arc::new(move |req| handle_rpc(&handler_shared, req)),
        )?;
        // The config may ask for port 0; the node's identity is whatever
        // actually got bound.
        let node = rpc_server.local_addr();

        let heap_manager = HeapManager::new(node);
        shared
            .heap_manager
            .set(Arc::clone(&heap_manager))
            .unwrap_or_else(|_| unreachable!("heap manager initialized twice"));

        let clients = Arc::new(RpcClientMgr::new(|addr: &NodeAddr| RpcClient::new(*addr)));
        let peers: Vec<Peer> = cfg
            .peer_addrs()?
            .into_iter()
            .map(|(rpc, loader_port)| Peer { rpc, loader_port })
            .collect();
        let migrator = Migrator::bind(
            node,
            cfg.node.loader_port,
            peers.clone(),
            Arc::clone(&heap_manager),
            Arc::clone(&clients),
        )?;
        let monitor = Monitor::new(
            Arc::clone(&heap_manager),
            Arc::clone(&migrator),
            cfg.monitor.poll_interval_us,
            cfg.monitor.reserve_mem_mbs,
        );
        monitor.run_loop_async();

        info!("runtime up on {node}");
        Ok(Self {
            node,
            shared,
            heap_manager,
            clients,
            migrator,
            monitor,
            rpc_server,
            peers,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Convenience for `main(argv[1])`.
    pub fn init_from_config_file(path: &str) -> io::Result<Self> {
        Self::init(RuntimeConfig::load(path)?)
    }

    pub fn node(&self) -> NodeAddr {
        self.node
    }

    pub fn heap_manager(&self) -> &Arc<HeapManager> {
        &self.heap_manager
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn migrator(&self) -> &Arc<Migrator> {
        &self.migrator
    }

    pub fn clients(&self) -> &Arc<RpcClientMgr<NodeAddr, RpcClient>> {
        &self.clients
    }

    pub fn node_status(&self) -> NodeStatus {
        self.heap_manager.status()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Install the invocation dispatcher. Must happen before the first
    /// invoke.
    pub fn set_dispatcher(&self, d: Dispatcher) {
        *self.shared.dispatcher.lock() = Some(d);
    }

    /// Create a fresh proclet heap on this node.
    pub fn create_proclet(&self) -> io::Result<Arc<ProcletHeap>> {
        self.heap_manager.create_heap()
    }

    /// Destroy a proclet wherever it lives. The sole destruction path:
    /// a heap's objects are freed on the node that owns it.
    pub fn destroy_proclet(&self, id: HeapId) -> io::Result<()> {
        if self.heap_manager.remove(id).is_some() {
            return Ok(());
        }
        self.route_request(id, &RpcRequest::Destroy { heap_id: id })
            .map(|_| ())
    }

    /// Invoke `method` on a proclet: directly when it is resident here,
    /// over RPC when it lives elsewhere, chasing NOT_HERE redirects as
    /// the route table converges.
    pub fn invoke(&self, heap_id: HeapId, method: u32, payload: &[u8]) -> io::Result<Vec<u8>> {
        match local_invoke(&self.heap_manager, &self.shared.dispatcher, heap_id, method, payload) {
            Ok(reply) => return Ok(reply),
            Err(InvokeFail::NoDispatcher) => {
                return Err(io::Error::other("no dispatcher installed"))
            }
            Err(InvokeFail::NotLocal(_)) => {}
        }
        match self.route_request(
            heap_id,
            &RpcRequest::Invoke {
                heap_id,
                method,
                payload: payload.to_vec(),
            },
        )? {
            RpcResponse::Reply(bytes) => Ok(bytes),
            other => Err(io::Error::other(format!("unexpected reply {other:?}"))),
        }
    }

    /// Send `req` to the heap's home, following redirects. Learns the
    /// final location into the route table.
    fn route_request(&self, heap_id: HeapId, req: &RpcRequest) -> io::Result<RpcResponse> {
        let mut candidates: Vec<NodeAddr> = Vec::new();
        if let Some(route) = self.heap_manager.lookup_route(heap_id) {
            candidates.push(route);
        }
        for p in &self.peers {
            if !candidates.contains(&p.rpc) {
                candidates.push(p.rpc);
            }
        }
        candidates.retain(|a| *a != self.node);
        if candidates.is_empty() {
            return Err(io::Error::other(format!("no route to heap {heap_id:#x}")));
        }

        let mut hops = 0usize;
        let mut queue = candidates.into_iter().collect::<std::collections::VecDeque<_>>();
        while let Some(dest) = queue.pop_front() {
            hops += 1;
            if hops > MAX_ROUTE_HOPS {
                break;
            }
            match self.clients.get(&dest).call(req) {
                Ok(RpcResponse::NotHere { new_home }) => {
                    if let Some(home) = new_home {
                        if home != self.node && home != dest {
                            self.heap_manager.set_route(heap_id, home);
                            queue.push_front(home);
                        }
                    }
                }
                Ok(RpcResponse::Err(reason)) => {
                    return Err(io::Error::other(format!(
                        "remote refused request (reason {reason})"
                    )))
                }
                Ok(resp) => {
                    self.heap_manager.set_route(heap_id, dest);
                    return Ok(resp);
                }
                Err(e) => {
                    warn!("rpc to {dest} failed: {e}");
                }
            }
        }
        Err(io::Error::other(format!(
            "heap {heap_id:#x} not found after {hops} hops"
        )))
    }

    /// Tear the node down in reverse initialization order. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("runtime on {} shutting down", self.node);
        self.monitor.stop();
        self.migrator.stop();
        self.rpc_server.stop();
        self.heap_manager.clear();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Local invocation path
// ---------------------------------------------------------------------------

enum InvokeFail {
    /// Not resident here; carries the best route guess.
    NotLocal(Option<NodeAddr>),
    NoDispatcher,
}

/// Balances the in-flight count even when a dispatcher panics.
struct InvocationGuard<'a> {
    header: &'a crate::heap::HeapHeader,
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        self.header.invocation_end();
    }
}

fn local_invoke(
    hm: &HeapManager,
    dispatcher: &SpinLock<Option<Dispatcher>>,
    heap_id: HeapId,
    method: u32,
    payload: &[u8],
) -> Result<Vec<u8>, InvokeFail> {
    loop {
        let Some(heap) = hm.get(heap_id) else {
            return Err(InvokeFail::NotLocal(hm.lookup_route(heap_id)));
        };
        let header = heap.header().as_ref();
        match header.state() {
            HeapState::Resident => {
                header.invocation_begin();
                let guard = InvocationGuard { header };
                if header.state() != HeapState::Resident {
                    // Lost the race with the migrator; park and retry.
                    drop(guard);
                    continue;
                }
                let Some(d) = dispatcher.lock().clone() else {
                    return Err(InvokeFail::NoDispatcher);
                };
                let _ctx = HeapContext::enter(heap_id);
                header.touch_invoked();
                let reply = d(&heap, method, payload);
                drop(guard);
                return Ok(reply);
            }
            state @ (HeapState::Quiescing | HeapState::Migrating) => {
                // Parked until the migration settles one way or the other.
                header.wait_state_change(state);
            }
            HeapState::Evacuated => {
                return Err(InvokeFail::NotLocal(
                    hm.lookup_route(heap_id).or(Some(header.home())),
                ));
            }
        }
    }
}

fn handle_rpc(shared: &Shared, req: RpcRequest) -> RpcResponse {
    let Some(hm) = shared.heap_manager.get() else {
        // Still initializing; the caller retries.
        return RpcResponse::Err(ERR_NO_DISPATCHER);
    };
    match req {
        RpcRequest::Invoke { heap_id, method, payload } => {
            match local_invoke(hm, &shared.dispatcher, heap_id, method, &payload) {
                Ok(reply) => RpcResponse::Reply(reply),
                Err(InvokeFail::NotLocal(new_home)) => RpcResponse::NotHere { new_home },
                Err(InvokeFail::NoDispatcher) => RpcResponse::Err(ERR_NO_DISPATCHER),
            }
        }
        RpcRequest::Status => RpcResponse::Status { free: hm.free_resource() },
        RpcRequest::Destroy { heap_id } => {
            if hm.remove(heap_id).is_some() {
                RpcResponse::Reply(Vec::new())
            } else {
                RpcResponse::NotHere {
                    new_home: hm.lookup_route(heap_id),
                }
            }
        }
    }
}
