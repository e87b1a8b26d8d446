// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Heap migration: the outbound transfer protocol and the inbound loader.
//
// Outbound, per heap: acquire (Resident→Quiescing), quiesce (in-flight
// drains to zero, then the header's RCU barrier flushes every reader
// touching waiter queues), snapshot (Quiescing→Migrating), transfer,
// rebind routes on ACK (Migrating→Evacuated), resume parked callers.
// Any transport failure rolls the heap back to Resident and leaves the
// retry to the monitor's next tick; the destination cursor advances per
// attempt, so the retry tries a different peer.
//
// Inbound: a loader socket on a well-known port. Rehydration is
// idempotent per HeapId, so a duplicate transfer after a lost ACK
// converges instead of forking the heap.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::heap::{HeapId, HeapState, NodeAddr, ProcletHeap};
use crate::heap_manager::{HeapManager, NodeStatus, Resource};
use crate::proto::frame::{
    self, read_frame, write_frame, HeapXfer, SignalReplay, KIND_ACK, KIND_HEAP_XFER, KIND_NACK,
    KIND_SIGNAL_REPLAY, NACK_NO_CAPACITY,
};
use crate::proto::rpc::{RpcClient, RpcClientMgr, RpcRequest, RpcResponse};
use crate::spin_lock::SpinLock;
use crate::time;

/// A peer node: its RPC endpoint and its loader port.
#[derive(Copy, Clone, Debug)]
pub struct Peer {
    pub rpc: NodeAddr,
    pub loader_port: u16,
}

impl Peer {
    fn loader_addr(&self) -> NodeAddr {
        self.rpc.with_port(self.loader_port)
    }
}

pub struct Migrator {
    node: NodeAddr,
    loader_addr: NodeAddr,
    heap_manager: Arc<HeapManager>,
    clients: Arc<RpcClientMgr<NodeAddr, RpcClient>>,
    peers: Vec<Peer>,
    next_peer: AtomicUsize,
    stopped: Arc<AtomicBool>,
    accept_handle: SpinLock<Option<JoinHandle<()>>>,
}

impl Migrator {
    /// Bind the loader port and start the accept loop.
    pub fn bind(
        node: NodeAddr,
        loader_port: u16,
        peers: Vec<Peer>,
        heap_manager: Arc<HeapManager>,
        clients: Arc<RpcClientMgr<NodeAddr, RpcClient>>,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind((node.ip(), loader_port))?;
        listener.set_nonblocking(true)?;
        let bound_port = match listener.local_addr()? {
            std::net::SocketAddr::V4(sa) => sa.port(),
            std::net::SocketAddr::V6(_) => {
                return Err(io::Error::other("loader requires an IPv4 endpoint"))
            }
        };
        let migrator = Arc::new(Self {
            node,
            loader_addr: node.with_port(bound_port),
            heap_manager,
            clients,
            peers,
            next_peer: AtomicUsize::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            accept_handle: SpinLock::new(None),
        });
        let this = Arc::clone(&migrator);
        let handle = std::thread::Builder::new()
            .name("proclet-loader".into())
            .spawn(move || this.run_loader_loop(listener))
            .expect("spawn loader thread");
        *migrator.accept_handle.lock() = Some(handle);
        info!("loader listening on {}", migrator.loader_addr);
        Ok(migrator)
    }

    /// The loader endpoint peers connect to.
    pub fn loader_addr(&self) -> NodeAddr {
        self.loader_addr
    }

    /// Stop the loader loop and its connection handlers.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }

    // -- outbound -------------------------------------------------------------

    /// Migrate `heaps` out, one at a time. Returns how many moved; a
    /// heap that failed to move is back in Resident and will be
    /// reconsidered on the monitor's next tick.
    pub fn migrate(&self, heaps: Vec<HeapId>) -> io::Result<usize> {
        let mut moved = 0usize;
        let mut last_err: Option<io::Error> = None;
        for id in heaps {
            match self.migrate_one(id) {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("migration of heap {id:#x} aborted: {e}");
                    last_err = Some(e);
                }
            }
        }
        match (moved, last_err) {
            (0, Some(e)) => Err(e),
            _ => Ok(moved),
        }
    }

    fn migrate_one(&self, id: HeapId) -> io::Result<bool> {
        let Some(heap) = self.heap_manager.get(id) else {
            return Ok(false);
        };
        let header = Arc::clone(heap.header());
        if !header.try_transition(HeapState::Resident, HeapState::Quiescing) {
            // Raced with another transition; never move a non-Resident heap.
            return Ok(false);
        }
        debug!("heap {id:#x}: quiescing ({} in flight)", header.in_flight());

        header.await_quiesced();
        // Flush readers still inside waiter queues, then freeze new
        // signal delivery into the pending list.
        header.rcu.writer_sync(|| {});
        header.set_state(HeapState::Migrating);

        let xfer = HeapXfer {
            heap_id: id,
            src_node_addr: self.node,
            offset_us: header.offset_us() + time::microtime() as i64,
            heap_bytes: heap.snapshot_bytes(),
            prims: heap.snapshot_prims(),
            signals: header.drain_pending(),
        };
        let required = Resource {
            cores: 0,
            mem_mbs: heap.size_mbs(),
        };

        match self.transfer(&xfer, &required) {
            Ok((mut stream, dest)) => {
                // Signals that raced with the transfer follow as a
                // separate replay frame on the same connection.
                let late = header.drain_pending();
                if !late.is_empty() {
                    let replay = SignalReplay { heap_id: id, signals: late };
                    if let Err(e) = write_frame(&mut stream, KIND_SIGNAL_REPLAY, &replay.encode()) {
                        warn!("heap {id:#x}: signal replay lost: {e}");
                    }
                }
                self.heap_manager.set_route(id, dest.rpc);
                header.set_home(dest.rpc);
                header.set_state(HeapState::Evacuated);
                self.heap_manager.remove(id);
                info!("heap {id:#x}: evacuated to {}", dest.rpc);
                Ok(true)
            }
            Err(e) => {
                // Roll back: deliver locally whatever the transfer would
                // have replayed, then resume as Resident.
                let late = header.drain_pending();
                for sig in xfer.signals.iter().chain(late.iter()) {
                    heap.apply_signal(sig.offset, sig.mode);
                }
                header.set_state(HeapState::Resident);
                Err(e)
            }
        }
    }

    /// Pick a destination and push the transfer record. The round-robin
    /// cursor advances once per call, so consecutive attempts spread
    /// over the peer set.
    fn transfer(&self, xfer: &HeapXfer, required: &Resource) -> io::Result<(TcpStream, Peer)> {
        if self.peers.is_empty() {
            return Err(io::Error::other("no peers configured"));
        }
        let start = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let mut dest = None;
        for i in 0..self.peers.len() {
            let peer = self.peers[(start + i) % self.peers.len()];
            match self.probe(peer) {
                Ok(status) if status.has_enough_resource(required) => {
                    dest = Some(peer);
                    break;
                }
                Ok(status) => {
                    debug!(
                        "peer {} lacks resources ({:?} for {:?})",
                        peer.rpc, status.free_resource, required
                    );
                }
                Err(e) => debug!("peer {} unreachable: {e}", peer.rpc),
            }
        }
        let dest = dest.ok_or_else(|| {
            io::Error::other("no destination with enough free resources")
        })?;

        let mut stream =
            TcpStream::connect_timeout(&dest.loader_addr().socket_addr(), Duration::from_secs(2))?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        write_frame(&mut stream, KIND_HEAP_XFER, &xfer.encode())?;
        let (kind, payload) = read_frame(&mut stream)?;
        match kind {
            KIND_ACK if frame::decode_ack(&payload)? == xfer.heap_id => Ok((stream, dest)),
            KIND_ACK => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ack for wrong heap",
            )),
            KIND_NACK => {
                let (_, reason) = frame::decode_nack(&payload)?;
                Err(io::Error::other(format!(
                    "destination refused transfer (reason {reason})"
                )))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected frame kind {other} awaiting ack"),
            )),
        }
    }

    fn probe(&self, peer: Peer) -> io::Result<NodeStatus> {
        match self.clients.get(&peer.rpc).call(&RpcRequest::Status)? {
            RpcResponse::Status { free } => Ok(NodeStatus {
                free_resource: free,
                addr: peer.rpc,
            }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected status response {other:?}"),
            )),
        }
    }

    // -- inbound --------------------------------------------------------------

    fn run_loader_loop(self: Arc<Self>, listener: TcpListener) {
        let mut conns: Vec<JoinHandle<()>> = Vec::new();
        while !self.stopped.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("loader: connection from {peer}");
                    let this = Arc::clone(&self);
                    match std::thread::Builder::new()
                        .name("proclet-loader-conn".into())
                        .spawn(move || this.do_load(stream))
                    {
                        Ok(h) => conns.push(h),
                        Err(e) => warn!("loader: spawn failed: {e}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => {
                    warn!("loader: accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            conns.retain(|h| !h.is_finished());
        }
        for h in conns {
            let _ = h.join();
        }
    }

    /// Serve one inbound transfer connection until it closes. Malformed
    /// frames drop the connection; they never take the loader down.
    fn do_load(&self, mut stream: TcpStream) {
        loop {
            let (kind, payload) = match frame::read_frame_idle(&mut stream, &self.stopped) {
                Ok(Some(f)) => f,
                Ok(None) => return,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
                Err(e) => {
                    warn!("loader: dropping connection: {e}");
                    return;
                }
            };
            match kind {
                KIND_HEAP_XFER => {
                    let xfer = match HeapXfer::decode(&payload) {
                        Ok(x) => x,
                        Err(e) => {
                            warn!("loader: malformed transfer: {e}");
                            return;
                        }
                    };
                    let heap_id = xfer.heap_id;
                    let resp = match self.load_heap(xfer) {
                        Ok(()) => (KIND_ACK, frame::encode_ack(heap_id)),
                        Err(e) => {
                            warn!("loader: heap {heap_id:#x} rejected: {e}");
                            (KIND_NACK, frame::encode_nack(heap_id, NACK_NO_CAPACITY))
                        }
                    };
                    if write_frame(&mut stream, resp.0, &resp.1).is_err() {
                        return;
                    }
                }
                KIND_SIGNAL_REPLAY => match SignalReplay::decode(&payload) {
                    Ok(replay) => self.apply_replay(replay),
                    Err(e) => {
                        warn!("loader: malformed signal replay: {e}");
                        return;
                    }
                },
                other => {
                    warn!("loader: unexpected frame kind {other}");
                    return;
                }
            }
        }
    }

    fn load_heap(&self, xfer: HeapXfer) -> io::Result<()> {
        if self.heap_manager.contains(xfer.heap_id) {
            // Duplicate of a transfer whose ACK was lost; converge.
            debug!("loader: heap {:#x} already resident", xfer.heap_id);
            return Ok(());
        }
        let offset_us = xfer.offset_us - time::microtime() as i64;
        let heap = ProcletHeap::from_bytes(xfer.heap_id, self.node, xfer.heap_bytes, offset_us);
        for snap in &xfer.prims {
            heap.restore_prim(snap);
        }
        self.heap_manager.adopt(Arc::clone(&heap))?;
        for sig in &xfer.signals {
            heap.apply_signal(sig.offset, sig.mode);
        }
        info!(
            "loader: heap {:#x} resident ({} bytes, {} primitives) from {}",
            heap.id(),
            heap.size_bytes(),
            xfer.prims.len(),
            xfer.src_node_addr
        );
        Ok(())
    }

    fn apply_replay(&self, replay: SignalReplay) {
        match self.heap_manager.get(replay.heap_id) {
            Some(heap) => {
                for sig in replay.signals {
                    heap.apply_signal(sig.offset, sig.mode);
                }
            }
            None => warn!(
                "loader: signal replay for unknown heap {:#x}",
                replay.heap_id
            ),
        }
    }
}

impl Drop for Migrator {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}
