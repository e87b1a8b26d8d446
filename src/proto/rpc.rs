// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RPC plumbing: a keyed pool of persistent clients, and the per-node
// server loop that dispatches invocations to resident heaps.
//
// The pool is the stable invocation path across migrations: proclets
// move, nodes do not, so a client is created at most once per key and is
// never evicted. Callers that reach a node the heap has left get a
// NOT_HERE redirect carrying the node's route-table entry.

use std::hash::Hash;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::heap::{HeapId, NodeAddr};
use crate::heap_manager::Resource;
use crate::parted_hash::PartitionedSpinHashMap;
use crate::proto::frame::{read_frame, write_frame, Decoder, Encoder};
use crate::spin_lock::SpinLock;

// Request kinds.
pub const RPC_INVOKE: u8 = 1;
pub const RPC_STATUS: u8 = 2;
pub const RPC_DESTROY: u8 = 3;

// Response kinds.
pub const RPC_REPLY: u8 = 1;
pub const RPC_NOT_HERE: u8 = 2;
pub const RPC_STATUS_REPLY: u8 = 3;
pub const RPC_ERR: u8 = 4;

/// Error reasons carried by `RpcResponse::Err`.
pub const ERR_NO_DISPATCHER: u32 = 1;
pub const ERR_BAD_REQUEST: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcRequest {
    Invoke {
        heap_id: HeapId,
        method: u32,
        payload: Vec<u8>,
    },
    Status,
    Destroy {
        heap_id: HeapId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcResponse {
    Reply(Vec<u8>),
    /// The heap is not resident here; `new_home` is the responder's best
    /// route-table guess.
    NotHere { new_home: Option<NodeAddr> },
    Status { free: Resource },
    Err(u32),
}

impl RpcRequest {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Self::Invoke { heap_id, method, payload } => {
                let mut e = Encoder::new();
                e.put_u64(*heap_id);
                e.put_u32(*method);
                e.put_bytes(payload);
                write_frame(w, RPC_INVOKE, &e.finish())
            }
            Self::Status => write_frame(w, RPC_STATUS, &[]),
            Self::Destroy { heap_id } => write_frame(w, RPC_DESTROY, &heap_id.to_le_bytes()),
        }
    }

    fn decode(kind: u8, payload: &[u8]) -> io::Result<Self> {
        let mut d = Decoder::new(payload);
        match kind {
            RPC_INVOKE => Ok(Self::Invoke {
                heap_id: d.u64()?,
                method: d.u32()?,
                payload: d.rest().to_vec(),
            }),
            RPC_STATUS => Ok(Self::Status),
            RPC_DESTROY => Ok(Self::Destroy { heap_id: d.u64()? }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown rpc request kind {other}"),
            )),
        }
    }
}

impl RpcResponse {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Self::Reply(payload) => write_frame(w, RPC_REPLY, payload),
            Self::NotHere { new_home } => {
                let raw = new_home.map_or(0, |a| a.raw());
                write_frame(w, RPC_NOT_HERE, &raw.to_le_bytes())
            }
            Self::Status { free } => {
                let mut e = Encoder::new();
                e.put_u32(free.cores);
                e.put_u32(free.mem_mbs);
                write_frame(w, RPC_STATUS_REPLY, &e.finish())
            }
            Self::Err(reason) => write_frame(w, RPC_ERR, &reason.to_le_bytes()),
        }
    }

    fn decode(kind: u8, payload: &[u8]) -> io::Result<Self> {
        let mut d = Decoder::new(payload);
        match kind {
            RPC_REPLY => Ok(Self::Reply(d.rest().to_vec())),
            RPC_NOT_HERE => {
                let raw = d.u64()?;
                Ok(Self::NotHere {
                    new_home: (raw != 0).then(|| NodeAddr::from_raw(raw)),
                })
            }
            RPC_STATUS_REPLY => Ok(Self::Status {
                free: Resource { cores: d.u32()?, mem_mbs: d.u32()? },
            }),
            RPC_ERR => Ok(Self::Err(d.u32()?)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown rpc response kind {other}"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// A persistent connection to one node's RPC endpoint. Connects lazily;
/// a transport error drops the connection so the next call redials.
pub struct RpcClient {
    addr: NodeAddr,
    conn: SpinLock<Option<TcpStream>>,
}

impl RpcClient {
    pub fn new(addr: NodeAddr) -> Self {
        Self {
            addr,
            conn: SpinLock::new(None),
        }
    }

    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    /// Issue one request/response round trip.
    pub fn call(&self, req: &RpcRequest) -> io::Result<RpcResponse> {
        let mut conn = self.conn.lock();
        if conn.is_none() {
            let stream = TcpStream::connect(self.addr.socket_addr())?;
            stream.set_read_timeout(Some(Duration::from_secs(5)))?;
            stream.set_write_timeout(Some(Duration::from_secs(5)))?;
            *conn = Some(stream);
        }
        let stream = conn.as_mut().expect("connection just established");
        let result = Self::round_trip(stream, req);
        if result.is_err() {
            *conn = None;
        }
        result
    }

    fn round_trip(stream: &mut TcpStream, req: &RpcRequest) -> io::Result<RpcResponse> {
        req.write_to(stream)?;
        let (kind, payload) = read_frame(stream)?;
        RpcResponse::decode(kind, &payload)
    }
}

// ---------------------------------------------------------------------------
// RpcClientMgr
// ---------------------------------------------------------------------------

/// Lazy, keyed pool of RPC clients built by a caller-supplied factory.
///
/// `get` returns the one client for a key: concurrent first calls race
/// on the partition lock and every loser receives the winner's client.
/// Clients live for the node's lifetime.
pub struct RpcClientMgr<K, C = RpcClient> {
    clients: PartitionedSpinHashMap<K, Arc<C>>,
    creator: Box<dyn Fn(&K) -> C + Send + Sync>,
}

impl<K: Hash + Eq + Clone, C> RpcClientMgr<K, C> {
    pub fn new(creator: impl Fn(&K) -> C + Send + Sync + 'static) -> Self {
        Self {
            clients: PartitionedSpinHashMap::new(),
            creator: Box::new(creator),
        }
    }

    /// The client for `k`, constructed on first use.
    pub fn get(&self, k: &K) -> Arc<C> {
        self.clients
            .get_or_insert_with(k, || Arc::new((self.creator)(k)))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RpcServer
// ---------------------------------------------------------------------------

pub type RpcHandler = Arc<dyn Fn(RpcRequest) -> RpcResponse + Send + Sync>;

/// Per-node RPC accept loop. One handler thread per connection; all
/// loops poll the shared stop flag.
pub struct RpcServer {
    local_addr: NodeAddr,
    stopped: Arc<AtomicBool>,
    accept_handle: SpinLock<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind `addr` and start serving `handler`.
    pub fn start(addr: NodeAddr, handler: RpcHandler) -> io::Result<Self> {
        let listener = TcpListener::bind(addr.socket_addr())?;
        listener.set_nonblocking(true)?;
        let bound = match listener.local_addr()? {
            std::net::SocketAddr::V4(sa) => NodeAddr::new(*sa.ip(), sa.port()),
            std::net::SocketAddr::V6(_) => {
                return Err(io::Error::other("rpc server requires an IPv4 endpoint"))
            }
        };
        let stopped = Arc::new(AtomicBool::new(false));
        let accept_stopped = Arc::clone(&stopped);
        let accept_handle = std::thread::Builder::new()
            .name("proclet-rpc".into())
            .spawn(move || accept_loop(listener, handler, accept_stopped))
            .expect("spawn rpc accept thread");
        Ok(Self {
            local_addr: bound,
            stopped,
            accept_handle: SpinLock::new(Some(accept_handle)),
        })
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, handler: RpcHandler, stopped: Arc<AtomicBool>) {
    let mut conns: Vec<JoinHandle<()>> = Vec::new();
    while !stopped.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("rpc: connection from {peer}");
                let handler = Arc::clone(&handler);
                let stopped = Arc::clone(&stopped);
                match std::thread::Builder::new()
                    .name("proclet-rpc-conn".into())
                    .spawn(move || serve_conn(stream, handler, stopped))
                {
                    Ok(h) => conns.push(h),
                    Err(e) => warn!("rpc: spawn failed: {e}"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => {
                warn!("rpc: accept failed: {e}");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        conns.retain(|h| !h.is_finished());
    }
    for h in conns {
        let _ = h.join();
    }
}

fn serve_conn(mut stream: TcpStream, handler: RpcHandler, stopped: Arc<AtomicBool>) {
    loop {
        let (kind, payload) = match crate::proto::frame::read_frame_idle(&mut stream, &stopped) {
            Ok(Some(f)) => f,
            Ok(None) => return,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                debug!("rpc: dropping connection: {e}");
                return;
            }
        };
        let resp = match RpcRequest::decode(kind, &payload) {
            Ok(req) => handler(req),
            Err(e) => {
                warn!("rpc: malformed request: {e}");
                RpcResponse::Err(ERR_BAD_REQUEST)
            }
        };
        if resp.write_to(&mut stream).is_err() {
            return;
        }
    }
}
