// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Framed wire codec. Every message on the loader and RPC sockets is
//
//   Frame ::= u32 len | u8 kind | payload[len]
//
// with all integers little-endian. Loader kinds: HEAP_XFER carries the
// heap bytes plus the primitive/waiter sidecar; ACK/NACK close the
// transfer; SIGNAL_REPLAY forwards signals that raced with it.

use std::io::{self, Read, Write};

use crate::heap::{NodeAddr, PendingSignal, PrimKind, PrimSnapshot, SignalMode};
use crate::waiter::WaiterToken;

pub const KIND_HEAP_XFER: u8 = 1;
pub const KIND_ACK: u8 = 2;
pub const KIND_NACK: u8 = 3;
pub const KIND_SIGNAL_REPLAY: u8 = 4;

/// NACK reason: destination cannot take the heap.
pub const NACK_NO_CAPACITY: u32 = 1;

/// Refuse frames larger than this; a bigger length prefix is a protocol
/// error, not an allocation request.
const MAX_PAYLOAD: usize = 1 << 30;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub fn write_frame(w: &mut impl Write, kind: u8, payload: &[u8]) -> io::Result<()> {
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&[kind])?;
    w.write_all(payload)?;
    w.flush()
}

/// Wait for a frame on an idle connection without consuming bytes on
/// timeout: peeks until data is available (polling `stopped`), then
/// reads the whole frame. Returns `None` on stop or peer close.
pub fn read_frame_idle(
    stream: &mut std::net::TcpStream,
    stopped: &std::sync::atomic::AtomicBool,
) -> io::Result<Option<(u8, Vec<u8>)>> {
    stream.set_read_timeout(Some(std::time::Duration::from_millis(50)))?;
    let mut probe = [0u8; 1];
    loop {
        if stopped.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(None);
        }
        match stream.peek(&mut probe) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }
    // Data is pending; the rest of the frame should follow promptly.
    stream.set_read_timeout(Some(std::time::Duration::from_secs(5)))?;
    read_frame(stream).map(Some)
}

pub fn read_frame(r: &mut impl Read) -> io::Result<(u8, Vec<u8>)> {
    let mut head = [0u8; 5];
    r.read_exact(&mut head)?;
    let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok((head[4], payload))
}

// ---------------------------------------------------------------------------
// Payload codec helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "truncated payload")
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        if end > self.buf.len() {
            return Err(truncated());
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bytes(&mut self, n: usize) -> io::Result<&'a [u8]> {
        self.take(n)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// HEAP_XFER
// ---------------------------------------------------------------------------

/// The transfer record for one migrating heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapXfer {
    pub heap_id: u64,
    pub src_node_addr: NodeAddr,
    pub offset_us: i64,
    pub heap_bytes: Vec<u8>,
    pub prims: Vec<PrimSnapshot>,
    pub signals: Vec<PendingSignal>,
}

impl HeapXfer {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u64(self.heap_id);
        e.put_u64(self.src_node_addr.raw());
        e.put_u64(self.offset_us as u64);
        e.put_u64(self.heap_bytes.len() as u64);
        e.put_bytes(&self.heap_bytes);
        e.put_u32(self.prims.len() as u32);
        for p in &self.prims {
            e.put_u8(p.kind as u8);
            e.put_u64(p.offset);
            e.put_u32(p.waiters.len() as u32);
            for &t in &p.waiters {
                e.put_u64(t);
            }
        }
        e.put_u32(self.signals.len() as u32);
        for s in &self.signals {
            e.put_u64(s.offset);
            e.put_u8(s.mode as u8);
        }
        e.finish()
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut d = Decoder::new(payload);
        let heap_id = d.u64()?;
        let src_node_addr = NodeAddr::from_raw(d.u64()?);
        let offset_us = d.u64()? as i64;
        let heap_size = d.u64()? as usize;
        let heap_bytes = d.bytes(heap_size)?.to_vec();
        let n_prims = d.u32()?;
        let mut prims = Vec::with_capacity(n_prims as usize);
        for _ in 0..n_prims {
            let kind = PrimKind::from_u8(d.u8()?)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad primitive kind"))?;
            let offset = d.u64()?;
            let n_waiters = d.u32()?;
            let mut waiters: Vec<WaiterToken> = Vec::with_capacity(n_waiters as usize);
            for _ in 0..n_waiters {
                waiters.push(d.u64()?);
            }
            prims.push(PrimSnapshot { kind, offset, waiters });
        }
        let signals = decode_signals(&mut d)?;
        if !d.done() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes in HEAP_XFER",
            ));
        }
        Ok(Self {
            heap_id,
            src_node_addr,
            offset_us,
            heap_bytes,
            prims,
            signals,
        })
    }
}

// ---------------------------------------------------------------------------
// ACK / NACK
// ---------------------------------------------------------------------------

pub fn encode_ack(heap_id: u64) -> Vec<u8> {
    heap_id.to_le_bytes().to_vec()
}

pub fn decode_ack(payload: &[u8]) -> io::Result<u64> {
    Decoder::new(payload).u64()
}

pub fn encode_nack(heap_id: u64, reason: u32) -> Vec<u8> {
    let mut e = Encoder::new();
    e.put_u64(heap_id);
    e.put_u32(reason);
    e.finish()
}

pub fn decode_nack(payload: &[u8]) -> io::Result<(u64, u32)> {
    let mut d = Decoder::new(payload);
    Ok((d.u64()?, d.u32()?))
}

// ---------------------------------------------------------------------------
// SIGNAL_REPLAY
// ---------------------------------------------------------------------------

/// Signals that raced with a transfer, applied after rehydration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalReplay {
    pub heap_id: u64,
    pub signals: Vec<PendingSignal>,
}

impl SignalReplay {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u64(self.heap_id);
        e.put_u32(self.signals.len() as u32);
        for s in &self.signals {
            e.put_u64(s.offset);
            e.put_u8(s.mode as u8);
        }
        e.finish()
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut d = Decoder::new(payload);
        let heap_id = d.u64()?;
        let signals = decode_signals(&mut d)?;
        Ok(Self { heap_id, signals })
    }
}

fn decode_signals(d: &mut Decoder<'_>) -> io::Result<Vec<PendingSignal>> {
    let n = d.u32()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let offset = d.u64()?;
        let mode = SignalMode::from_u8(d.u8()?)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad signal mode"))?;
        out.push(PendingSignal { offset, mode });
    }
    Ok(out)
}
