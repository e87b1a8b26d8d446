// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire protocol layer: frame codec, RPC client/server, and the migrator
// that moves heaps between nodes.

pub mod frame;
pub mod migrator;
pub mod rpc;

pub use frame::{HeapXfer, SignalReplay};
pub use migrator::Migrator;
pub use rpc::{RpcClient, RpcClientMgr, RpcRequest, RpcResponse, RpcServer};
