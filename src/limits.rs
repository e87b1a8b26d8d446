// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Resource limits shared across the runtime.

/// Cache line size assumed for alignment of striped counters and locks.
pub const CACHE_LINE_BYTES: usize = 64;

/// Upper bound on reader stripes in an `RcuLock` (one per CPU).
pub const NCPU: usize = 256;

/// Maximum number of proclet heaps resident on one node.
pub const MAX_NUM_HEAPS: usize = 2048;

/// A migration destination must keep at least this many free cores.
pub const MIN_NUM_CORES: u32 = 2;

/// Under CPU pressure, victims are picked until their active threads
/// cover at least this many cores.
pub const MIN_CORES_TO_SHED: u32 = 2;
