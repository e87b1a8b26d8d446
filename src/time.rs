// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Monotonic microsecond clock. Heaps layer a logical offset on top (see
// HeapHeader::microtime) so proclet-visible time stays continuous across
// migrations between nodes with disagreeing clocks.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Microseconds since process start. Monotonic.
pub fn microtime() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// Sleep for `us` microseconds of physical time.
pub fn sleep_us(us: u64) {
    std::thread::sleep(Duration::from_micros(us));
}
