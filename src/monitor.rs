// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pressure monitor: the one entity that initiates migrations.
//
// A single background task wakes every poll interval, reads the pressure
// signal (mock first, then the real probe), asks the heap manager for
// victims and hands them to the migrator. The loop runs while not
// stopped and observes the stop flag at each tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::heap_manager::HeapManager;
use crate::proto::migrator::Migrator;
use crate::spin_lock::SpinLock;

/// A shortage signal. Zeroed means no pressure.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Pressure {
    pub cpu_pressure: bool,
    pub mem_mbs_to_release: u32,
}

impl Pressure {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        !self.cpu_pressure && self.mem_mbs_to_release == 0
    }
}

pub struct Monitor {
    stopped: AtomicBool,
    poll_interval: Duration,
    reserve_mem_mbs: u32,
    mock_pressure: SpinLock<Option<Pressure>>,
    heap_manager: Arc<HeapManager>,
    migrator: Arc<Migrator>,
    handle: SpinLock<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        heap_manager: Arc<HeapManager>,
        migrator: Arc<Migrator>,
        poll_interval_us: u64,
        reserve_mem_mbs: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            stopped: AtomicBool::new(false),
            poll_interval: Duration::from_micros(poll_interval_us),
            reserve_mem_mbs,
            mock_pressure: SpinLock::new(None),
            heap_manager,
            migrator,
            handle: SpinLock::new(None),
        })
    }

    /// Start the poll loop on a background thread.
    pub fn run_loop_async(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("proclet-monitor".into())
            .spawn(move || this.run_loop())
            .expect("spawn monitor thread");
        *self.handle.lock() = Some(handle);
    }

    fn run_loop(&self) {
        while !self.stopped.load(Ordering::Acquire) {
            self.sleep_tick();
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let pressure = self.detect_pressure();
            if pressure.is_none() {
                continue;
            }
            let victims = self.heap_manager.pick_heaps(&pressure);
            if victims.is_empty() {
                debug!("pressure {pressure:?} but no eligible heap");
                continue;
            }
            info!("pressure {pressure:?}: migrating {} heap(s)", victims.len());
            if let Err(e) = self.migrator.migrate(victims) {
                warn!("migration pass failed: {e}");
            }
        }
    }

    /// Sleep one poll interval, in slices so `stop` is honored promptly.
    fn sleep_tick(&self) {
        let mut remaining = self.poll_interval;
        while !remaining.is_zero() && !self.stopped.load(Ordering::Acquire) {
            let step = remaining.min(Duration::from_millis(20));
            std::thread::sleep(step);
            remaining -= step;
        }
    }

    /// Override the next pressure reading. One-shot; tests only.
    pub fn mock_set_pressure(&self, pressure: Pressure) {
        *self.mock_pressure.lock() = Some(pressure);
    }

    /// The mock reading when set, otherwise the real probe: memory
    /// pressure is the deficit against the configured reserve. CPU
    /// pressure has no portable probe and only arrives via the mock.
    pub fn detect_pressure(&self) -> Pressure {
        if let Some(p) = self.mock_pressure.lock().take() {
            return p;
        }
        if self.reserve_mem_mbs == 0 {
            return Pressure::none();
        }
        let free = self.heap_manager.free_resource();
        if free.mem_mbs < self.reserve_mem_mbs {
            return Pressure {
                cpu_pressure: false,
                mem_mbs_to_release: self.reserve_mem_mbs - free.mem_mbs,
            };
        }
        Pressure::none()
    }

    /// Stop the loop. The running tick finishes first.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}
