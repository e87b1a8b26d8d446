// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pressure monitor tests: mock override, real-probe deficit, stop flag.

use proclet::config::{MonitorConfig, NodeConfig, RuntimeConfig};
use proclet::{Pressure, Resource, Runtime};

fn mk_idle_runtime(reserve_mem_mbs: u32) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::init(RuntimeConfig {
        node: NodeConfig { addr: "127.0.0.1:0".into(), loader_port: 0 },
        peers: Vec::new(),
        // Poll far in the future so tests own detect_pressure.
        monitor: MonitorConfig { poll_interval_us: 3_600_000_000, reserve_mem_mbs },
    })
    .expect("runtime init")
}

#[test]
fn no_pressure_by_default() {
    let rt = mk_idle_runtime(0);
    assert!(rt.monitor().detect_pressure().is_none());
    rt.shutdown();
}

#[test]
fn mock_pressure_is_one_shot() {
    let rt = mk_idle_runtime(0);
    let p = Pressure { cpu_pressure: true, mem_mbs_to_release: 123 };

    rt.monitor().mock_set_pressure(p);
    assert_eq!(rt.monitor().detect_pressure(), p);
    // Consumed: the next tick sees the real signal again.
    assert!(rt.monitor().detect_pressure().is_none());
    rt.shutdown();
}

#[test]
fn real_probe_reports_deficit_against_reserve() {
    let rt = mk_idle_runtime(1000);
    rt.heap_manager()
        .mock_set_free_resource(Some(Resource { cores: 8, mem_mbs: 400 }));

    let p = rt.monitor().detect_pressure();
    assert!(!p.cpu_pressure);
    assert_eq!(p.mem_mbs_to_release, 600);

    // Enough headroom: silent.
    rt.heap_manager()
        .mock_set_free_resource(Some(Resource { cores: 8, mem_mbs: 4000 }));
    assert!(rt.monitor().detect_pressure().is_none());
    rt.shutdown();
}

#[test]
fn stop_halts_the_loop() {
    let rt = mk_idle_runtime(0);
    assert!(!rt.monitor().is_stopped());
    rt.monitor().stop();
    assert!(rt.monitor().is_stopped());
    // Idempotent, and shutdown tolerates an already-stopped monitor.
    rt.monitor().stop();
    rt.shutdown();
}
