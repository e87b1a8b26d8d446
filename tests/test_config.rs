// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Runtime configuration parsing tests.

use std::io::ErrorKind;

use proclet::RuntimeConfig;

#[test]
fn minimal_config() {
    let cfg = RuntimeConfig::parse(
        r#"
        [node]
        addr = "127.0.0.1:9000"
        loader_port = 9001
        "#,
    )
    .expect("parse");
    assert_eq!(cfg.node.loader_port, 9001);
    assert_eq!(cfg.node_addr().unwrap().port(), 9000);
    assert!(cfg.peers.is_empty());
    assert_eq!(cfg.monitor.poll_interval_us, 100_000);
    assert_eq!(cfg.monitor.reserve_mem_mbs, 0);
}

#[test]
fn full_config() {
    let cfg = RuntimeConfig::parse(
        r#"
        [node]
        addr = "10.0.0.1:9000"
        loader_port = 9001

        [[peers]]
        addr = "10.0.0.2:9000"
        loader_port = 9001

        [[peers]]
        addr = "10.0.0.3:9000"
        loader_port = 9101

        [monitor]
        poll_interval_us = 50000
        reserve_mem_mbs = 512
        "#,
    )
    .expect("parse");
    let peers = cfg.peer_addrs().unwrap();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[1].1, 9101);
    assert_eq!(cfg.monitor.poll_interval_us, 50_000);
    assert_eq!(cfg.monitor.reserve_mem_mbs, 512);
}

#[test]
fn missing_node_section_rejected() {
    let err = RuntimeConfig::parse("[monitor]\npoll_interval_us = 1\n").expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn unknown_key_rejected() {
    let err = RuntimeConfig::parse(
        r#"
        [node]
        addr = "127.0.0.1:9000"
        loader_port = 9001
        frobnicate = true
        "#,
    )
    .expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn bad_addr_rejected() {
    let err = RuntimeConfig::parse(
        r#"
        [node]
        addr = "not-an-addr"
        loader_port = 9001
        "#,
    )
    .expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn missing_file_is_not_found() {
    let err = RuntimeConfig::load("/nonexistent/proclet.toml").expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
