// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Media storage demo: a proclet holding a filename → bytes store as a
// linked record chain inside its heap region, invoked through the
// runtime's dispatcher. Exercises upload, fetch, and survival of the
// store across a (mock-pressure) migration when peers are configured.
//
// Usage: demo_media_store <cfg_file>

use std::sync::Arc;

use proclet::{ProcletHeap, Runtime};

// Methods of the media proclet.
const M_UPLOAD: u32 = 1;
const M_GET: u32 = 2;

// ---------------------------------------------------------------------------
// Record chain inside the heap region
//
// root slot (offset 0, 8 bytes): offset of the newest record, 0 = empty.
// record: [u64 next][u32 klen][u32 vlen][key bytes][value bytes]
// ---------------------------------------------------------------------------

fn store_init(heap: &ProcletHeap) {
    let root = heap.alloc(8);
    assert_eq!(root, 0, "root slot must be the first allocation");
    heap.write_at(root, &0u64.to_le_bytes());
}

fn store_put(heap: &ProcletHeap, key: &[u8], value: &[u8]) {
    let rec = heap.alloc(16 + key.len() + value.len());
    let head = u64::from_le_bytes(heap.read_at(0, 8).try_into().unwrap());
    let mut buf = Vec::with_capacity(16 + key.len() + value.len());
    buf.extend_from_slice(&head.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    heap.write_at(rec, &buf);
    heap.write_at(0, &rec.to_le_bytes());
}

fn store_get(heap: &ProcletHeap, key: &[u8]) -> Option<Vec<u8>> {
    let mut off = u64::from_le_bytes(heap.read_at(0, 8).try_into().unwrap());
    while off != 0 {
        let hdr = heap.read_at(off, 16);
        let next = u64::from_le_bytes(hdr[0..8].try_into().unwrap());
        let klen = u32::from_le_bytes(hdr[8..12].try_into().unwrap()) as usize;
        let vlen = u32::from_le_bytes(hdr[12..16].try_into().unwrap()) as usize;
        if heap.read_at(off + 16, klen) == key {
            return Some(heap.read_at(off + 16 + klen as u64, vlen));
        }
        off = next;
    }
    None
}

fn media_dispatcher(heap: &ProcletHeap, method: u32, payload: &[u8]) -> Vec<u8> {
    match method {
        M_UPLOAD => {
            let klen = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
            let (key, value) = payload[4..].split_at(klen);
            store_put(heap, key, value);
            Vec::new()
        }
        M_GET => {
            // A media lookup is never expected to miss.
            store_get(heap, payload)
                .unwrap_or_else(|| panic!("media {:?} not present", String::from_utf8_lossy(payload)))
        }
        other => panic!("unknown media method {other}"),
    }
}

fn upload(rt: &Runtime, heap_id: u64, name: &str, data: &[u8]) {
    let mut payload = Vec::with_capacity(4 + name.len() + data.len());
    payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.extend_from_slice(data);
    rt.invoke(heap_id, M_UPLOAD, &payload).expect("upload");
}

fn get(rt: &Runtime, heap_id: u64, name: &str) -> Vec<u8> {
    rt.invoke(heap_id, M_GET, name.as_bytes()).expect("get")
}

fn main() {
    let Some(cfg_path) = std::env::args().nth(1) else {
        eprintln!("usage: demo_media_store <cfg_file>");
        std::process::exit(libc::EINVAL);
    };

    let rt = match Runtime::init_from_config_file(&cfg_path) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime init failed: {e}");
            std::process::exit(1);
        }
    };
    rt.set_dispatcher(Arc::new(media_dispatcher));

    let heap = rt.create_proclet().expect("create media proclet");
    store_init(&heap);
    let heap_id = heap.id();
    drop(heap);

    upload(&rt, heap_id, "a.jpg", b"BYTES_A");
    upload(&rt, heap_id, "b.jpg", b"BYTES_B");
    println!("a.jpg -> {}", String::from_utf8_lossy(&get(&rt, heap_id, "a.jpg")));
    println!("b.jpg -> {}", String::from_utf8_lossy(&get(&rt, heap_id, "b.jpg")));

    println!(
        "node {} holds {} heap(s); free {:?}",
        rt.node(),
        rt.heap_manager().num_heaps(),
        rt.node_status().free_resource
    );
    rt.shutdown();
}
