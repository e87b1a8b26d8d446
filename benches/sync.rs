// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synchronization primitive benchmarks.
//
// Run with:
//   cargo bench --bench sync
//
// Groups:
//   spin_lock    — raw spin lock acquire/release
//   proclet_mutex — uncontended heap mutex through the registry path
//   rcu_reader   — RCU read-side critical section
//   parted_set   — partitioned hash set put/contains/remove

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use proclet::{NodeAddr, PartitionedSpinHashSet, ProcletHeap, RcuLock, SpinLock};

fn bench_addr() -> NodeAddr {
    NodeAddr::new(std::net::Ipv4Addr::LOCALHOST, 1)
}

fn bench_spin_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("spin_lock");
    group.throughput(Throughput::Elements(1));

    group.bench_function("lock_unlock", |b| {
        let lock = SpinLock::new(0u64);
        b.iter(|| {
            let mut g = lock.lock();
            *g += 1;
            black_box(*g);
        });
    });

    group.finish();
}

fn bench_proclet_mutex(c: &mut Criterion) {
    let mut group = c.benchmark_group("proclet_mutex");
    group.throughput(Throughput::Elements(1));

    // Identity-resolved through the global heap registry on every
    // operation, so this measures the full handle path.
    group.bench_function("uncontended_lock_unlock", |b| {
        let heap = ProcletHeap::new(0x51c0_0001, bench_addr());
        let m = heap.new_mutex();
        b.iter(|| {
            m.lock();
            m.unlock();
        });
    });

    group.bench_function("try_lock", |b| {
        let heap = ProcletHeap::new(0x51c0_0002, bench_addr());
        let m = heap.new_mutex();
        b.iter(|| {
            assert!(m.try_lock());
            m.unlock();
        });
    });

    group.finish();
}

fn bench_rcu_reader(c: &mut Criterion) {
    let mut group = c.benchmark_group("rcu_reader");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reader_lock_unlock", |b| {
        let rcu = RcuLock::new();
        b.iter(|| {
            let g = rcu.reader_lock();
            black_box(&g);
        });
    });

    group.finish();
}

fn bench_parted_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("parted_set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_contains_remove", |b| {
        let set: PartitionedSpinHashSet<u64> = PartitionedSpinHashSet::new();
        let mut k = 0u64;
        b.iter(|| {
            k = k.wrapping_add(1);
            set.put(k);
            black_box(set.contains(&k));
            set.remove(&k);
        });
    });

    group.bench_function("contains_hot", |b| {
        let set: PartitionedSpinHashSet<u64> = PartitionedSpinHashSet::new();
        for k in 0..1024u64 {
            set.put(k);
        }
        let mut k = 0u64;
        b.iter(|| {
            k = (k + 1) & 1023;
            black_box(set.contains(&k));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_spin_lock,
    bench_proclet_mutex,
    bench_rcu_reader,
    bench_parted_set,
);

criterion_main!(benches);
