//! Benchmarks for the redb-backed OR-Set store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use orkv_crdt::{CollisionPolicy, TsValue};
use orkv_storage::{Store, StoreOptions};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Store {
    Store::open(&dir.path().join("bench.db"), &StoreOptions::default()).unwrap()
}

fn bench_store_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_add");

    for size in [64, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = open(&dir);

            let mut i = 0u64;
            b.iter(|| {
                let key = format!("key_{}", i);
                store.add(&key, &TsValue::new(vec![0x42u8; size], "")).unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_store_load(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    // Pre-populate 1000 keys, a few observations each
    for i in 0..1000 {
        for _ in 0..3 {
            store
                .add(&format!("key_{:04}", i), &TsValue::new(vec![0x42u8; 256], ""))
                .unwrap();
        }
    }

    let mut group = c.benchmark_group("store_load");
    for policy in [CollisionPolicy::None, CollisionPolicy::LastWriteWins] {
        group.bench_with_input(
            BenchmarkId::from_parameter(policy),
            &policy,
            |b, &policy| {
                let mut i = 0u64;
                b.iter(|| {
                    let key = format!("key_{:04}", i % 1000);
                    black_box(store.load(&key, policy).unwrap());
                    i += 1;
                });
            },
        );
    }
    group.finish();
}

fn bench_store_remove(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    c.bench_function("store_add_remove", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key_{}", i);
            store.add(&key, &TsValue::new(vec![0x42u8; 128], "")).unwrap();
            black_box(store.remove(&key).unwrap());
            i += 1;
        });
    });
}

fn bench_oplog_scan(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    for i in 0..2000 {
        store
            .append_op(&format!("{:020}.ADD.k", i), &[0x42u8; 128])
            .unwrap();
    }

    c.bench_function("oplog_scan_2000", |b| {
        b.iter(|| black_box(store.read_ops_from("").count()));
    });
}

criterion_group!(
    benches,
    bench_store_add,
    bench_store_load,
    bench_store_remove,
    bench_oplog_scan
);
criterion_main!(benches);
