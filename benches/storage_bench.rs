use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use geostore::storage::lsm::force_major_compaction;
use geostore::{Hyperrectangle, StoreConfig, Tuple, TupleStoreConfiguration, TupleStoreManager, TupleStoreName};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> (Arc<TupleStoreManager>, StoreConfig) {
    let config = StoreConfig::for_testing(dir.path());
    let name = TupleStoreName::new("bench", "points").unwrap().with_region(0);
    let store = TupleStoreManager::open(dir.path(), name, TupleStoreConfiguration::default(), &config).unwrap();
    (store, config)
}

fn tuple(i: u64) -> Tuple {
    let x = (i % 1000) as f64;
    Tuple::with_version(
        format!("key_{:08}", i),
        Hyperrectangle::from_bounds(&[x, x + 1.0, x, x + 1.0]).unwrap(),
        vec![0u8; 128],
        i as i64,
    )
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    group.measurement_time(Duration::from_secs(10));

    for count in &[1_000u64, 10_000] {
        group.throughput(Throughput::Elements(*count));
        group.bench_function(format!("{}_tuples", count), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let (store, _) = open_store(&dir);
                    for i in 0..*count {
                        store.put_with(tuple(i), true, true).unwrap();
                    }
                    (dir, store)
                },
                |(_dir, store)| store.flush().unwrap(),
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

fn bench_major_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("major_compaction");
    group.measurement_time(Duration::from_secs(10));

    for runs in &[4u64, 16] {
        group.throughput(Throughput::Elements(runs * 500));
        group.bench_function(format!("{}_runs", runs), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let (store, config) = open_store(&dir);
                    for run in 0..*runs {
                        for i in 0..500 {
                            store.put_with(tuple(run * 500 + i), true, true).unwrap();
                        }
                        store.flush().unwrap();
                    }
                    (dir, store, config)
                },
                |(_dir, store, config)| force_major_compaction(&store, config.max_sstable_size).unwrap(),
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

fn bench_point_lookup(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (store, config) = open_store(&dir);
    for i in 0..5_000 {
        store.put_with(tuple(i), true, true).unwrap();
    }
    store.flush().unwrap();
    force_major_compaction(&store, config.max_sstable_size).unwrap();

    let mut i = 0u64;
    c.bench_function("get_after_compaction", |b| {
        b.iter(|| {
            i = (i + 7919) % 5_000;
            black_box(store.get(black_box(&format!("key_{:08}", i))).unwrap());
        });
    });
}

criterion_group!(benches, bench_flush, bench_major_compaction, bench_point_lookup);
criterion_main!(benches);
