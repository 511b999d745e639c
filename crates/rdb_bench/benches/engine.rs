//! Engine benchmarks: point operations, scans and rebuild.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdb_bench::{key, random_data};
use rdb_core::{Config, Database};
use rdb_storage::{FileBackend, StorageBackend};
use tempfile::TempDir;

const KEYS: usize = 10_000;

fn bench_config() -> Config {
    Config::default()
        .hash_table_size(20_000)
        .arena_limit(16 << 20)
        .sync_data_file(false)
        .sync_index_file(false)
}

fn populated(value_size: usize) -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = Database::open_with_config(dir.path(), "bench", bench_config()).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    for i in 0..KEYS {
        db.set(&key(i), &random_data(&mut rng, value_size)).unwrap();
    }
    (dir, db)
}

/// Benchmark inserts of fresh keys.
fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");

    for size in [16, 256, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let db = Database::open_with_config(dir.path(), "bench", bench_config()).unwrap();
            let value = vec![0xABu8; size];
            let mut i = 0usize;

            b.iter(|| {
                db.set(black_box(&key(i % KEYS)), black_box(&value)).unwrap();
                i += 1;
            });
        });
    }

    group.finish();
}

/// Benchmark lookups of present and absent keys.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let (_dir, db) = populated(256);
    let mut rng = StdRng::seed_from_u64(11);

    group.bench_function("hit", |b| {
        b.iter(|| {
            let value = db.get(black_box(&key(rng.gen_range(0..KEYS)))).unwrap();
            black_box(value);
        });
    });

    group.bench_function("miss", |b| {
        b.iter(|| {
            let value = db.get(black_box(b"absent-key")).unwrap();
            black_box(value);
        });
    });

    group.finish();
}

/// Benchmark remove followed by reinsert, which cycles pages through the
/// free lists.
fn bench_remove_reinsert(c: &mut Criterion) {
    let (_dir, db) = populated(64);
    let value = vec![1u8; 64];
    let mut i = 0usize;

    c.bench_function("remove_reinsert", |b| {
        b.iter(|| {
            let k = key(i % KEYS);
            db.remove(&k).unwrap();
            db.set(&k, &value).unwrap();
            i += 1;
        });
    });
}

/// Benchmark a full scan.
fn bench_scan(c: &mut Criterion) {
    let (_dir, db) = populated(64);
    let mut group = c.benchmark_group("scan");
    group.sample_size(20);
    group.throughput(Throughput::Elements(KEYS as u64));
    group.bench_function("all", |b| {
        b.iter(|| black_box(db.scan().unwrap().len()));
    });
    group.finish();
}

/// Benchmark rebuild of a populated database.
fn bench_rebuild(c: &mut Criterion) {
    let (_dir, db) = populated(128);
    let mut group = c.benchmark_group("rebuild");
    group.sample_size(10);
    group.bench_function("10k", |b| {
        b.iter(|| black_box(db.rebuild().unwrap()));
    });
    group.finish();
}

/// Baseline: raw positional page writes through the file backend.
fn bench_file_page_write(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut backend = FileBackend::open(&dir.path().join("pages.db")).unwrap();
    let page = vec![0u8; 256];
    let mut i = 0u64;

    c.bench_function("file_page_write", |b| {
        b.iter(|| {
            backend.write_at(black_box((i % 1024) * 256), &page).unwrap();
            i += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_remove_reinsert,
    bench_scan,
    bench_rebuild,
    bench_file_page_write
);
criterion_main!(benches);
