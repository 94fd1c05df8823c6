//! Benchmarks for braidstore framing and projection
//!
//! Run with: cargo bench -p braidstore-core
//!
//! These benchmarks establish performance baselines for:
//! - Splitting and reassembling messages
//! - Appending operations to a local writer log
//! - Rebuilding an index from writer logs

use std::time::Duration;

use braidstore_core::{
    CoreTxn, IndexReader, Merger, Protocol, ProtocolSet, Splitter, Store, StoreConfig, StoreResult,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum BenchOp {
    Set { key: String, value: String },
}

struct BenchKv;

impl Protocol for BenchKv {
    type Op = BenchOp;

    fn name(&self) -> &str {
        "kv"
    }

    fn apply(&self, op: BenchOp, core: &CoreTxn<'_>, _index: &IndexReader<'_>) -> StoreResult<()> {
        match op {
            BenchOp::Set { key, value } => core.put(&key, value),
        }
    }
}

fn open_store(runtime: &tokio::runtime::Runtime, dir: &TempDir) -> Store {
    let config = StoreConfig::new("bench", dir.path()).with_live(false);
    runtime
        .block_on(Store::open(config, ProtocolSet::new().with(BenchKv)))
        .unwrap()
}

// ============================================================================
// Framing Benchmarks
// ============================================================================

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let message = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("split", size), &message, |b, message| {
            let mut splitter = Splitter::new(16 * 1024);
            b.iter(|| black_box(splitter.split(message).unwrap()))
        });

        group.bench_with_input(
            BenchmarkId::new("split_merge", size),
            &message,
            |b, message| {
                let mut splitter = Splitter::new(16 * 1024);
                b.iter(|| {
                    let mut merger = Merger::new(Duration::from_secs(30));
                    let mut done = None;
                    for frame in splitter.split(message).unwrap() {
                        done = merger.push(&frame).unwrap();
                    }
                    black_box(done)
                })
            },
        );
    }

    group.finish();
}

// ============================================================================
// Projection Benchmarks
// ============================================================================

fn bench_append(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let store = open_store(&runtime, &dir);
    let mut i = 0u64;

    c.bench_function("append_and_project", |b| {
        b.iter(|| {
            i += 1;
            let op = BenchOp::Set {
                key: format!("key/{}", i % 1000),
                value: "value".to_string(),
            };
            black_box(store.append("default", &op).unwrap())
        })
    });
}

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebuild");
    group.sample_size(10);
    let runtime = tokio::runtime::Runtime::new().unwrap();

    for entries in [100usize, 1000] {
        let dir = TempDir::new().unwrap();
        let store = open_store(&runtime, &dir);
        for i in 0..entries {
            let op = BenchOp::Set {
                key: format!("key/{}", i),
                value: "value".to_string(),
            };
            store.append("default", &op).unwrap();
        }

        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &store, |b, store| {
            b.iter(|| black_box(store.rebuild("default").unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_framing, bench_append, bench_rebuild);
criterion_main!(benches);
