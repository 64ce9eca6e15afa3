use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use nautex::config::{IndexMapping, IngestSettings};
use nautex::engine::MemoryEngine;
use nautex::shard::IndexShard;

const VALUE_LEN: usize = 512;

fn bench_ingest(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench-shard");
    let engine = MemoryEngine::new_index(&path, IndexMapping::default()).unwrap();
    let shard = IndexShard::new(
        path,
        Arc::new(engine),
        IngestSettings::default(),
        Arc::new(|| {}),
    );

    // One wide snapshot so applies are size-triggered, as in steady-state
    // streaming.
    shard.on_snapshot_start("0", 1, u64::MAX).unwrap();

    let value = vec![b'x'; VALUE_LEN];
    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Bytes(VALUE_LEN as u64));
    group.bench_function("on_update", |b| {
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            let key = format!("k{}", seq % 10_000);
            shard.on_update("0", key.as_bytes(), seq, &value).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_ingest);
criterion_main!(benches);
