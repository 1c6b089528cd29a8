use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tidemark::checkpoint::{
    CheckpointConfig, CheckpointManager, GenerateBySeqno, GenerateCas, PERSISTENCE_CURSOR,
};
use tidemark::hlc::HybridClock;
use tidemark::item::{DocKey, Item};

const ITEMS: usize = 1_000;

fn manager() -> CheckpointManager {
    CheckpointManager::new(
        0,
        CheckpointConfig::default(),
        Arc::new(HybridClock::new()),
        0,
        0,
        0,
    )
}

fn bench_queue_dirty(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_dirty");
    group.throughput(criterion::Throughput::Elements(ITEMS as u64));

    group.bench_function("distinct_keys", |b| {
        b.iter_batched(
            manager,
            |manager| {
                for i in 0..ITEMS {
                    let item = Item::mutation(
                        DocKey::default_collection(format!("key-{i}")),
                        0,
                        0,
                        "value",
                    );
                    manager
                        .queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("hot_key_dedup", |b| {
        b.iter_batched(
            manager,
            |manager| {
                for _ in 0..ITEMS {
                    let item =
                        Item::mutation(DocKey::default_collection("hot"), 0, 0, "value");
                    manager
                        .queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_cursor_drain(c: &mut Criterion) {
    c.bench_function("drain_persistence_cursor", |b| {
        b.iter_batched(
            || {
                let manager = manager();
                for i in 0..ITEMS {
                    let item = Item::mutation(
                        DocKey::default_collection(format!("key-{i}")),
                        0,
                        0,
                        "value",
                    );
                    manager
                        .queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)
                        .unwrap();
                }
                manager
            },
            |manager| manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap(),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_queue_dirty, bench_cursor_drain);
criterion_main!(benches);
