use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use formjobs_jobs::{
    Dispatcher, DispatcherConfig, HandlerRegistry, InMemoryJobStore, JobStore, NewJob, Payload,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn payload(user_id: i64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("user_id".to_string(), serde_json::json!(user_id));
    payload
}

fn seeded_store(rt: &Runtime, pending: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    rt.block_on(async {
        for i in 0..pending {
            store
                .enqueue(NewJob::new("extract_brand_colors", payload(i as i64)))
                .await
                .unwrap();
        }
    });
    store
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory", |b| {
        let store = InMemoryJobStore::new();
        b.iter(|| {
            rt.block_on(store.enqueue(NewJob::new("extract_brand_colors", payload(black_box(42)))))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_fetch_pending_batch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fetch_pending_batch");

    for backlog in [100usize, 1_000, 10_000] {
        let store = seeded_store(&rt, backlog);
        group.throughput(Throughput::Elements(10));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, _| {
            b.iter(|| rt.block_on(store.fetch_pending_batch(black_box(10))).unwrap());
        });
    }

    group.finish();
}

fn bench_tick(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dispatcher_tick");
    group.sample_size(50);

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || {
                        let store = seeded_store(&rt, batch_size);
                        let mut registry = HandlerRegistry::new();
                        registry.register_fn("extract_brand_colors", |_, _| async { Ok(()) });
                        Dispatcher::new(
                            store,
                            registry,
                            DispatcherConfig::default().with_batch_size(batch_size),
                        )
                        .unwrap()
                    },
                    |dispatcher| rt.block_on(dispatcher.tick()).unwrap(),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_fetch_pending_batch,
    bench_tick
);
criterion_main!(benches);
