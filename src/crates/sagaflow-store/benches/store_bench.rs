use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sagaflow_store::{FlowSnapshot, FlowStatus, FlowStore, MemoryFlowStore};
use serde_json::json;

fn snapshot_update_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("snapshot cas update", |b| {
        b.to_async(&runtime).iter(|| async {
            let store = MemoryFlowStore::new();
            let mut snapshot = FlowSnapshot::new("bench-flow", "bench", json!({"n": 0}));
            store.create(&snapshot).await.unwrap();

            snapshot.status = FlowStatus::Running;
            store.update(black_box(&mut snapshot)).await.unwrap();
        });
    });
}

fn snapshot_claim_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("snapshot claim", |b| {
        b.to_async(&runtime).iter(|| async {
            let store = MemoryFlowStore::new();
            let mut snapshot = FlowSnapshot::new("bench-flow", "bench", json!({}));
            snapshot.status = FlowStatus::Suspended;
            store.create(&snapshot).await.unwrap();

            store
                .try_claim(
                    black_box("bench"),
                    "bench-node",
                    std::time::Duration::from_secs(30),
                )
                .await
                .unwrap();
        });
    });
}

criterion_group!(benches, snapshot_update_benchmark, snapshot_claim_benchmark);
criterion_main!(benches);
