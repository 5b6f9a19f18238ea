use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;
use std::collections::BTreeMap;

use strata_core::db::open_memory_store;
use strata_core::event::{ChangeEvent, Operation};
use strata_core::reconcile::Reconciler;
use strata_core::store::EventStore;

const BATCH_SIZES: &[usize] = &[100, 1_000, 10_000];

fn make_batch(n: usize) -> Vec<ChangeEvent> {
    (0..n)
        .map(|i| {
            let i = i as i64;
            let mut payload = BTreeMap::new();
            payload.insert("event_id".to_string(), json!(format!("e-{i}")));
            payload.insert("user_id".to_string(), json!(format!("u-{}", i % 50)));
            payload.insert("event_type".to_string(), json!("page_view"));
            payload.insert("event_timestamp".to_string(), json!(i * 1_000));
            ChangeEvent {
                entity: "events".to_string(),
                key: format!("e-{i}"),
                op: Operation::Insert,
                payload,
                source_ts_us: i * 1_000,
                received_ts_us: i * 1_000 + 5,
            }
        })
        .collect()
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest.reconcile");

    for &size in BATCH_SIZES {
        let batch = make_batch(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                let conn = open_memory_store().expect("store");
                let rec = Reconciler::new(&conn);
                let stats = rec.apply_batch(batch).expect("batch");
                black_box(stats.applied)
            });
        });
    }

    group.finish();
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest.record");

    for &size in BATCH_SIZES {
        let batch = make_batch(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                let conn = open_memory_store().expect("store");
                let store = EventStore::new(&conn, "event_timestamp".to_string());
                let stats = store.record_batch(batch).expect("batch");
                black_box(stats.recorded)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reconcile, bench_record);
criterion_main!(benches);
