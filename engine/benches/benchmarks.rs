//! Performance benchmarks for ferry-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ferry_engine::{
    resolve, ChangeEntry, Frame, GlobalId, RecordVersion, Replica, TableDef, TableRegistry,
};
use serde_json::json;

fn test_registry() -> TableRegistry {
    TableRegistry::new().with_table(TableDef::entity("notes"))
}

fn sample_entry(n: u64) -> ChangeEntry {
    ChangeEntry::insert(
        "notes",
        GlobalId::random(),
        json!({"title": format!("note {n}"), "n": n})
            .as_object()
            .unwrap()
            .clone(),
        1000.0 + n as f64,
    )
}

fn bench_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture");

    group.bench_function("insert_with_log_entry", |b| {
        let mut replica = Replica::open_in_memory(test_registry()).unwrap();
        let mut n = 0u64;

        b.iter(|| {
            n += 1;
            let mut w = replica.begin_write().unwrap();
            w.insert(
                "notes",
                json!({"title": "bench", "n": n}).as_object().unwrap().clone(),
                black_box(1000.0 + n as f64),
            )
            .unwrap();
            w.commit().unwrap()
        })
    });

    group.finish();
}

fn bench_resolver(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolver");

    group.bench_function("resolve", |b| {
        let entry = sample_entry(1);
        let current = RecordVersion {
            timestamp: 900.0,
            entry_id: GlobalId::random(),
            deleted: false,
        };

        b.iter(|| resolve(black_box(&entry), black_box(Some(&current))))
    });

    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");

    for size in [10u64, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("remote_batch", size), size, |b, &size| {
            let entries: Vec<ChangeEntry> = (0..size).map(sample_entry).collect();

            b.iter(|| {
                let mut replica = Replica::open_in_memory(test_registry()).unwrap();
                replica.apply_remote(black_box(&entries)).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");

    for size in [10u64, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("encode", size), size, |b, &size| {
            let frame = Frame::Changes((0..size).map(sample_entry).collect());
            b.iter(|| ferry_engine::wire::encode(black_box(&frame)))
        });

        group.bench_with_input(BenchmarkId::new("decode", size), size, |b, &size| {
            let frame = Frame::Changes((0..size).map(sample_entry).collect());
            let encoded = ferry_engine::wire::encode(&frame);
            b.iter(|| ferry_engine::wire::decode(black_box(&encoded)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_capture, bench_resolver, bench_apply, bench_wire);
criterion_main!(benches);
