//! Select and upsert throughput over an in-memory namespace.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use vantadb::{Context, Database, IndexDef, IndexType, KeyValueType};

fn seeded(rows: usize) -> Database {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("bench").unwrap();
    db.add_index(
        "bench",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    db.add_index(
        "bench",
        IndexDef::new("score", IndexType::Tree, KeyValueType::Int),
    )
    .unwrap();
    for i in 0..rows {
        db.upsert(
            "bench",
            &format!(r#"{{"id":{i},"score":{},"name":"row-{i}"}}"#, i % 1000),
        )
        .unwrap();
    }
    db
}

fn bench_selects(c: &mut Criterion) {
    let db = seeded(50_000);
    let ctx = Context::new();

    c.bench_function("select_eq_hash", |b| {
        b.iter(|| {
            db.select_sql("SELECT * FROM bench WHERE id = 25000", &ctx)
                .unwrap()
        })
    });

    c.bench_function("select_range_tree", |b| {
        b.iter(|| {
            db.select_sql(
                "SELECT * FROM bench WHERE score >= 100 AND score < 120 LIMIT 100",
                &ctx,
            )
            .unwrap()
        })
    });

    c.bench_function("select_sorted", |b| {
        b.iter(|| {
            db.select_sql(
                "SELECT * FROM bench WHERE score < 50 ORDER BY score DESC LIMIT 50",
                &ctx,
            )
            .unwrap()
        })
    });
}

fn bench_upsert(c: &mut Criterion) {
    c.bench_function("upsert_1k", |b| {
        b.iter_batched(
            || seeded(0),
            |db| {
                for i in 0..1000 {
                    db.upsert("bench", &format!(r#"{{"id":{i},"score":{i}}}"#))
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_selects, bench_upsert);
criterion_main!(benches);
