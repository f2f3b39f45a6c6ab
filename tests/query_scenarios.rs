//! # Query Scenario Tests
//!
//! End-to-end coverage of the select pipeline: hash equality, ordered
//! ranges, composite indexes, brackets, LIKE, forced sort order and
//! geometry conditions, all through the public `Database` API.

use vantadb::{
    Context, Database, ErrorKind, IndexDef, IndexType, KeyValueType, Query, Variant,
};

fn books() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("books").unwrap();
    db.add_index(
        "books",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    db.add_index(
        "books",
        IndexDef::new("title", IndexType::Hash, KeyValueType::String),
    )
    .unwrap();
    db
}

fn ids(results: &vantadb::QueryResults) -> Vec<i64> {
    results
        .field_values("id")
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect()
}

/// Upsert three rows, query by hash equality, sort by id descending.
#[test]
fn upsert_and_query_by_hash_equality() {
    let db = books();
    db.upsert("books", r#"{"id":1,"title":"A"}"#).unwrap();
    db.upsert("books", r#"{"id":2,"title":"B"}"#).unwrap();
    db.upsert("books", r#"{"id":3,"title":"A"}"#).unwrap();

    let results = db
        .select_sql(
            "SELECT * FROM books WHERE title = 'A' ORDER BY id DESC",
            &Context::new(),
        )
        .unwrap();
    assert_eq!(ids(&results), vec![3, 1]);
}

/// Range select on an ordered tree index, with req_total.
#[test]
fn range_on_ordered_tree() {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("goods").unwrap();
    db.add_index(
        "goods",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    db.add_index(
        "goods",
        IndexDef::new("price", IndexType::Tree, KeyValueType::Double),
    )
    .unwrap();
    for (i, p) in [1.0, 2.5, 3.0, 4.5, 10.0].iter().enumerate() {
        db.upsert("goods", &format!(r#"{{"id":{},"price":{}}}"#, i + 1, p))
            .unwrap();
    }

    let query = vantadb::parse_sql(
        "SELECT COUNT(*) FROM goods WHERE price >= 2.5 AND price < 10.0",
    )
    .unwrap()
    .into_query();
    let results = db.select(&query, &Context::new()).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results.total_count, 3);
    let mut prices: Vec<f64> = results
        .field_values("price")
        .unwrap()
        .iter()
        .map(|v| match v {
            Variant::Double(d) => *d,
            other => panic!("expected double, got {other}"),
        })
        .collect();
    prices.sort_by(f64::total_cmp);
    assert_eq!(prices, vec![2.5, 3.0, 4.5]);
}

/// Composite index answers the conjunction; a single member falls back
/// to a scan.
#[test]
fn composite_index_preference() {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("lib").unwrap();
    db.add_index(
        "lib",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    db.add_index(
        "lib",
        IndexDef::new("author", IndexType::Hash, KeyValueType::String),
    )
    .unwrap();
    db.add_index(
        "lib",
        IndexDef::new("year", IndexType::Hash, KeyValueType::Int),
    )
    .unwrap();
    db.add_index(
        "lib",
        IndexDef::new("author+year=book_key", IndexType::Hash, KeyValueType::Composite),
    )
    .unwrap();
    db.upsert("lib", r#"{"id":1,"author":"X","year":2000}"#).unwrap();
    db.upsert("lib", r#"{"id":2,"author":"X","year":2001}"#).unwrap();

    let results = db
        .select_sql(
            "SELECT * FROM lib WHERE author = 'X' AND year = 2001",
            &Context::new(),
        )
        .unwrap();
    assert_eq!(ids(&results), vec![2]);

    // Explain shows the composite carrying the probe.
    let explained = db
        .select_sql(
            "EXPLAIN SELECT * FROM lib WHERE author = 'X' AND year = 2001",
            &Context::new(),
        )
        .unwrap();
    let report = explained.explain.unwrap();
    assert!(report.iterators.iter().any(|i| i.method == "book_key"));

    let by_author = db
        .select_sql("SELECT * FROM lib WHERE author = 'X'", &Context::new())
        .unwrap();
    assert_eq!(ids(&by_author), vec![1, 2]);
}

#[test]
fn brackets_not_and_or() {
    let db = books();
    for (id, title, year) in [(1, "A", 1999), (2, "B", 2005), (3, "C", 2010)] {
        db.upsert(
            "books",
            &format!(r#"{{"id":{id},"title":"{title}","year":{year}}}"#),
        )
        .unwrap();
    }
    let results = db
        .select_sql(
            "SELECT * FROM books WHERE (title = 'A' OR title = 'C') AND NOT year = 2010",
            &Context::new(),
        )
        .unwrap();
    assert_eq!(ids(&results), vec![1]);
}

#[test]
fn like_falls_back_to_comparator() {
    let db = books();
    db.upsert("books", r#"{"id":1,"title":"Dune"}"#).unwrap();
    db.upsert("books", r#"{"id":2,"title":"Duma Key"}"#).unwrap();
    db.upsert("books", r#"{"id":3,"title":"It"}"#).unwrap();
    let results = db
        .select_sql("SELECT * FROM books WHERE title LIKE 'du%'", &Context::new())
        .unwrap();
    assert_eq!(ids(&results), vec![1, 2]);
}

#[test]
fn forced_sort_order_hoists_values() {
    let db = books();
    for (id, year) in [(1, 2003), (2, 2007), (3, 1999)] {
        db.upsert("books", &format!(r#"{{"id":{id},"title":"t","year":{year}}}"#))
            .unwrap();
    }
    let results = db
        .select_sql(
            "SELECT * FROM books ORDER BY FIELD(year, 2007, 2003)",
            &Context::new(),
        )
        .unwrap();
    // Forced values first in listed order, the rest after.
    assert_eq!(ids(&results), vec![2, 1, 3]);
}

#[test]
fn dwithin_uses_geometry_index() {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("places").unwrap();
    db.add_index(
        "places",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    db.add_index(
        "places",
        IndexDef::new("loc", IndexType::RTree, KeyValueType::Point).array(),
    )
    .unwrap();
    db.upsert("places", r#"{"id":1,"loc":[0.0,0.0]}"#).unwrap();
    db.upsert("places", r#"{"id":2,"loc":[3.0,4.0]}"#).unwrap();
    db.upsert("places", r#"{"id":3,"loc":[50.0,50.0]}"#).unwrap();

    let results = db
        .select_sql(
            "SELECT * FROM places WHERE DWITHIN(loc, POINT(0.0, 0.0), 5.0)",
            &Context::new(),
        )
        .unwrap();
    assert_eq!(ids(&results), vec![1, 2]);
}

#[test]
fn comparator_fallback_and_typed_parse_errors() {
    let db = books();
    db.upsert("books", r#"{"id":1,"title":"A"}"#).unwrap();
    // Hash index on title: the planner resolves the range through a
    // comparator fallback, so the query still answers.
    let results = db
        .select_sql("SELECT * FROM books WHERE title > 'A'", &Context::new())
        .unwrap();
    assert_eq!(results.len(), 0);
    // A broken query surfaces a typed parse error instead.
    let err = db
        .select_sql("SELECT * FROM", &Context::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}

#[test]
fn query_builder_matches_sql_surface() {
    let db = books();
    db.upsert("books", r#"{"id":1,"title":"A"}"#).unwrap();
    db.upsert("books", r#"{"id":2,"title":"B"}"#).unwrap();
    let q = Query::new("books")
        .where_cond(
            "title",
            vantadb::CondType::Eq,
            [Variant::string("B")].into_iter().collect(),
        )
        .sort("id", false);
    let results = db.select(&q, &Context::new()).unwrap();
    assert_eq!(ids(&results), vec![2]);
}

#[test]
fn update_and_delete_queries() {
    let db = books();
    for id in 1..=4 {
        db.upsert("books", &format!(r#"{{"id":{id},"title":"t","price":10}}"#))
            .unwrap();
    }
    let affected = db
        .execute_sql("UPDATE books SET price = 20 WHERE id <= 2", &Context::new())
        .unwrap();
    assert_eq!(affected, 2);
    let results = db
        .select_sql("SELECT * FROM books WHERE price = 20", &Context::new())
        .unwrap();
    assert_eq!(results.len(), 2);

    let removed = db
        .execute_sql("DELETE FROM books WHERE id = 1", &Context::new())
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(db.item_count("books").unwrap(), 3);

    db.execute_sql("TRUNCATE books", &Context::new()).unwrap();
    assert_eq!(db.item_count("books").unwrap(), 0);
}
