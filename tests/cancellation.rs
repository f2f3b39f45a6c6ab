//! # Cancellation & Deadline Tests
//!
//! Long selects check the cooperative token at iterator boundaries; an
//! expired deadline surfaces as a typed error with no partial batch.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use vantadb::{Context, Database, ErrorKind, IndexDef, IndexType, KeyValueType};

fn large_namespace(rows: usize) -> Database {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("big").unwrap();
    db.add_index(
        "big",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    let tx = db.begin_transaction("big").unwrap();
    for i in 0..rows {
        db.tx_modify_item(
            tx,
            &format!(r#"{{"id":{i},"payload":{}}}"#, i % 97),
            vantadb::ModifyMode::Upsert,
            &[],
        )
        .unwrap();
    }
    db.commit_transaction(tx).unwrap();
    db
}

/// A full-column scan against an expired deadline returns `Timeout` (the
/// deadline flavor of cancellation) and no rows.
#[test]
fn expired_deadline_cancels_full_scan() {
    let db = large_namespace(200_000);
    let ctx = Context::with_timeout(Duration::ZERO);
    let err = db
        .select_sql("SELECT * FROM big WHERE payload = 13", &ctx)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn cancel_flag_cancels_full_scan() {
    let db = large_namespace(100_000);
    let flag = Arc::new(AtomicBool::new(true));
    let ctx = Context::with_cancel(flag);
    let err = db
        .select_sql("SELECT * FROM big WHERE payload = 13", &ctx)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
}

#[test]
fn generous_deadline_completes() {
    let db = large_namespace(10_000);
    let ctx = Context::with_timeout(Duration::from_secs(60));
    let results = db
        .select_sql("SELECT * FROM big WHERE payload = 13", &ctx)
        .unwrap();
    assert!(!results.is_empty());
}

/// Cancellation of one request leaves the namespace usable.
#[test]
fn canceled_select_releases_cleanly() {
    let db = large_namespace(50_000);
    let err = db
        .select_sql(
            "SELECT * FROM big WHERE payload = 13",
            &Context::with_timeout(Duration::ZERO),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let ok = db
        .select_sql("SELECT * FROM big WHERE id = 42", &Context::new())
        .unwrap();
    assert_eq!(ok.len(), 1);
    db.upsert("big", r#"{"id":1000001,"payload":1}"#).unwrap();
}
