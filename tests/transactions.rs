//! # Transaction Tests
//!
//! Commit pipeline, partial-failure prefix semantics, rollback and the
//! terminal state machine.

use vantadb::{Context, Database, ErrorKind, IndexDef, IndexType, KeyValueType, ModifyMode};

fn setup() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("books").unwrap();
    db.add_index(
        "books",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    db
}

/// Upsert then conflicting insert in one transaction: commit reports the
/// conflict, the upsert prefix stays applied.
#[test]
fn partial_failure_keeps_applied_prefix() {
    let db = setup();
    let tx = db.begin_transaction("books").unwrap();
    db.tx_modify_item(tx, r#"{"id":1,"title":"A"}"#, ModifyMode::Upsert, &[])
        .unwrap();
    db.tx_modify_item(tx, r#"{"id":1,"title":"B"}"#, ModifyMode::Insert, &[])
        .unwrap();

    let err = db.commit_transaction(tx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // The first step survived.
    let results = db
        .select_sql("SELECT * FROM books WHERE id = 1", &Context::new())
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results.row_to_json(0).unwrap()["title"],
        serde_json::json!("A")
    );
}

#[test]
fn commit_applies_all_steps_atomically() {
    let db = setup();
    let tx = db.begin_transaction("books").unwrap();
    for id in 1..=10 {
        db.tx_modify_item(
            tx,
            &format!(r#"{{"id":{id},"v":{id}}}"#),
            ModifyMode::Upsert,
            &[],
        )
        .unwrap();
    }
    // Nothing visible before commit.
    assert_eq!(db.item_count("books").unwrap(), 0);
    db.commit_transaction(tx).unwrap();
    assert_eq!(db.item_count("books").unwrap(), 10);
}

#[test]
fn rollback_has_no_side_effects() {
    let db = setup();
    let tx = db.begin_transaction("books").unwrap();
    db.tx_modify_item(tx, r#"{"id":1}"#, ModifyMode::Upsert, &[])
        .unwrap();
    db.rollback_transaction(tx).unwrap();
    assert_eq!(db.item_count("books").unwrap(), 0);
    // Terminal: neither commit nor a second rollback is possible.
    assert_eq!(
        db.commit_transaction(tx).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn transactional_query_steps() {
    let db = setup();
    for id in 1..=3 {
        db.upsert("books", &format!(r#"{{"id":{id},"flag":0}}"#))
            .unwrap();
    }
    let tx = db.begin_transaction("books").unwrap();
    let update = vantadb::parse_sql("UPDATE books SET flag = 1 WHERE id <= 2")
        .unwrap()
        .into_query();
    db.tx_modify_query(tx, update).unwrap();
    let delete = vantadb::parse_sql("DELETE FROM books WHERE id = 3")
        .unwrap()
        .into_query();
    db.tx_modify_query(tx, delete).unwrap();
    db.commit_transaction(tx).unwrap();

    assert_eq!(db.item_count("books").unwrap(), 2);
    let flagged = db
        .select_sql("SELECT * FROM books WHERE flag = 1", &Context::new())
        .unwrap();
    assert_eq!(flagged.len(), 2);
}

#[test]
fn transaction_bound_to_one_namespace() {
    let db = setup();
    db.open_namespace("other").unwrap();
    let tx = db.begin_transaction("books").unwrap();
    let err = db
        .tx_modify_query(tx, vantadb::Query::new("other"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Params);
    db.rollback_transaction(tx).unwrap();
}

#[test]
fn unknown_transaction_is_not_found() {
    let db = setup();
    assert_eq!(
        db.commit_transaction(999).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        db.rollback_transaction(999).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}
