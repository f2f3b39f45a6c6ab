//! # Update Subscription Tests
//!
//! The WAL stream fan-out through the database API: ordering, filters,
//! transaction markers.

use vantadb::{
    Database, IndexDef, IndexType, KeyValueType, ModifyMode, UpdatesFilter, UpdatesPoll,
};

fn setup() -> Database {
    let db = Database::open_in_memory().unwrap();
    for ns in ["books", "orders"] {
        db.open_namespace(ns).unwrap();
        db.add_index(
            ns,
            IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
        )
        .unwrap();
    }
    db
}

fn records(poll: UpdatesPoll) -> Vec<vantadb::replication::UpdateRecord> {
    match poll {
        UpdatesPoll::Records(r) => r,
        UpdatesPoll::ResyncRequired => panic!("unexpected resync"),
    }
}

#[test]
fn item_records_arrive_in_lsn_order() {
    let db = setup();
    let sub = db.subscribe_updates(UpdatesFilter {
        namespaces: Some(vec!["books".to_string()]),
        kinds: Some(vec!["item_modify".to_string()]),
    });
    for id in 1..=3 {
        db.upsert("books", &format!(r#"{{"id":{id}}}"#)).unwrap();
    }
    db.upsert("orders", r#"{"id":9}"#).unwrap();

    let got = records(sub.poll().unwrap());
    assert_eq!(got.len(), 3);
    assert!(got.windows(2).all(|w| w[0].entry.lsn < w[1].entry.lsn));
    assert!(got.iter().all(|r| r.namespace == "books"));
}

#[test]
fn transaction_markers_frame_the_batch() {
    let db = setup();
    let sub = db.subscribe_updates(UpdatesFilter {
        namespaces: Some(vec!["books".to_string()]),
        kinds: None,
    });
    let tx = db.begin_transaction("books").unwrap();
    db.tx_modify_item(tx, r#"{"id":1}"#, ModifyMode::Upsert, &[])
        .unwrap();
    db.tx_modify_item(tx, r#"{"id":2}"#, ModifyMode::Upsert, &[])
        .unwrap();
    db.commit_transaction(tx).unwrap();

    let got = records(sub.poll().unwrap());
    let kinds: Vec<&str> = got.iter().map(|r| r.entry.record.kind_name()).collect();
    assert_eq!(
        kinds,
        vec!["tx_begin", "item_modify", "item_modify", "tx_commit"]
    );
}

#[test]
fn unsubscribed_observer_stops_receiving() {
    let db = setup();
    let sub = db.subscribe_updates(UpdatesFilter::default());
    sub.unsubscribe();
    db.upsert("books", r#"{"id":1}"#).unwrap();
    // A new subscription starts from the present.
    let fresh = db.subscribe_updates(UpdatesFilter::default());
    assert!(records(fresh.poll().unwrap()).is_empty());
}
