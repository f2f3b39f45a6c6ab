//! # Full-Text Search Tests
//!
//! The fast (inverted) and fuzzy (trigram) variants through the query
//! surface: required/forbidden terms, ranking, phrases and typos.

use vantadb::{Context, Database, IndexDef, IndexType, KeyValueType};

fn corpus(index_type: IndexType) -> Database {
    let db = Database::open_in_memory().unwrap();
    db.open_namespace("docs").unwrap();
    db.add_index(
        "docs",
        IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk(),
    )
    .unwrap();
    db.add_index("docs", IndexDef::new("body", index_type, KeyValueType::String))
        .unwrap();
    for (id, body) in [
        (1, "the quick brown fox"),
        (2, "quick brown"),
        (3, "slow fox"),
    ] {
        db.upsert("docs", &format!(r#"{{"id":{id},"body":"{body}"}}"#))
            .unwrap();
    }
    db
}

/// `quick +brown -slow`: first two docs match, the four-word doc ranks
/// higher than the two-word doc under the default config.
#[test]
fn fast_required_forbidden_and_ranking() {
    let db = corpus(IndexType::FullTextFast);
    let results = db
        .select_sql(
            "SELECT * FROM docs WHERE body = 'quick +brown -slow'",
            &Context::new(),
        )
        .unwrap();
    assert_eq!(results.len(), 2);
    let ids: Vec<i64> = results
        .field_values("id")
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(results.rows[0].proc > results.rows[1].proc);
}

#[test]
fn fast_phrase_and_prefix() {
    let db = corpus(IndexType::FullTextFast);
    let phrase = db
        .select_sql(
            "SELECT * FROM docs WHERE body = '\"quick brown\"'",
            &Context::new(),
        )
        .unwrap();
    assert_eq!(phrase.len(), 2);

    let prefix = db
        .select_sql("SELECT * FROM docs WHERE body = 'qui*'", &Context::new())
        .unwrap();
    assert_eq!(prefix.len(), 2);
}

#[test]
fn fast_typo_tolerance() {
    let db = corpus(IndexType::FullTextFast);
    let results = db
        .select_sql("SELECT * FROM docs WHERE body = 'quikc'", &Context::new())
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[test]
fn fast_search_combines_with_other_conditions() {
    let db = corpus(IndexType::FullTextFast);
    let results = db
        .select_sql(
            "SELECT * FROM docs WHERE body = 'fox' AND id = 3",
            &Context::new(),
        )
        .unwrap();
    let ids: Vec<i64> = results
        .field_values("id")
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![3]);
}

#[test]
fn fuzzy_survives_misspelling() {
    let db = corpus(IndexType::FullTextFuzzy);
    let results = db
        .select_sql("SELECT * FROM docs WHERE body = 'qiuck brwon'", &Context::new())
        .unwrap();
    assert!(!results.is_empty());
    let top = results.row_to_json(0).unwrap();
    assert_eq!(top["id"], serde_json::json!(1));
    // Best match scales to 100.
    assert_eq!(results.rows[0].proc, 100);
}

#[test]
fn writes_invalidate_and_rebuild_on_next_search() {
    let db = corpus(IndexType::FullTextFast);
    db.select_sql("SELECT * FROM docs WHERE body = 'fox'", &Context::new())
        .unwrap();
    db.upsert("docs", r#"{"id":4,"body":"another fox entirely"}"#)
        .unwrap();
    let results = db
        .select_sql("SELECT * FROM docs WHERE body = 'fox'", &Context::new())
        .unwrap();
    assert_eq!(results.len(), 3);
}
