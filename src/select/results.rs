//! # Query Results
//!
//! Materialized outcome of a select. Rows hold shared payload values, so a
//! result set stays valid after the namespace lock is released; rendering
//! to JSON uses the payload-type and tag-matcher snapshots taken at select
//! time.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::payload::{cjson, PayloadType, PayloadValue, TagsMatcher};
use crate::query::AggType;
use crate::types::value::Variant;
use crate::types::{IdType, Lsn};

/// Snapshot needed to render rows of one namespace.
#[derive(Debug, Clone)]
pub struct NsSnapshot {
    pub name: String,
    pub payload_type: Arc<PayloadType>,
    pub tags: Arc<TagsMatcher>,
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub id: IdType,
    pub lsn: Lsn,
    /// Full-text relevancy percentage; 0 outside full-text selects.
    pub proc: i32,
    pub payload: PayloadValue,
    /// Rows attached by left/inner joins, one bucket per joined query.
    pub joined: Vec<Vec<ResultRow>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetResult {
    pub values: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationResult {
    #[serde(rename = "type")]
    pub agg_type: AggType,
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub distincts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<FacetResult>,
}

/// One filter entry's plan, for `EXPLAIN`.
#[derive(Debug, Clone, Serialize)]
pub struct IteratorReport {
    pub field: String,
    /// Index name, `scan`, `comparator` or `fulltext`.
    pub method: String,
    pub keys: usize,
    pub matched: usize,
    pub cost: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExplainReport {
    pub iterators: Vec<IteratorReport>,
    /// Index whose built sort order assembled the output, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_index: Option<String>,
    pub loop_items: usize,
}

#[derive(Debug)]
pub struct QueryResults {
    pub ns: NsSnapshot,
    pub rows: Vec<ResultRow>,
    /// Snapshots of joined namespaces, indexed like `Query::join_queries`.
    pub joined_ns: Vec<NsSnapshot>,
    pub total_count: usize,
    pub aggregations: Vec<AggregationResult>,
    pub explain: Option<ExplainReport>,
    /// Field projection; empty renders whole documents.
    pub select_filter: Vec<String>,
}

impl QueryResults {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> Vec<IdType> {
        self.rows.iter().map(|r| r.id).collect()
    }

    /// Render one row as a JSON document (fixed fields + dynamic body).
    pub fn row_to_json(&self, row: usize) -> Result<serde_json::Value> {
        let r = &self.rows[row];
        let mut doc = render_document(&self.ns, r)?;
        if !self.select_filter.is_empty() {
            if let serde_json::Value::Object(map) = &mut doc {
                map.retain(|k, _| self.select_filter.iter().any(|f| f == k));
            }
        }
        if !r.joined.is_empty() {
            if let serde_json::Value::Object(map) = &mut doc {
                for (bucket, rows) in r.joined.iter().enumerate() {
                    if rows.is_empty() {
                        continue;
                    }
                    let ns = &self.joined_ns[bucket];
                    let rendered: Vec<serde_json::Value> = rows
                        .iter()
                        .map(|jr| render_document(ns, jr))
                        .collect::<Result<_>>()?;
                    map.insert(
                        format!("joined_{}", ns.name),
                        serde_json::Value::Array(rendered),
                    );
                }
            }
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<Vec<serde_json::Value>> {
        (0..self.rows.len()).map(|i| self.row_to_json(i)).collect()
    }

    /// First scalar of a field across rows, a convenience for tests.
    pub fn field_values(&self, field: &str) -> Result<Vec<Variant>> {
        let mut out = Vec::with_capacity(self.rows.len());
        for i in 0..self.rows.len() {
            let doc = self.row_to_json(i)?;
            out.push(Variant::from_json(doc.get(field).unwrap_or(&serde_json::Value::Null))?);
        }
        Ok(out)
    }
}

fn render_document(ns: &NsSnapshot, row: &ResultRow) -> Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    let payload = crate::payload::Payload::new(&ns.payload_type, &row.payload);
    for (idx, field) in ns.payload_type.fields().iter().enumerate() {
        let values = payload.field_values(idx);
        if values.is_empty() {
            continue;
        }
        let json = if field.is_array {
            serde_json::Value::Array(values.iter().map(Variant::to_json).collect())
        } else {
            values[0].to_json()
        };
        map.insert(field.name.clone(), json);
    }
    let body = cjson::decode(row.payload.body(), &ns.tags)?;
    if let serde_json::Value::Object(dynamic) = body {
        for (k, v) in dynamic {
            map.entry(k).or_insert(v);
        }
    }
    Ok(serde_json::Value::Object(map))
}
