//! # JSON Query DSL
//!
//! The second query surface: a JSON document describing the same tree the
//! SQL parser produces. Used by HTTP `POST /query` bodies and by clients
//! that build queries programmatically.
//!
//! ```json
//! {
//!   "namespace": "books",
//!   "filters": [
//!     {"field": "title", "cond": "EQ", "value": "A"},
//!     {"op": "or", "filters": [{"field": "year", "cond": "GT", "value": 2000}]}
//!   ],
//!   "sort": [{"field": "id", "desc": true}],
//!   "limit": 10
//! }
//! ```

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::index::CondType;
use crate::query::{
    AggSortEntry, AggType, AggregateEntry, Filter, FilterNode, JoinEntry, JoinType, JoinedQuery,
    OpType, Query, SortEntry, UpdateEntry,
};
use crate::types::value::{Variant, VariantArray};

pub fn parse_dsl(json: &str) -> Result<Query> {
    let dsl: DslQuery = serde_json::from_str(json)?;
    dsl.into_query()
}

#[derive(Debug, Deserialize)]
struct DslQuery {
    namespace: String,
    #[serde(default)]
    filters: Vec<DslFilter>,
    #[serde(default)]
    sort: Vec<DslSort>,
    #[serde(default)]
    aggregations: Vec<DslAgg>,
    #[serde(default)]
    merge_queries: Vec<DslQuery>,
    #[serde(default)]
    join_queries: Vec<DslJoin>,
    #[serde(default)]
    update_fields: Vec<DslUpdate>,
    #[serde(default)]
    select_filter: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    req_total: bool,
    #[serde(default)]
    explain: bool,
    #[serde(default = "default_true")]
    with_cache: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DslFilter {
    #[serde(default)]
    op: Option<OpType>,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    cond: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    filters: Option<Vec<DslFilter>>,
}

#[derive(Debug, Deserialize)]
struct DslSort {
    field: String,
    #[serde(default)]
    desc: bool,
    #[serde(default)]
    values: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DslAgg {
    #[serde(rename = "type")]
    agg_type: AggType,
    fields: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    sort: Vec<AggSortEntry>,
}

#[derive(Debug, Deserialize)]
struct DslJoin {
    #[serde(rename = "type")]
    join_type: JoinType,
    on: Vec<DslJoinOn>,
    #[serde(flatten)]
    query: DslQuery,
}

#[derive(Debug, Deserialize)]
struct DslJoinOn {
    left_field: String,
    right_field: String,
    #[serde(default)]
    cond: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DslUpdate {
    field: String,
    value: serde_json::Value,
}

impl DslQuery {
    fn into_query(self) -> Result<Query> {
        let mut q = Query::new(self.namespace);
        q.filters = self
            .filters
            .into_iter()
            .map(DslFilter::into_filter)
            .collect::<Result<_>>()?;
        for s in self.sort {
            q.sort.push(SortEntry {
                field: s.field,
                desc: s.desc,
                forced: s
                    .values
                    .iter()
                    .map(Variant::from_json)
                    .collect::<Result<_>>()?,
            });
        }
        for a in self.aggregations {
            q.aggregations.push(AggregateEntry {
                agg_type: a.agg_type,
                fields: a.fields,
                limit: a.limit,
                offset: a.offset,
                sort: a.sort,
            });
        }
        for m in self.merge_queries {
            q.merge_queries.push(m.into_query()?);
        }
        for j in self.join_queries {
            let on = j
                .on
                .into_iter()
                .map(|o| {
                    Ok(JoinEntry {
                        left_field: o.left_field,
                        right_field: o.right_field,
                        cond: match o.cond {
                            Some(c) => parse_cond(&c)?,
                            None => CondType::Eq,
                        },
                    })
                })
                .collect::<Result<_>>()?;
            q.join_queries.push(JoinedQuery {
                join_type: j.join_type,
                on,
                query: j.query.into_query()?,
            });
        }
        for u in self.update_fields {
            q.update_fields.push(UpdateEntry {
                field: u.field,
                value: Variant::from_json(&u.value)?,
            });
        }
        q.select_filter = self.select_filter;
        q.limit = self.limit;
        q.offset = self.offset;
        q.req_total = self.req_total;
        q.explain = self.explain;
        q.with_cache = self.with_cache;
        Ok(q)
    }
}

impl DslFilter {
    fn into_filter(self) -> Result<Filter> {
        let op = self.op.unwrap_or(OpType::And);
        if let Some(inner) = self.filters {
            if self.field.is_some() || self.cond.is_some() {
                return Err(Error::parse(
                    "filter cannot carry both a condition and sub-filters",
                ));
            }
            return Ok(Filter::bracket(
                op,
                inner
                    .into_iter()
                    .map(DslFilter::into_filter)
                    .collect::<Result<_>>()?,
            ));
        }
        let field = self
            .field
            .ok_or_else(|| Error::parse("filter requires 'field' or 'filters'"))?;
        let cond = parse_cond(
            self.cond
                .as_deref()
                .ok_or_else(|| Error::parse("filter requires 'cond'"))?,
        )?;
        let values = match &self.value {
            None => VariantArray::new(),
            Some(v) => json_to_values(v)?,
        };
        Ok(Filter::cond(op, &field, cond, values))
    }
}

fn parse_cond(s: &str) -> Result<CondType> {
    Ok(match s.to_ascii_uppercase().as_str() {
        "EQ" | "=" => CondType::Eq,
        "LT" | "<" => CondType::Lt,
        "LE" | "<=" => CondType::Le,
        "GT" | ">" => CondType::Gt,
        "GE" | ">=" => CondType::Ge,
        "RANGE" => CondType::Range,
        "SET" | "IN" => CondType::Set,
        "ALLSET" => CondType::AllSet,
        "ANY" => CondType::Any,
        "EMPTY" => CondType::Empty,
        "LIKE" => CondType::Like,
        "DWITHIN" => CondType::DWithin,
        other => return Err(Error::parse(format!("unknown condition '{other}'"))),
    })
}

/// Scalar -> one value; array -> many; a two-number array inside an array
/// is a point (for `DWITHIN`).
fn json_to_values(v: &serde_json::Value) -> Result<VariantArray> {
    match v {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::Array(point) if point.len() == 2 => {
                    let x = point[0].as_f64();
                    let y = point[1].as_f64();
                    match (x, y) {
                        (Some(x), Some(y)) => Ok(Variant::Point { x, y }),
                        _ => Err(Error::parse("point must be [x, y] numbers")),
                    }
                }
                other => Variant::from_json(other),
            })
            .collect(),
        scalar => Ok(VariantArray::from_iter([Variant::from_json(scalar)?])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filters_and_sort() {
        let q = parse_dsl(
            r#"{
                "namespace": "books",
                "filters": [
                    {"field": "title", "cond": "EQ", "value": "A"},
                    {"op": "or", "filters": [{"field": "year", "cond": "GT", "value": 2000}]}
                ],
                "sort": [{"field": "id", "desc": true}],
                "limit": 10,
                "req_total": true
            }"#,
        )
        .unwrap();
        assert_eq!(q.namespace, "books");
        assert_eq!(q.filters.len(), 2);
        assert!(matches!(q.filters[1].node, FilterNode::Bracket(_)));
        assert_eq!(q.filters[1].op, OpType::Or);
        assert!(q.sort[0].desc);
        assert_eq!(q.limit, Some(10));
        assert!(q.req_total);
    }

    #[test]
    fn parses_set_and_dwithin_values() {
        let q = parse_dsl(
            r#"{
                "namespace": "places",
                "filters": [
                    {"field": "id", "cond": "SET", "value": [1, 2, 3]},
                    {"field": "loc", "cond": "DWITHIN", "value": [[1.0, 2.0], 5.0]}
                ]
            }"#,
        )
        .unwrap();
        match &q.filters[0].node {
            FilterNode::Cond { values, .. } => assert_eq!(values.len(), 3),
            _ => panic!(),
        }
        match &q.filters[1].node {
            FilterNode::Cond { values, .. } => {
                assert_eq!(values[0], Variant::Point { x: 1.0, y: 2.0 });
                assert_eq!(values[1], Variant::Double(5.0));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_joins_and_aggregations() {
        let q = parse_dsl(
            r#"{
                "namespace": "orders",
                "aggregations": [{"type": "facet", "fields": ["status"], "limit": 3,
                                  "sort": [{"field": "count", "desc": true}]}],
                "join_queries": [{
                    "type": "left",
                    "on": [{"left_field": "book_id", "right_field": "id"}],
                    "namespace": "books"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(q.aggregations[0].agg_type, AggType::Facet);
        assert_eq!(q.join_queries[0].join_type, JoinType::Left);
        assert_eq!(q.join_queries[0].query.namespace, "books");
    }

    #[test]
    fn bad_condition_is_parse_error() {
        let err = parse_dsl(
            r#"{"namespace": "x", "filters": [{"field": "a", "cond": "WAT", "value": 1}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }
}
