//! # Query Model
//!
//! Parsed, surface-independent representation of a query. Both the SQL
//! dialect and the JSON DSL lower into this tree; the selector consumes it
//! directly. A query addresses exactly one namespace; merged sub-queries
//! and joined sub-queries carry their own target namespaces.
//!
//! ## Filter Tree
//!
//! The filter is a flat list of entries, each tagged with the operator
//! linking it to the accumulated result (`And`, `Or`, `Not`); brackets
//! nest the same structure recursively:
//!
//! ```text
//! WHERE a = 1 AND (b > 2 OR c < 3) AND NOT d = 4
//!   [And Cond(a=1), And Bracket[And Cond(b>2), Or Cond(c<3)], Not Cond(d=4)]
//! ```

pub mod dsl;

use serde::{Deserialize, Serialize};

use crate::index::CondType;
use crate::types::value::{Variant, VariantArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Cond {
        field: String,
        cond: CondType,
        values: VariantArray,
    },
    Bracket(Vec<Filter>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub op: OpType,
    pub node: FilterNode,
}

impl Filter {
    pub fn cond(op: OpType, field: &str, cond: CondType, values: VariantArray) -> Self {
        Self {
            op,
            node: FilterNode::Cond {
                field: field.to_string(),
                cond,
                values,
            },
        }
    }

    pub fn bracket(op: OpType, filters: Vec<Filter>) -> Self {
        Self {
            op,
            node: FilterNode::Bracket(filters),
        }
    }
}

/// One sort directive; `forced` values are hoisted to the top of the
/// result in the listed order before normal comparison applies.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortEntry {
    pub field: String,
    pub desc: bool,
    pub forced: Vec<Variant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggType {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Distinct,
    Facet,
}

impl AggType {
    pub fn as_str(self) -> &'static str {
        match self {
            AggType::Sum => "sum",
            AggType::Avg => "avg",
            AggType::Min => "min",
            AggType::Max => "max",
            AggType::Count => "count",
            AggType::Distinct => "distinct",
            AggType::Facet => "facet",
        }
    }
}

/// Sort directive inside a facet: by a facet field or by `count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggSortEntry {
    pub field: String,
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub agg_type: AggType,
    pub fields: Vec<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort: Vec<AggSortEntry>,
}

impl AggregateEntry {
    pub fn new(agg_type: AggType, fields: Vec<String>) -> Self {
        Self {
            agg_type,
            fields,
            limit: None,
            offset: 0,
            sort: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    OrInner,
}

/// Equi-predicate of a join: `left_field <cond> right_field`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinEntry {
    pub left_field: String,
    pub right_field: String,
    pub cond: CondType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedQuery {
    pub join_type: JoinType,
    pub on: Vec<JoinEntry>,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntry {
    pub field: String,
    pub value: Variant,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub namespace: String,
    pub filters: Vec<Filter>,
    pub sort: Vec<SortEntry>,
    pub aggregations: Vec<AggregateEntry>,
    pub merge_queries: Vec<Query>,
    pub join_queries: Vec<JoinedQuery>,
    pub update_fields: Vec<UpdateEntry>,
    pub select_filter: Vec<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub req_total: bool,
    pub explain: bool,
    /// `false` bypasses the query cache for this select.
    pub with_cache: bool,
}

impl Query {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            with_cache: true,
            ..Default::default()
        }
    }

    pub fn where_cond(mut self, field: &str, cond: CondType, values: VariantArray) -> Self {
        self.filters.push(Filter::cond(OpType::And, field, cond, values));
        self
    }

    pub fn or_where(mut self, field: &str, cond: CondType, values: VariantArray) -> Self {
        self.filters.push(Filter::cond(OpType::Or, field, cond, values));
        self
    }

    pub fn not_where(mut self, field: &str, cond: CondType, values: VariantArray) -> Self {
        self.filters.push(Filter::cond(OpType::Not, field, cond, values));
        self
    }

    pub fn bracket(mut self, op: OpType, filters: Vec<Filter>) -> Self {
        self.filters.push(Filter::bracket(op, filters));
        self
    }

    pub fn sort(mut self, field: &str, desc: bool) -> Self {
        self.sort.push(SortEntry {
            field: field.to_string(),
            desc,
            forced: Vec::new(),
        });
        self
    }

    pub fn sort_forced(mut self, field: &str, desc: bool, forced: Vec<Variant>) -> Self {
        self.sort.push(SortEntry {
            field: field.to_string(),
            desc,
            forced,
        });
        self
    }

    pub fn aggregate(mut self, entry: AggregateEntry) -> Self {
        self.aggregations.push(entry);
        self
    }

    pub fn join(mut self, join_type: JoinType, on: Vec<JoinEntry>, query: Query) -> Self {
        self.join_queries.push(JoinedQuery {
            join_type,
            on,
            query,
        });
        self
    }

    pub fn merge(mut self, query: Query) -> Self {
        self.merge_queries.push(query);
        self
    }

    pub fn set(mut self, field: &str, value: Variant) -> Self {
        self.update_fields.push(UpdateEntry {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn req_total(mut self) -> Self {
        self.req_total = true;
        self
    }

    pub fn explain(mut self) -> Self {
        self.explain = true;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.with_cache = false;
        self
    }

    /// Stable textual signature used as the query-cache key.
    pub fn signature(&self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(64);
        let _ = write!(out, "ns={};", self.namespace);
        write_filters(&mut out, &self.filters);
        for s in &self.sort {
            let _ = write!(out, "sort={}:{};", s.field, s.desc);
            for f in &s.forced {
                let _ = write!(out, "f={f};");
            }
        }
        let _ = write!(
            out,
            "lim={:?};off={};tot={}",
            self.limit, self.offset, self.req_total
        );
        for m in &self.merge_queries {
            let _ = write!(out, "|merge:{}", m.signature());
        }
        for j in &self.join_queries {
            let _ = write!(out, "|join{:?}:{}", j.join_type, j.query.signature());
            for e in &j.on {
                let _ = write!(out, "on={}{}{};", e.left_field, e.cond.as_str(), e.right_field);
            }
        }
        out
    }
}

fn write_filters(out: &mut String, filters: &[Filter]) {
    use std::fmt::Write;
    for f in filters {
        match &f.node {
            FilterNode::Cond {
                field,
                cond,
                values,
            } => {
                let _ = write!(out, "{:?} {} {} [", f.op, field, cond.as_str());
                for v in values {
                    let _ = write!(out, "{v},");
                }
                let _ = write!(out, "];");
            }
            FilterNode::Bracket(inner) => {
                let _ = write!(out, "{:?} (", f.op);
                write_filters(out, inner);
                let _ = write!(out, ");");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_filters() {
        let q = Query::new("books")
            .where_cond(
                "title",
                CondType::Eq,
                VariantArray::from_iter([Variant::string("A")]),
            )
            .sort("id", true)
            .limit(10);
        assert_eq!(q.filters.len(), 1);
        assert!(q.sort[0].desc);
        assert_eq!(q.limit, Some(10));
    }

    #[test]
    fn signature_distinguishes_queries() {
        let a = Query::new("books").where_cond(
            "id",
            CondType::Eq,
            VariantArray::from_iter([Variant::Int(1)]),
        );
        let b = Query::new("books").where_cond(
            "id",
            CondType::Eq,
            VariantArray::from_iter([Variant::Int(2)]),
        );
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.signature(), a.clone().signature());
    }
}
