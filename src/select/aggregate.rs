//! # Aggregation
//!
//! Single pass over the post-filter id-set. Numeric aggregates widen to
//! f64; facets buffer per-value-tuple counts and then apply the facet's
//! own sort, offset and limit.

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::namespace::NamespaceImpl;
use crate::query::{AggType, AggregateEntry};
use crate::select::results::{AggregationResult, FacetResult};
use crate::types::value::Variant;
use crate::types::{CollateOpts, IdType};

pub fn compute(
    ns: &NamespaceImpl,
    ids: &[IdType],
    entries: &[AggregateEntry],
) -> Result<Vec<AggregationResult>> {
    entries.iter().map(|e| compute_one(ns, ids, e)).collect()
}

fn compute_one(
    ns: &NamespaceImpl,
    ids: &[IdType],
    entry: &AggregateEntry,
) -> Result<AggregationResult> {
    let field = entry
        .fields
        .first()
        .ok_or_else(|| Error::params("aggregation requires a field"))?;

    let mut result = AggregationResult {
        agg_type: entry.agg_type,
        fields: entry.fields.clone(),
        value: None,
        distincts: Vec::new(),
        facets: Vec::new(),
    };

    match entry.agg_type {
        AggType::Count => result.value = Some(ids.len() as f64),
        AggType::Sum | AggType::Avg => {
            let mut sum = 0.0;
            let mut n = 0usize;
            for &id in ids {
                for v in ns.field_values(id, field)? {
                    if let Some(x) = numeric(&v) {
                        sum += x;
                        n += 1;
                    }
                }
            }
            result.value = Some(match entry.agg_type {
                AggType::Avg if n > 0 => sum / n as f64,
                AggType::Avg => 0.0,
                _ => sum,
            });
        }
        AggType::Min | AggType::Max => {
            let mut acc: Option<f64> = None;
            for &id in ids {
                for v in ns.field_values(id, field)? {
                    if let Some(x) = numeric(&v) {
                        acc = Some(match (acc, entry.agg_type) {
                            (None, _) => x,
                            (Some(a), AggType::Min) => a.min(x),
                            (Some(a), _) => a.max(x),
                        });
                    }
                }
            }
            result.value = acc;
        }
        AggType::Distinct => {
            let mut seen: Vec<Variant> = Vec::new();
            for &id in ids {
                for v in ns.field_values(id, field)? {
                    if !seen.contains(&v) {
                        seen.push(v);
                    }
                }
            }
            result.distincts = seen.iter().map(Variant::to_string).collect();
        }
        AggType::Facet => {
            result.facets = compute_facet(ns, ids, entry)?;
        }
    }
    Ok(result)
}

fn compute_facet(
    ns: &NamespaceImpl,
    ids: &[IdType],
    entry: &AggregateEntry,
) -> Result<Vec<FacetResult>> {
    let mut counts: HashMap<Vec<Variant>, usize> = HashMap::new();
    for &id in ids {
        let mut key = Vec::with_capacity(entry.fields.len());
        for field in &entry.fields {
            key.push(
                ns.field_values(id, field)?
                    .first()
                    .cloned()
                    .unwrap_or(Variant::Null),
            );
        }
        *counts.entry(key).or_default() += 1;
    }

    let mut facets: Vec<(Vec<Variant>, usize)> = counts.into_iter().collect();
    let collate = CollateOpts::default();
    facets.sort_by(|a, b| {
        for s in &entry.sort {
            let ord = if s.field == "count" {
                a.1.cmp(&b.1)
            } else {
                match entry.fields.iter().position(|f| f == &s.field) {
                    Some(pos) => a.0[pos].total_cmp(&b.0[pos], &collate),
                    None => std::cmp::Ordering::Equal,
                }
            };
            let ord = if s.desc { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        // Stable default: by value tuple ascending.
        a.0.cmp(&b.0)
    });

    Ok(facets
        .into_iter()
        .skip(entry.offset)
        .take(entry.limit.unwrap_or(usize::MAX))
        .map(|(values, count)| FacetResult {
            values: values.iter().map(Variant::to_string).collect(),
            count,
        })
        .collect())
}

fn numeric(v: &Variant) -> Option<f64> {
    match v {
        Variant::Bool(b) => Some(*b as i64 as f64),
        Variant::Int(x) => Some(*x as f64),
        Variant::Int64(x) => Some(*x as f64),
        Variant::Double(x) => Some(*x),
        _ => None,
    }
}
