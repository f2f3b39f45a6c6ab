//! # Selector
//!
//! Query execution for one namespace: index selection, iterator merge,
//! sorting, aggregation and joins.
//!
//! ## Pipeline
//!
//! ```text
//! filter tree ──> iterators (per group) ──> merge loop ──> id stream
//!                                                 │
//!        joins (inner/orInner) ──> sort ──> aggregate ──> offset/limit
//!                                                 │
//!                                     materialized QueryResults
//! ```
//!
//! The merge loop picks the cheapest positive iterator as the driver
//! (ordered-tree over hash over comparator on cost ties, declaration order
//! last) and probes the remaining groups per candidate. When the query
//! sorts by an index whose sort order is built and the namespace is fully
//! optimized, the driver is the sort-order permutation instead and the
//! output needs no comparator sort at all.

pub mod aggregate;
pub mod cache;
pub mod comparator;
pub mod iterator;
pub mod results;

use hashbrown::HashMap;

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::index::{CondType, IdSet, SelectKeyResult};
use crate::namespace::NamespaceImpl;
use crate::query::{Filter, FilterNode, JoinType, JoinedQuery, OpType, Query};
use crate::select::cache::{CachedIds, JoinCacheKey};
use crate::select::comparator::{forced_rank, Comparator};
use crate::select::iterator::{union_all, IteratorKind, SelectIterator};
use crate::select::results::{
    ExplainReport, IteratorReport, NsSnapshot, QueryResults, ResultRow,
};
use crate::types::value::Variant;
use crate::types::IdType;

const SCAN_CHECK_INTERVAL: usize = 1024;

/// Right-hand side of one joined query, locked by the caller.
pub struct JoinTarget<'a> {
    pub ns: &'a NamespaceImpl,
}

pub fn execute(
    ns: &NamespaceImpl,
    query: &Query,
    ctx: &Context,
    joins: &[JoinTarget<'_>],
) -> Result<QueryResults> {
    ctx.check()?;
    if joins.len() != query.join_queries.len() {
        return Err(Error::logic("join targets out of step with query"));
    }

    let mut explain = query.explain.then(ExplainReport::default);

    // Composite preference: a conjunction of equality predicates covered
    // by a composite index collapses into one composite probe.
    let filters = fold_composite_filters(ns, &query.filters);

    // Plan: one iterator per top-level group, full-text resolved up front.
    let mut plan = build_groups(ns, &filters, ctx)?;

    let cacheable = query.with_cache
        && !query.explain
        && plan.ft_procs.is_none()
        && query.join_queries.is_empty();
    let version = ns.version();
    if cacheable {
        if let Some(hit) = ns.query_cache.get(&query.signature(), version) {
            return materialize(ns, query, hit.ids, hit.total, &plan, None, joins, ctx);
        }
    }

    // Sort-order fast path: drive candidates straight from the built
    // permutation so the output is already sorted.
    let sort_stream = sort_order_stream(ns, query, &plan);
    let mut ids = run_merge_loop(ns, &mut plan.groups, ctx, sort_stream.as_deref())?;
    let sorted_by_stream = sort_stream.is_some();

    // orInner joins extend the filter result; inner joins restrict it.
    apply_joins_to_filter(ns, query, joins, &mut ids, ctx)?;

    if !sorted_by_stream {
        sort_ids(ns, query, &plan, &mut ids)?;
    }

    let total = ids.len();

    if let Some(report) = &mut explain {
        report.loop_items = total;
        report.sort_index = sort_stream_index(ns, query, &plan);
        for group in &plan.groups {
            report.iterators.push(IteratorReport {
                field: group.field.clone(),
                method: group.method.clone(),
                keys: group.keys(),
                matched: group.matched,
                cost: group.cost,
            });
        }
    }

    if cacheable {
        ns.query_cache.put(
            query.signature(),
            CachedIds {
                ids: ids.clone(),
                total,
                version,
            },
        );
    }

    materialize(ns, query, ids, total, &plan, explain, joins, ctx)
}

struct Plan {
    groups: Vec<SelectIterator>,
    /// Full-text relevancy per id, when a full-text condition is present.
    ft_procs: Option<HashMap<IdType, i32>>,
}

/// Replace an AND-run of single-value equality conditions with one probe
/// of a composite index covering all of them. Entries not covered stay.
fn fold_composite_filters(ns: &NamespaceImpl, filters: &[Filter]) -> Vec<Filter> {
    let mut out: Vec<Filter> = filters.to_vec();
    for index in &ns.indexes {
        if !index.def.is_composite() {
            continue;
        }
        let member_names: Vec<&str> = index
            .fields
            .iter()
            .filter_map(|&f| ns.payload_type.field(f).map(|pf| pf.name.as_str()))
            .collect();
        if member_names.len() != index.fields.len() {
            continue;
        }
        let mut positions = Vec::with_capacity(member_names.len());
        for name in &member_names {
            let found = out.iter().position(|f| {
                f.op == OpType::And
                    && matches!(
                        &f.node,
                        FilterNode::Cond { field, cond, values }
                            if field == name && *cond == CondType::Eq && values.len() == 1
                    )
            });
            match found {
                Some(pos) if !positions.contains(&pos) => positions.push(pos),
                _ => {
                    positions.clear();
                    break;
                }
            }
        }
        if positions.is_empty() {
            continue;
        }
        let members: Vec<Variant> = positions
            .iter()
            .map(|&pos| match &out[pos].node {
                FilterNode::Cond { values, .. } => values[0].clone(),
                FilterNode::Bracket(_) => Variant::Null,
            })
            .collect();
        let mut remove = positions.clone();
        remove.sort_unstable_by(|a, b| b.cmp(a));
        for pos in remove {
            out.remove(pos);
        }
        out.push(Filter::cond(
            OpType::And,
            index.name(),
            CondType::Eq,
            crate::types::value::VariantArray::from_iter([Variant::Composite(members)]),
        ));
    }
    out
}

fn build_groups(ns: &NamespaceImpl, filters: &[Filter], ctx: &Context) -> Result<Plan> {
    let universe = ns.items.len();
    let mut groups: Vec<SelectIterator> = Vec::new();
    let mut ft_procs: Option<HashMap<IdType, i32>> = None;

    for filter in filters {
        let or_continuation = filter.op == OpType::Or;
        let entry = match &filter.node {
            FilterNode::Cond {
                field,
                cond,
                values,
            } => {
                match ns.index_pos_by_field(field) {
                    Some(pos) if ns.indexes[pos].is_fulltext() => {
                        if *cond != CondType::Eq || or_continuation {
                            return Err(Error::params(
                                "fulltext condition must be a top-level AND equality",
                            ));
                        }
                        if ft_procs.is_some() {
                            return Err(Error::params(
                                "only one fulltext condition per query",
                            ));
                        }
                        let pattern = values
                            .first()
                            .and_then(Variant::as_str)
                            .ok_or_else(|| Error::params("fulltext query must be a string"))?;
                        let matches = ns.ft_search(pos, pattern, ctx)?;
                        let mut set: IdSet = matches.iter().map(|m| m.id).collect();
                        set.sort_unstable();
                        ft_procs = Some(matches.iter().map(|m| (m.id, m.proc)).collect());
                        SelectIterator::from_sets(
                            filter.op,
                            SelectKeyResult::union(vec![set]),
                            IteratorKind::Unordered,
                            field,
                            "fulltext",
                        )
                    }
                    Some(pos) if ns.indexes[pos].supports(*cond) => {
                        let index = &ns.indexes[pos];
                        let converted = ns.convert_keys_for(pos, values)?;
                        let result = index.select_key(&converted, *cond, ctx)?;
                        let kind = if index.is_ordered() {
                            IteratorKind::Forward
                        } else {
                            IteratorKind::Unordered
                        };
                        SelectIterator::from_sets(filter.op, result, kind, field, index.name())
                    }
                    _ => {
                        let cmp = Comparator::new(ns, field, *cond, values.clone())?;
                        SelectIterator::from_comparator(filter.op, cmp, universe)
                    }
                }
            }
            FilterNode::Bracket(inner) => {
                // Brackets compose recursively: evaluate the sub-tree to a
                // set and treat it as one unordered iterator.
                let mut sub = build_groups(ns, inner, ctx)?;
                if sub.ft_procs.is_some() {
                    return Err(Error::params(
                        "fulltext condition must be a top-level AND equality",
                    ));
                }
                let set = run_merge_loop(ns, &mut sub.groups, ctx, None)?;
                SelectIterator::from_sets(
                    filter.op,
                    SelectKeyResult::union(vec![set]),
                    IteratorKind::Unordered,
                    "()",
                    "bracket",
                )
            }
        };

        // An OR entry merges into the preceding group.
        if or_continuation {
            let Some(prev) = groups.last_mut() else {
                return Err(Error::params("query cannot start with OR"));
            };
            merge_or(prev, entry);
        } else {
            groups.push(entry);
        }
    }

    Ok(Plan { groups, ft_procs })
}

fn merge_or(into: &mut SelectIterator, from: SelectIterator) {
    into.kind = IteratorKind::Unordered;
    into.method = format!("{} or {}", into.method, from.method);
    into.cost += from.cost;
    into.absorb(from);
}

/// Drive candidates and probe every other group.
fn run_merge_loop(
    ns: &NamespaceImpl,
    groups: &mut [SelectIterator],
    ctx: &Context,
    sort_stream: Option<&[IdType]>,
) -> Result<IdSet> {
    let mut out = IdSet::new();
    let mut since_check = 0usize;
    let mut check = |ctx: &Context| -> Result<()> {
        since_check += 1;
        if since_check >= SCAN_CHECK_INTERVAL {
            since_check = 0;
            ctx.check()?;
        }
        Ok(())
    };

    // Driver election: cheapest positive id-backed group, ladder on ties.
    // A group mixing comparators into an OR run cannot drive: its id sets
    // do not cover the comparator-matched rows.
    let driver = groups
        .iter()
        .enumerate()
        .filter(|(_, g)| g.op != OpType::Not && g.has_ids() && g.comparators.is_empty())
        .min_by_key(|(pos, g)| (g.cost, g.category_rank(), *pos))
        .map(|(pos, _)| pos);

    if let Some(stream) = sort_stream {
        for &id in stream {
            check(ctx)?;
            if ns.items.is_free(id) {
                continue;
            }
            if accepts_all(ns, groups, id, ctx)? {
                out.push(id);
            }
        }
        return Ok(out);
    }

    match driver {
        Some(driver_pos) => {
            let mut min_id = 0;
            loop {
                check(ctx)?;
                let Some(id) = groups[driver_pos].next(min_id) else {
                    break;
                };
                min_id = id + 1;
                if ns.items.is_free(id) {
                    continue;
                }
                let mut ok = true;
                for (pos, group) in groups.iter_mut().enumerate() {
                    if pos == driver_pos {
                        continue;
                    }
                    let hit = group.accepts(ns, id, ctx)?;
                    if (group.op == OpType::Not) == hit {
                        ok = false;
                        break;
                    }
                }
                if ok {
                    groups[driver_pos].matched += 1;
                    out.push(id);
                }
            }
        }
        None => {
            // Comparator-only (or NOT-only) plan: full scan.
            for (id, _) in ns.items.iter_live() {
                check(ctx)?;
                if accepts_all(ns, groups, id, ctx)? {
                    out.push(id);
                }
            }
        }
    }
    Ok(out)
}

fn accepts_all(
    ns: &NamespaceImpl,
    groups: &mut [SelectIterator],
    id: IdType,
    ctx: &Context,
) -> Result<bool> {
    for group in groups.iter_mut() {
        let hit = group.accepts(ns, id, ctx)?;
        if (group.op == OpType::Not) == hit {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The built sort-order permutation to drive from, when applicable.
/// Joins reorder the candidate set afterwards, so they disqualify it.
fn sort_order_stream(ns: &NamespaceImpl, query: &Query, plan: &Plan) -> Option<Vec<IdType>> {
    if plan.ft_procs.is_some() || query.sort.len() != 1 || !query.join_queries.is_empty() {
        return None;
    }
    let entry = &query.sort[0];
    if !entry.forced.is_empty() || !ns.sort_orders_ready() {
        return None;
    }
    let pos = ns.index_pos_by_field(&entry.field)?;
    let orders = ns.indexes[pos].sort_orders()?;
    let mut stream: Vec<IdType> = orders.to_vec();
    if entry.desc {
        stream.reverse();
    }
    // Rows without a key in this index (null field) sort like the
    // comparator path: nulls first ascending, last descending.
    let index = &ns.indexes[pos];
    let nulls: Vec<IdType> = ns
        .items
        .iter_live()
        .map(|(id, _)| id)
        .filter(|&id| index.sorted_rank(id).is_none())
        .collect();
    if entry.desc {
        stream.extend(nulls);
    } else {
        let mut with_nulls = nulls;
        with_nulls.extend(stream);
        stream = with_nulls;
    }
    Some(stream)
}

fn sort_stream_index(ns: &NamespaceImpl, query: &Query, plan: &Plan) -> Option<String> {
    sort_order_stream(ns, query, plan).and_then(|_| {
        query
            .sort
            .first()
            .and_then(|s| ns.index_pos_by_field(&s.field))
            .map(|pos| ns.indexes[pos].name().to_string())
    })
}

/// Comparator sort with forced-order hoisting and id-ascending tie-break.
fn sort_ids(ns: &NamespaceImpl, query: &Query, plan: &Plan, ids: &mut IdSet) -> Result<()> {
    if query.sort.is_empty() {
        if let Some(procs) = &plan.ft_procs {
            ids.sort_by(|a, b| {
                let pa = procs.get(a).copied().unwrap_or(0);
                let pb = procs.get(b).copied().unwrap_or(0);
                pb.cmp(&pa).then(a.cmp(b))
            });
        }
        return Ok(());
    }

    struct Key {
        forced: usize,
        values: Vec<Variant>,
    }
    let collates: Vec<_> = query.sort.iter().map(|s| ns.collate_for(&s.field)).collect();
    let mut keys: Vec<(IdType, Key)> = Vec::with_capacity(ids.len());
    for &id in ids.iter() {
        let mut values = Vec::with_capacity(query.sort.len());
        for entry in &query.sort {
            values.push(
                ns.field_values(id, &entry.field)?
                    .first()
                    .cloned()
                    .unwrap_or(Variant::Null),
            );
        }
        let forced = match &query.sort[0].forced[..] {
            [] => usize::MAX,
            forced => forced_rank(&values[0], forced, &collates[0]).unwrap_or(usize::MAX),
        };
        keys.push((id, Key { forced, values }));
    }

    keys.sort_by(|(ida, a), (idb, b)| {
        a.forced.cmp(&b.forced).then_with(|| {
            for ((entry, collate), (va, vb)) in query
                .sort
                .iter()
                .zip(&collates)
                .zip(a.values.iter().zip(b.values.iter()))
            {
                let mut ord = va.total_cmp(vb, collate);
                if entry.desc {
                    ord = ord.reverse();
                }
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            ida.cmp(idb)
        })
    });
    *ids = keys.into_iter().map(|(id, _)| id).collect();
    Ok(())
}

/// Inner joins restrict the candidate set; orInner joins extend it with
/// live rows matched by the joined sub-query.
fn apply_joins_to_filter(
    ns: &NamespaceImpl,
    query: &Query,
    joins: &[JoinTarget<'_>],
    ids: &mut IdSet,
    ctx: &Context,
) -> Result<()> {
    let has_or_inner = query
        .join_queries
        .iter()
        .any(|j| j.join_type == JoinType::OrInner);
    if has_or_inner {
        let mut extra = IdSet::new();
        let in_result: IdSet = {
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            sorted
        };
        for (id, _) in ns.items.iter_live() {
            if in_result.binary_search(&id).is_ok() {
                continue;
            }
            for (jq, target) in query.join_queries.iter().zip(joins) {
                if jq.join_type != JoinType::OrInner {
                    continue;
                }
                if !join_rows(ns, target, jq, id, ctx)?.is_empty() {
                    extra.push(id);
                    break;
                }
            }
        }
        let merged = union_all(&[in_result, extra]);
        *ids = merged;
    }

    for (jq, target) in query.join_queries.iter().zip(joins) {
        if jq.join_type != JoinType::Inner {
            continue;
        }
        let mut kept = IdSet::with_capacity(ids.len());
        for &id in ids.iter() {
            ctx.check()?;
            if !join_rows(ns, target, jq, id, ctx)?.is_empty() {
                kept.push(id);
            }
        }
        *ids = kept;
    }
    Ok(())
}

/// Execute (or fetch from the join cache) the right-hand sub-query for one
/// left row.
fn join_rows(
    ns: &NamespaceImpl,
    target: &JoinTarget<'_>,
    jq: &JoinedQuery,
    id: IdType,
    ctx: &Context,
) -> Result<IdSet> {
    if !jq.query.join_queries.is_empty() {
        return Err(Error::params("joined sub-queries cannot join further"));
    }
    let mut sub = jq.query.clone();
    let mut key_repr = String::new();
    for on in &jq.on {
        let left_values = ns.field_values(id, &on.left_field)?;
        if left_values.is_empty() {
            return Ok(IdSet::new());
        }
        key_repr.push_str(&format!("{}={};", on.left_field, left_values[0]));
        sub = sub.where_cond(&on.right_field, on.cond, left_values);
    }

    let cache_key = JoinCacheKey {
        ns: target.ns.name.clone(),
        signature: jq.query.signature(),
        key: key_repr,
    };
    let right_version = target.ns.version();
    if let Some(hit) = target.ns.join_cache.get(&cache_key, right_version) {
        return Ok(hit.ids);
    }

    let results = execute(target.ns, &sub, ctx, &[])?;
    let ids = results.ids();
    target.ns.join_cache.put(
        cache_key,
        CachedIds {
            ids: ids.clone(),
            total: results.total_count,
            version: right_version,
        },
    );
    Ok(ids)
}

#[allow(clippy::too_many_arguments)]
fn materialize(
    ns: &NamespaceImpl,
    query: &Query,
    ids: IdSet,
    total: usize,
    plan: &Plan,
    explain: Option<ExplainReport>,
    joins: &[JoinTarget<'_>],
    ctx: &Context,
) -> Result<QueryResults> {
    // Aggregations and distinct run over the whole filtered set.
    let aggregations = aggregate::compute(ns, &ids, &query.aggregations)?;
    let mut ids = ids;
    for agg in &query.aggregations {
        if agg.agg_type == crate::query::AggType::Distinct {
            let field = agg
                .fields
                .first()
                .ok_or_else(|| Error::params("distinct requires a field"))?;
            let mut seen: Vec<Variant> = Vec::new();
            let mut kept = IdSet::new();
            for &id in &ids {
                let value = ns
                    .field_values(id, field)?
                    .first()
                    .cloned()
                    .unwrap_or(Variant::Null);
                if !seen.contains(&value) {
                    seen.push(value);
                    kept.push(id);
                }
            }
            ids = kept;
        }
    }

    let window: Vec<IdType> = ids
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();

    let mut rows = Vec::with_capacity(window.len());
    for id in window {
        ctx.check()?;
        let payload = ns
            .items
            .get(id)
            .ok_or_else(|| Error::new(ErrorKind::Logic, "live id vanished during select"))?
            .clone();
        let lsn = ns.items.lsn(id).unwrap_or_default();
        let proc = plan
            .ft_procs
            .as_ref()
            .and_then(|p| p.get(&id).copied())
            .unwrap_or(0);

        // Left and inner joins attach their rows to the output.
        let mut joined = Vec::with_capacity(query.join_queries.len());
        for (jq, target) in query.join_queries.iter().zip(joins) {
            if jq.join_type == JoinType::OrInner {
                joined.push(Vec::new());
                continue;
            }
            let right_ids = join_rows(ns, target, jq, id, ctx)?;
            let mut bucket = Vec::with_capacity(right_ids.len());
            for rid in right_ids {
                if let Some(rp) = target.ns.items.get(rid) {
                    bucket.push(ResultRow {
                        id: rid,
                        lsn: target.ns.items.lsn(rid).unwrap_or_default(),
                        proc: 0,
                        payload: rp.clone(),
                        joined: Vec::new(),
                    });
                }
            }
            joined.push(bucket);
        }

        rows.push(ResultRow {
            id,
            lsn,
            proc,
            payload,
            joined,
        });
    }

    Ok(QueryResults {
        ns: ns.snapshot(),
        rows,
        joined_ns: joins.iter().map(|j| j.ns.snapshot()).collect(),
        total_count: total,
        aggregations,
        explain,
        select_filter: query.select_filter.clone(),
    })
}
