//! # Select Iterators
//!
//! One iterator per top-level filter group. Categories:
//!
//! - **Forward**: id-ordered streams from tree/hash lookups; drives the
//!   merge loop or answers `next(min_id)` probes by binary search.
//! - **Unordered**: pre-merged id sets (OR accumulations, bracket
//!   results); same probing, one set.
//! - **Comparator**: no id stream at all, evaluated per candidate row.
//!
//! The planner sorts iterators by ascending cost before merging; the
//! tie-break ladder is ordered-tree over hash over comparator, then the
//! smaller expected result, then declaration order.

use crate::context::Context;
use crate::error::Result;
use crate::index::{IdSet, SelectKeyResult, SetMerge};
use crate::namespace::NamespaceImpl;
use crate::query::OpType;
use crate::select::comparator::Comparator;
use crate::types::IdType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IteratorKind {
    Forward,
    Unordered,
    Comparator,
}

pub struct SelectIterator {
    pub op: OpType,
    pub kind: IteratorKind,
    /// Sorted ascending id sets; probed with `lower_bound`.
    sets: Vec<IdSet>,
    pub comparators: Vec<Comparator>,
    /// Cursor per set for the driving scan.
    positions: Vec<usize>,
    pub cost: usize,
    pub field: String,
    pub method: String,
    pub matched: usize,
}

impl SelectIterator {
    pub fn from_sets(
        op: OpType,
        result: SelectKeyResult,
        kind: IteratorKind,
        field: &str,
        method: &str,
    ) -> Self {
        let sets = match result.merge {
            SetMerge::Union => result.id_sets,
            SetMerge::Intersect => vec![intersect_all(result.id_sets)],
        };
        let cost = sets.iter().map(Vec::len).sum();
        Self {
            op,
            kind,
            positions: vec![0; sets.len()],
            sets,
            comparators: Vec::new(),
            cost,
            field: field.to_string(),
            method: method.to_string(),
            matched: 0,
        }
    }

    pub fn from_comparator(op: OpType, cmp: Comparator, universe: usize) -> Self {
        Self {
            op,
            kind: IteratorKind::Comparator,
            sets: Vec::new(),
            field: cmp.field.clone(),
            comparators: vec![cmp],
            positions: Vec::new(),
            cost: universe,
            method: "comparator".to_string(),
            matched: 0,
        }
    }

    /// Fold another iterator into this one (an `OR` continuation): the
    /// group then accepts an id when either side does.
    pub fn absorb(&mut self, other: SelectIterator) {
        for set in other.sets {
            self.sets.push(set);
            self.positions.push(0);
        }
        self.comparators.extend(other.comparators);
        if !self.comparators.is_empty() {
            self.kind = IteratorKind::Unordered;
        }
    }

    pub fn keys(&self) -> usize {
        self.sets.len()
    }

    pub fn has_ids(&self) -> bool {
        !self.sets.is_empty()
    }

    /// Smallest id >= `min_id` across all sets; advances internal cursors.
    pub fn next(&mut self, min_id: IdType) -> Option<IdType> {
        let mut best: Option<IdType> = None;
        for (set, pos) in self.sets.iter().zip(self.positions.iter_mut()) {
            *pos += set[*pos..].partition_point(|&id| id < min_id);
            if let Some(&id) = set.get(*pos) {
                best = Some(best.map_or(id, |b| b.min(id)));
            }
        }
        best
    }

    /// Membership test for AND/NOT probing: does this group accept `id`?
    pub fn accepts(&mut self, ns: &NamespaceImpl, id: IdType, ctx: &Context) -> Result<bool> {
        for set in &self.sets {
            if set.binary_search(&id).is_ok() {
                self.matched += 1;
                return Ok(true);
            }
        }
        for cmp in &self.comparators {
            ctx.check()?;
            if cmp.matches(ns, id)? {
                self.matched += 1;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Ladder rank for cost ties: tree < hash < comparator.
    pub fn category_rank(&self) -> u8 {
        match self.kind {
            IteratorKind::Forward => 0,
            IteratorKind::Unordered => 1,
            IteratorKind::Comparator => 2,
        }
    }
}

fn intersect_all(sets: Vec<IdSet>) -> IdSet {
    let mut iter = sets.into_iter();
    let Some(mut acc) = iter.next() else {
        return IdSet::new();
    };
    for set in iter {
        acc.retain(|id| set.binary_search(id).is_ok());
    }
    acc
}

/// Union of sorted sets into one sorted set.
pub fn union_all(sets: &[IdSet]) -> IdSet {
    let mut out: IdSet = sets.iter().flatten().copied().collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Sorted intersection of two sorted sets.
pub fn intersect(a: &IdSet, b: &IdSet) -> IdSet {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .copied()
        .filter(|id| large.binary_search(id).is_ok())
        .collect()
}

/// `a \ b` over sorted sets.
pub fn subtract(a: &IdSet, b: &IdSet) -> IdSet {
    a.iter()
        .copied()
        .filter(|id| b.binary_search(id).is_err())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SelectKeyResult;

    fn forward(sets: Vec<IdSet>) -> SelectIterator {
        SelectIterator::from_sets(
            OpType::And,
            SelectKeyResult::union(sets),
            IteratorKind::Forward,
            "f",
            "test",
        )
    }

    #[test]
    fn next_merges_sets_in_order() {
        let mut it = forward(vec![vec![1, 5, 9], vec![2, 5, 7]]);
        let mut out = Vec::new();
        let mut min = 0;
        while let Some(id) = it.next(min) {
            out.push(id);
            min = id + 1;
        }
        assert_eq!(out, vec![1, 2, 5, 7, 9]);
    }

    #[test]
    fn next_honors_min_id_probe() {
        let mut it = forward(vec![vec![1, 5, 9]]);
        assert_eq!(it.next(6), Some(9));
        assert_eq!(it.next(10), None);
    }

    #[test]
    fn set_algebra() {
        assert_eq!(union_all(&[vec![1, 3], vec![2, 3]]), vec![1, 2, 3]);
        assert_eq!(intersect(&vec![1, 2, 3], &vec![2, 3, 4]), vec![2, 3]);
        assert_eq!(subtract(&vec![1, 2, 3], &vec![2]), vec![1, 3]);
    }

    #[test]
    fn category_ladder() {
        let a = forward(vec![vec![1]]);
        assert_eq!(a.category_rank(), 0);
    }
}
