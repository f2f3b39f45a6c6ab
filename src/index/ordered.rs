//! # Ordered (Tree) Index
//!
//! B-tree index over collated keys. Supports equality, set membership and
//! every range condition; iteration yields id-sets in key order, which is
//! what makes index-driven `ORDER BY` linear once sort orders are built.
//!
//! ## Sort Orders
//!
//! `update_sorted_ids` walks the tree once and assigns every live id a
//! dense rank (`ids2sorts`). A select that sorts by this index then emits
//! candidates by walking `sort_orders` instead of comparing rows. Any write
//! invalidates the permutation; the background optimizer rebuilds it in
//! chunks with cancellation checks in between.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::index::strings::StringPool;
use crate::index::{CondType, IdSet, KeyEntry, SelectKeyResult, SetMerge};
use crate::types::value::{Variant, VariantArray};
use crate::types::{CollateOpts, IdType, SortType, SORT_UNBUILT};

const SORT_BUILD_CHUNK: usize = 4096;

/// Tree key carrying the index collation so `Ord` is collation-aware.
#[derive(Debug, Clone)]
struct MapKey {
    v: Variant,
    collate: Arc<CollateOpts>,
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for MapKey {}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.v.total_cmp(&other.v, &self.collate)
    }
}

pub struct OrderedIndex {
    map: BTreeMap<MapKey, KeyEntry>,
    collate: Arc<CollateOpts>,
    /// Ids in key order; rebuilt by the optimizer.
    sort_orders: Option<Vec<IdType>>,
    /// Dense `id -> rank`; `SORT_UNBUILT` for ids absent from the index.
    ids2sorts: Vec<SortType>,
}

impl OrderedIndex {
    pub fn new(collate: CollateOpts) -> Self {
        Self {
            map: BTreeMap::new(),
            collate: Arc::new(collate),
            sort_orders: None,
            ids2sorts: Vec::new(),
        }
    }

    fn key(&self, v: &Variant) -> MapKey {
        MapKey {
            v: v.clone(),
            collate: self.collate.clone(),
        }
    }

    pub fn upsert(
        &mut self,
        keys: &VariantArray,
        id: IdType,
        strings: &mut StringPool,
    ) -> Result<VariantArray> {
        let mut stored = VariantArray::new();
        for key in keys {
            let key = intern_key(key, strings);
            self.map.entry(self.key(&key)).or_default().add(id);
            stored.push(key);
        }
        Ok(stored)
    }

    pub fn delete(
        &mut self,
        keys: &VariantArray,
        id: IdType,
        strings: &mut StringPool,
    ) -> Result<()> {
        for key in keys {
            let map_key = self.key(key);
            if let Some(entry) = self.map.get_mut(&map_key) {
                if entry.remove(id) {
                    self.map.remove(&map_key);
                }
            }
            if let Variant::String(s) = key {
                strings.release(s);
            }
        }
        Ok(())
    }

    pub fn select_key(
        &self,
        keys: &VariantArray,
        cond: CondType,
        _collate: &CollateOpts,
    ) -> Result<SelectKeyResult> {
        let mut sets: Vec<IdSet> = Vec::new();
        let mut merge = SetMerge::Union;
        match cond {
            CondType::Eq | CondType::Set | CondType::AllSet => {
                if cond == CondType::AllSet {
                    merge = SetMerge::Intersect;
                }
                if keys.is_empty() {
                    return Err(Error::params("condition requires at least one key"));
                }
                for key in keys {
                    match self.map.get(&self.key(key)) {
                        Some(entry) => sets.push(entry.ids().clone()),
                        None => sets.push(IdSet::new()),
                    }
                }
            }
            CondType::Lt | CondType::Le | CondType::Gt | CondType::Ge => {
                let key = keys
                    .first()
                    .ok_or_else(|| Error::params("range condition requires a key"))?;
                let k = self.key(key);
                let range: Box<dyn Iterator<Item = (&MapKey, &KeyEntry)> + '_> = match cond {
                    CondType::Lt => Box::new(self.map.range(..k)),
                    CondType::Le => Box::new(self.map.range(..=k)),
                    CondType::Gt => {
                        Box::new(self.map.range((Bound::Excluded(k), Bound::Unbounded)))
                    }
                    _ => Box::new(self.map.range(k..)),
                };
                for (_, entry) in range {
                    sets.push(entry.ids().clone());
                }
            }
            CondType::Range => {
                if keys.len() != 2 {
                    return Err(Error::params("RANGE condition requires two keys"));
                }
                let lo = self.key(&keys[0]);
                let hi = self.key(&keys[1]);
                if lo > hi {
                    return Ok(SelectKeyResult::union(sets));
                }
                for (_, entry) in self.map.range(lo..=hi) {
                    sets.push(entry.ids().clone());
                }
            }
            CondType::Any => {
                for entry in self.map.values() {
                    sets.push(entry.ids().clone());
                }
            }
            other => {
                return Err(Error::params(format!(
                    "ordered index does not support {}",
                    other.as_str()
                )))
            }
        }
        Ok(SelectKeyResult { id_sets: sets, merge })
    }

    /// Ids with keys strictly below `bound`; the TTL sweep.
    pub fn ids_below(&self, bound: &Variant) -> IdSet {
        let mut out = IdSet::new();
        for (_, entry) in self.map.range(..self.key(bound)) {
            out.extend_from_slice(entry.ids());
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn update_sorted_ids(&mut self, total_items: usize, ctx: &Context) -> Result<()> {
        let mut orders = Vec::with_capacity(total_items);
        let mut ranks = vec![SORT_UNBUILT; total_items];
        let mut since_check = 0usize;
        for entry in self.map.values() {
            for &id in entry.ids() {
                if (id as usize) < ranks.len() && ranks[id as usize] == SORT_UNBUILT {
                    ranks[id as usize] = orders.len() as SortType;
                    orders.push(id);
                }
                since_check += 1;
                if since_check >= SORT_BUILD_CHUNK {
                    since_check = 0;
                    ctx.check()?;
                }
            }
        }
        self.sort_orders = Some(orders);
        self.ids2sorts = ranks;
        Ok(())
    }

    pub fn invalidate_sort_orders(&mut self) {
        self.sort_orders = None;
        self.ids2sorts.clear();
    }

    pub fn sorted_rank(&self, id: IdType) -> Option<SortType> {
        self.sort_orders.as_ref()?;
        match self.ids2sorts.get(id as usize) {
            Some(&rank) if rank != SORT_UNBUILT => Some(rank),
            _ => None,
        }
    }

    pub fn sort_orders(&self) -> Option<&[IdType]> {
        self.sort_orders.as_deref()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_ids(&self) -> usize {
        self.map.values().map(KeyEntry::len).sum()
    }
}

pub(crate) fn intern_key(key: &Variant, strings: &mut StringPool) -> Variant {
    match key {
        Variant::String(s) => Variant::String(strings.intern(s)),
        Variant::Composite(fields) => Variant::Composite(
            fields.iter().map(|f| intern_key(f, strings)).collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollateMode;

    fn keys(vs: impl IntoIterator<Item = Variant>) -> VariantArray {
        vs.into_iter().collect()
    }

    fn build(prices: &[f64]) -> (OrderedIndex, StringPool) {
        let mut idx = OrderedIndex::new(CollateOpts::default());
        let mut pool = StringPool::new();
        for (id, &p) in prices.iter().enumerate() {
            idx.upsert(&keys([Variant::Double(p)]), id as IdType, &mut pool)
                .unwrap();
        }
        (idx, pool)
    }

    fn flatten(res: SelectKeyResult) -> IdSet {
        let mut ids: IdSet = res.id_sets.into_iter().flatten().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[test]
    fn range_conditions_cover_bounds() {
        let (idx, _) = build(&[1.0, 2.5, 3.0, 4.5, 10.0]);
        let ge = idx
            .select_key(
                &keys([Variant::Double(2.5)]),
                CondType::Ge,
                &CollateOpts::default(),
            )
            .unwrap();
        assert_eq!(flatten(ge), vec![1, 2, 3, 4]);
        let lt = idx
            .select_key(
                &keys([Variant::Double(10.0)]),
                CondType::Lt,
                &CollateOpts::default(),
            )
            .unwrap();
        assert_eq!(flatten(lt), vec![0, 1, 2, 3]);
        let range = idx
            .select_key(
                &keys([Variant::Double(2.5), Variant::Double(4.5)]),
                CondType::Range,
                &CollateOpts::default(),
            )
            .unwrap();
        assert_eq!(flatten(range), vec![1, 2, 3]);
    }

    #[test]
    fn collated_keys_merge_case_insensitively() {
        let mut idx = OrderedIndex::new(CollateOpts::new(CollateMode::Ascii));
        let mut pool = StringPool::new();
        idx.upsert(&keys([Variant::string("Rust")]), 1, &mut pool)
            .unwrap();
        idx.upsert(&keys([Variant::string("rust")]), 2, &mut pool)
            .unwrap();
        assert_eq!(idx.len(), 1);
        let res = idx
            .select_key(
                &keys([Variant::string("RUST")]),
                CondType::Eq,
                &CollateOpts::default(),
            )
            .unwrap();
        assert_eq!(flatten(res), vec![1, 2]);
    }

    #[test]
    fn sort_orders_rank_ids_in_key_order() {
        let (mut idx, _) = build(&[5.0, 1.0, 3.0]);
        idx.update_sorted_ids(3, &Context::new()).unwrap();
        assert_eq!(idx.sort_orders().unwrap(), &[1, 2, 0]);
        assert_eq!(idx.sorted_rank(1), Some(0));
        assert_eq!(idx.sorted_rank(0), Some(2));
        idx.invalidate_sort_orders();
        assert_eq!(idx.sorted_rank(1), None);
    }

    #[test]
    fn delete_drops_empty_keys() {
        let (mut idx, mut pool) = build(&[1.0, 1.0]);
        idx.delete(&keys([Variant::Double(1.0)]), 0, &mut pool)
            .unwrap();
        assert_eq!(idx.len(), 1);
        idx.delete(&keys([Variant::Double(1.0)]), 1, &mut pool)
            .unwrap();
        assert_eq!(idx.len(), 0);
    }
}
