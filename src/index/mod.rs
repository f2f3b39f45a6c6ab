//! # Index Layer
//!
//! Every namespace owns an ordered list of [`Index`] objects, polymorphic
//! over access pattern: ordered tree, hash, dense column store, point
//! index, and the two full-text variants. The planner talks to them through
//! one dispatch surface; fast paths match on the variant tag directly.
//!
//! ## Contract
//!
//! - `upsert(keys, id)` registers every extracted key of a row and returns
//!   the stored (interned) keys so the caller can share string storage.
//! - `delete(keys, id)` is the exact inverse.
//! - `select_key(keys, cond, ctx)` resolves a condition into sorted id-sets
//!   or rejects it with a `Params` error, in which case the planner falls
//!   back to a row-wise comparator.
//! - `update_sorted_ids` builds the dense sort-order permutation during
//!   background optimization.
//!
//! ## Invariants
//!
//! For any live id `i` and non-sparse index over column `c`: every key
//! extracted from `i.c` is present and its id-set contains `i`; id-sets are
//! sorted ascending. Both are relied on by the merge step, which walks sets
//! with `lower_bound` probes.

pub mod fulltext;
pub mod ordered;
pub mod rtree;
pub mod store;
pub mod strings;
pub mod unordered;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::types::value::{Variant, VariantArray};
use crate::types::{CollateOpts, IdType, IndexType, KeyValueType, SortType};

use fulltext::{fast::FastFtIndex, fuzzy::FuzzyFtIndex};
use ordered::OrderedIndex;
use rtree::GeometryIndex;
use store::StoreIndex;
use strings::StringPool;
use unordered::HashIndex;

/// Sorted ascending set of item ids.
pub type IdSet = Vec<IdType>;

/// Condition of one filter entry, resolved against an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CondType {
    Any,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Range,
    Set,
    AllSet,
    Empty,
    Like,
    DWithin,
}

impl CondType {
    pub fn as_str(self) -> &'static str {
        match self {
            CondType::Any => "ANY",
            CondType::Eq => "=",
            CondType::Lt => "<",
            CondType::Le => "<=",
            CondType::Gt => ">",
            CondType::Ge => ">=",
            CondType::Range => "RANGE",
            CondType::Set => "IN",
            CondType::AllSet => "ALLSET",
            CondType::Empty => "EMPTY",
            CondType::Like => "LIKE",
            CondType::DWithin => "DWITHIN",
        }
    }
}

/// Options attached to an index declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOpts {
    #[serde(default)]
    pub pk: bool,
    /// Keys come from the CJSON body by json path instead of a payload field.
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub collate: CollateOpts,
    /// TTL in seconds for `IndexType::Ttl` indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<i64>,
}

/// Persistent definition of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    /// One path for plain indexes, several for composite ones.
    pub json_paths: Vec<String>,
    pub field_type: KeyValueType,
    pub index_type: IndexType,
    #[serde(default)]
    pub opts: IndexOpts,
}

impl IndexDef {
    pub fn new(name: &str, index_type: IndexType, field_type: KeyValueType) -> Self {
        let (name, json_paths) = parse_composite_expr(name);
        Self {
            name,
            json_paths,
            field_type,
            index_type,
            opts: IndexOpts::default(),
        }
    }

    pub fn pk(mut self) -> Self {
        self.opts.pk = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.opts.sparse = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.opts.is_array = true;
        self
    }

    pub fn collate(mut self, collate: CollateOpts) -> Self {
        self.opts.collate = collate;
        self
    }

    pub fn expire_after(mut self, seconds: i64) -> Self {
        self.opts.expire_after = Some(seconds);
        self
    }

    pub fn is_composite(&self) -> bool {
        self.json_paths.len() > 1
    }
}

/// `f1+f2=alias` declares a composite index named `alias` over the listed
/// fields; without `=alias` the expression itself is the name.
fn parse_composite_expr(expr: &str) -> (String, Vec<String>) {
    let (fields_part, alias) = match expr.split_once('=') {
        Some((f, a)) => (f, Some(a)),
        None => (expr, None),
    };
    let paths: Vec<String> = fields_part.split('+').map(|s| s.trim().to_string()).collect();
    let name = alias.map(str::to_string).unwrap_or_else(|| expr.to_string());
    (name, paths)
}

/// Index value: sorted id-set. Auxiliary payload (full-text scores) lives in
/// the full-text variants' own structures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyEntry {
    ids: IdSet,
}

impl KeyEntry {
    pub fn add(&mut self, id: IdType) {
        if let Err(pos) = self.ids.binary_search(&id) {
            self.ids.insert(pos, id);
        }
    }

    /// Returns true when the entry became empty.
    pub fn remove(&mut self, id: IdType) -> bool {
        if let Ok(pos) = self.ids.binary_search(&id) {
            self.ids.remove(pos);
        }
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &IdSet {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// How the id-sets of one `select_key` answer combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMerge {
    Union,
    Intersect,
}

/// Result of resolving a condition against an index.
#[derive(Debug, Clone)]
pub struct SelectKeyResult {
    pub id_sets: Vec<IdSet>,
    pub merge: SetMerge,
}

impl SelectKeyResult {
    pub fn union(id_sets: Vec<IdSet>) -> Self {
        Self {
            id_sets,
            merge: SetMerge::Union,
        }
    }

    pub fn total_ids(&self) -> usize {
        self.id_sets.iter().map(Vec::len).sum()
    }
}

/// Memory accounting for one index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexMemStat {
    pub name: String,
    pub unique_keys: usize,
    pub ids: usize,
    pub sort_orders_built: bool,
}

pub(crate) enum IndexVariant {
    Ordered(OrderedIndex),
    Hash(HashIndex),
    Store(StoreIndex),
    Geometry(GeometryIndex),
    FtFast(Box<FastFtIndex>),
    FtFuzzy(Box<FuzzyFtIndex>),
}

/// One namespace index: definition, resolved payload fields and the
/// variant-specific key structure.
pub struct Index {
    pub def: IndexDef,
    /// Payload field positions backing this index; empty for sparse indexes.
    pub fields: Vec<usize>,
    pub(crate) variant: IndexVariant,
}

impl Index {
    pub fn new(def: IndexDef, fields: Vec<usize>) -> Result<Self> {
        let collate = def.opts.collate.clone();
        let variant = match def.index_type {
            IndexType::Tree | IndexType::Ttl => {
                IndexVariant::Ordered(OrderedIndex::new(collate))
            }
            IndexType::Hash => IndexVariant::Hash(HashIndex::new(collate)),
            IndexType::ColumnStore => IndexVariant::Store(StoreIndex::new()),
            IndexType::RTree => {
                if def.field_type != KeyValueType::Point {
                    return Err(Error::params(format!(
                        "rtree index '{}' requires point field type",
                        def.name
                    )));
                }
                IndexVariant::Geometry(GeometryIndex::new())
            }
            IndexType::FullTextFast => {
                let mut ft = FastFtIndex::new(Default::default());
                ft.set_field_names(def.json_paths.clone());
                IndexVariant::FtFast(Box::new(ft))
            }
            IndexType::FullTextFuzzy => {
                IndexVariant::FtFuzzy(Box::new(FuzzyFtIndex::new(Default::default())))
            }
        };
        if def.index_type == IndexType::Ttl && def.opts.expire_after.is_none() {
            return Err(Error::params(format!(
                "ttl index '{}' requires expire_after",
                def.name
            )));
        }
        Ok(Self {
            def,
            fields,
            variant,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self.variant, IndexVariant::Ordered(_))
    }

    pub fn is_fulltext(&self) -> bool {
        self.def.index_type.is_fulltext()
    }

    pub fn supports(&self, cond: CondType) -> bool {
        match &self.variant {
            IndexVariant::Ordered(_) => matches!(
                cond,
                CondType::Eq
                    | CondType::Set
                    | CondType::AllSet
                    | CondType::Lt
                    | CondType::Le
                    | CondType::Gt
                    | CondType::Ge
                    | CondType::Range
                    | CondType::Any
            ),
            IndexVariant::Hash(_) => {
                matches!(cond, CondType::Eq | CondType::Set | CondType::AllSet | CondType::Any)
            }
            IndexVariant::Store(_) => false,
            IndexVariant::Geometry(_) => cond == CondType::DWithin,
            IndexVariant::FtFast(_) | IndexVariant::FtFuzzy(_) => cond == CondType::Eq,
        }
    }

    /// Register keys of a row; returns the stored (string-interned) keys.
    pub fn upsert(
        &mut self,
        keys: &VariantArray,
        id: IdType,
        strings: &mut StringPool,
    ) -> Result<VariantArray> {
        match &mut self.variant {
            IndexVariant::Ordered(idx) => idx.upsert(keys, id, strings),
            IndexVariant::Hash(idx) => idx.upsert(keys, id, strings),
            IndexVariant::Store(idx) => idx.upsert(keys, id),
            IndexVariant::Geometry(idx) => idx.upsert(keys, id),
            IndexVariant::FtFast(idx) => idx.upsert(keys, id),
            IndexVariant::FtFuzzy(idx) => idx.upsert(keys, id),
        }
    }

    pub fn delete(
        &mut self,
        keys: &VariantArray,
        id: IdType,
        strings: &mut StringPool,
    ) -> Result<()> {
        match &mut self.variant {
            IndexVariant::Ordered(idx) => idx.delete(keys, id, strings),
            IndexVariant::Hash(idx) => idx.delete(keys, id, strings),
            IndexVariant::Store(idx) => idx.delete(keys, id),
            IndexVariant::Geometry(idx) => idx.delete(keys, id),
            IndexVariant::FtFast(idx) => idx.delete(keys, id),
            IndexVariant::FtFuzzy(idx) => idx.delete(keys, id),
        }
    }

    /// Resolve a condition into id-sets. Unsupported conditions produce a
    /// `Params` error; the planner then falls back to a comparator.
    pub fn select_key(
        &self,
        keys: &VariantArray,
        cond: CondType,
        ctx: &Context,
    ) -> Result<SelectKeyResult> {
        ctx.check()?;
        if !self.supports(cond) {
            return Err(Error::new(
                ErrorKind::Params,
                format!(
                    "index '{}' ({:?}) does not support condition {}",
                    self.def.name,
                    self.def.index_type,
                    cond.as_str()
                ),
            ));
        }
        match &self.variant {
            IndexVariant::Ordered(idx) => idx.select_key(keys, cond, &self.def.opts.collate),
            IndexVariant::Hash(idx) => idx.select_key(keys, cond),
            IndexVariant::Geometry(idx) => idx.select_key(keys, cond),
            IndexVariant::Store(_) | IndexVariant::FtFast(_) | IndexVariant::FtFuzzy(_) => {
                Err(Error::params("condition requires planner fast path"))
            }
        }
    }

    /// True when a full-text variant has uncommitted text changes.
    pub fn ft_dirty(&self) -> bool {
        match &self.variant {
            IndexVariant::FtFast(idx) => idx.is_dirty(),
            IndexVariant::FtFuzzy(idx) => idx.is_dirty(),
            _ => false,
        }
    }

    /// Finish a batch of mutations (full-text indexes defer building).
    pub fn commit(&mut self, ctx: &Context) -> Result<()> {
        match &mut self.variant {
            IndexVariant::FtFast(idx) => idx.commit(ctx),
            IndexVariant::FtFuzzy(idx) => idx.commit(ctx),
            _ => Ok(()),
        }
    }

    /// Build the dense `id -> rank` sort permutation (optimizer phase two).
    pub fn update_sorted_ids(&mut self, total_items: usize, ctx: &Context) -> Result<()> {
        if let IndexVariant::Ordered(idx) = &mut self.variant {
            idx.update_sorted_ids(total_items, ctx)?;
        }
        Ok(())
    }

    pub fn sorted_rank(&self, id: IdType) -> Option<SortType> {
        match &self.variant {
            IndexVariant::Ordered(idx) => idx.sorted_rank(id),
            _ => None,
        }
    }

    pub fn sort_orders(&self) -> Option<&[IdType]> {
        match &self.variant {
            IndexVariant::Ordered(idx) => idx.sort_orders(),
            _ => None,
        }
    }

    pub fn mem_stat(&self) -> IndexMemStat {
        let (unique_keys, ids, sorted) = match &self.variant {
            IndexVariant::Ordered(idx) => (idx.len(), idx.total_ids(), idx.sort_orders().is_some()),
            IndexVariant::Hash(idx) => (idx.len(), idx.total_ids(), false),
            IndexVariant::Store(idx) => (idx.len(), idx.len(), false),
            IndexVariant::Geometry(idx) => (idx.len(), idx.len(), false),
            IndexVariant::FtFast(idx) => (idx.vocab_len(), idx.doc_count(), false),
            IndexVariant::FtFuzzy(idx) => (idx.vocab_len(), idx.doc_count(), false),
        };
        IndexMemStat {
            name: self.def.name.clone(),
            unique_keys,
            ids,
            sort_orders_built: sorted,
        }
    }

    /// Column-store readback used by comparator scans.
    pub fn store_value(&self, id: IdType) -> Option<&Variant> {
        match &self.variant {
            IndexVariant::Store(idx) => idx.value(id),
            _ => None,
        }
    }

    pub(crate) fn ft_fast(&self) -> Option<&FastFtIndex> {
        match &self.variant {
            IndexVariant::FtFast(idx) => Some(idx),
            _ => None,
        }
    }

    pub(crate) fn ft_fuzzy(&self) -> Option<&FuzzyFtIndex> {
        match &self.variant {
            IndexVariant::FtFuzzy(idx) => Some(idx),
            _ => None,
        }
    }

    /// Keys of expired rows for TTL indexes: everything older than
    /// `now - expire_after`.
    pub fn expired_ids(&self, now_unix: i64) -> IdSet {
        let Some(ttl) = self.def.opts.expire_after else {
            return IdSet::new();
        };
        match &self.variant {
            IndexVariant::Ordered(idx) => idx.ids_below(&Variant::Int64(now_unix - ttl)),
            _ => IdSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_expression_parses_alias() {
        let def = IndexDef::new("author+year=book_key", IndexType::Hash, KeyValueType::Composite);
        assert_eq!(def.name, "book_key");
        assert_eq!(def.json_paths, vec!["author", "year"]);
        assert!(def.is_composite());
    }

    #[test]
    fn plain_name_is_single_path() {
        let def = IndexDef::new("title", IndexType::Hash, KeyValueType::String);
        assert_eq!(def.name, "title");
        assert_eq!(def.json_paths, vec!["title"]);
    }

    #[test]
    fn key_entry_stays_sorted_and_dedups() {
        let mut e = KeyEntry::default();
        for id in [5, 1, 3, 1, 2] {
            e.add(id);
        }
        assert_eq!(e.ids(), &vec![1, 2, 3, 5]);
        assert!(!e.remove(3));
        assert_eq!(e.ids(), &vec![1, 2, 5]);
    }

    #[test]
    fn hash_index_rejects_range_at_plan_time() {
        let def = IndexDef::new("title", IndexType::Hash, KeyValueType::String);
        let idx = Index::new(def, vec![0]).unwrap();
        let keys = VariantArray::from_iter([Variant::string("a")]);
        let err = idx
            .select_key(&keys, CondType::Range, &Context::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Params);
    }

    #[test]
    fn ttl_requires_expire_after() {
        let def = IndexDef::new("stamp", IndexType::Ttl, KeyValueType::Int64);
        assert!(Index::new(def, vec![0]).is_err());
        let def = IndexDef::new("stamp", IndexType::Ttl, KeyValueType::Int64).expire_after(3600);
        assert!(Index::new(def, vec![0]).is_ok());
    }
}
