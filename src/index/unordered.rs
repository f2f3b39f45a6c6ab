//! # Hash Index
//!
//! Equality-only index over folded keys. Case-insensitive collations fold
//! keys at insert and probe time so collation-equal values share a bucket.
//! Range conditions are rejected at plan time with a typed error; the
//! planner never reaches this variant with one.

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::index::ordered::intern_key;
use crate::index::strings::StringPool;
use crate::index::{CondType, IdSet, KeyEntry, SelectKeyResult, SetMerge};
use crate::types::value::{Variant, VariantArray};
use crate::types::{CollateOpts, IdType};

pub struct HashIndex {
    map: HashMap<Variant, KeyEntry>,
    collate: CollateOpts,
}

impl HashIndex {
    pub fn new(collate: CollateOpts) -> Self {
        Self {
            map: HashMap::new(),
            collate,
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
            self.map
                .entry(key.folded(&self.collate))
                .or_default()
                .add(id);
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
            let folded = key.folded(&self.collate);
            if let Some(entry) = self.map.get_mut(&folded) {
                if entry.remove(id) {
                    self.map.remove(&folded);
                }
            }
            if let Variant::String(s) = key {
                strings.release(s);
            }
        }
        Ok(())
    }

    pub fn select_key(&self, keys: &VariantArray, cond: CondType) -> Result<SelectKeyResult> {
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
                    match self.map.get(&key.folded(&self.collate)) {
                        Some(entry) => sets.push(entry.ids().clone()),
                        None => sets.push(IdSet::new()),
                    }
                }
            }
            CondType::Any => {
                for entry in self.map.values() {
                    sets.push(entry.ids().clone());
                }
            }
            other => {
                return Err(Error::params(format!(
                    "hash index does not support {}",
                    other.as_str()
                )))
            }
        }
        Ok(SelectKeyResult { id_sets: sets, merge })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn total_ids(&self) -> usize {
        self.map.values().map(KeyEntry::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollateMode;

    #[test]
    fn set_condition_returns_one_set_per_key() {
        let mut idx = HashIndex::new(CollateOpts::default());
        let mut pool = StringPool::new();
        for (id, t) in ["a", "b", "a", "c"].iter().enumerate() {
            idx.upsert(
                &VariantArray::from_iter([Variant::string(t)]),
                id as IdType,
                &mut pool,
            )
            .unwrap();
        }
        let res = idx
            .select_key(
                &VariantArray::from_iter([Variant::string("a"), Variant::string("c")]),
                CondType::Set,
            )
            .unwrap();
        assert_eq!(res.id_sets.len(), 2);
        assert_eq!(res.id_sets[0], vec![0, 2]);
        assert_eq!(res.id_sets[1], vec![3]);
    }

    #[test]
    fn folded_probe_hits_collated_bucket() {
        let mut idx = HashIndex::new(CollateOpts::new(CollateMode::Ascii));
        let mut pool = StringPool::new();
        idx.upsert(
            &VariantArray::from_iter([Variant::string("Alice")]),
            1,
            &mut pool,
        )
        .unwrap();
        let res = idx
            .select_key(
                &VariantArray::from_iter([Variant::string("ALICE")]),
                CondType::Eq,
            )
            .unwrap();
        assert_eq!(res.id_sets[0], vec![1]);
    }
}
