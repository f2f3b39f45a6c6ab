//! # Column Store Index
//!
//! Dense vector of raw values indexed by item id. Holds no key map at all:
//! its only job is to feed row-wise comparator scans without touching the
//! item table, for columns that have no tree or hash index (or whose
//! condition no index supports). Array and sparse columns are not stored
//! here; comparators read those through the payload instead.

use crate::error::Result;
use crate::types::value::{Variant, VariantArray};
use crate::types::IdType;

pub struct StoreIndex {
    values: Vec<Variant>,
}

impl StoreIndex {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn upsert(&mut self, keys: &VariantArray, id: IdType) -> Result<VariantArray> {
        let value = keys.first().cloned().unwrap_or(Variant::Null);
        if self.values.len() <= id as usize {
            self.values.resize(id as usize + 1, Variant::Null);
        }
        self.values[id as usize] = value.clone();
        Ok(VariantArray::from_iter([value]))
    }

    pub fn delete(&mut self, _keys: &VariantArray, id: IdType) -> Result<()> {
        if let Some(slot) = self.values.get_mut(id as usize) {
            *slot = Variant::Null;
        }
        Ok(())
    }

    pub fn value(&self, id: IdType) -> Option<&Variant> {
        self.values.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

impl Default for StoreIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_track_ids() {
        let mut idx = StoreIndex::new();
        idx.upsert(&VariantArray::from_iter([Variant::Int(42)]), 3)
            .unwrap();
        assert_eq!(idx.value(3), Some(&Variant::Int(42)));
        assert_eq!(idx.value(0), Some(&Variant::Null));
        idx.delete(&VariantArray::new(), 3).unwrap();
        assert_eq!(idx.value(3), Some(&Variant::Null));
    }
}
