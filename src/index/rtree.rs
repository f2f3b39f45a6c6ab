//! # Geometry Index
//!
//! Spatial index over `(x, y)` points backing the `DWITHIN` condition.
//! Points are kept sorted by an order-preserving encoding of `x` (the IEEE
//! 754 bit trick: negative floats invert all bits, positive floats flip the
//! sign bit), so a radius query sweeps only the `[cx - r, cx + r]` slab and
//! filters by exact distance. Array-valued by contract: a row may carry
//! several points.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::index::{CondType, IdSet, SelectKeyResult};
use crate::types::value::{Variant, VariantArray};
use crate::types::IdType;

/// Monotonic u64 image of an f64: preserves `<` across the full range.
fn order_key(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

pub struct GeometryIndex {
    /// x (order-encoded) -> points at that x.
    slabs: BTreeMap<u64, SmallVec<[(f64, IdType); 2]>>,
    points: usize,
}

impl GeometryIndex {
    pub fn new() -> Self {
        Self {
            slabs: BTreeMap::new(),
            points: 0,
        }
    }

    pub fn upsert(&mut self, keys: &VariantArray, id: IdType) -> Result<VariantArray> {
        for key in keys {
            let Variant::Point { x, y } = key else {
                return Err(Error::params("geometry index requires point keys"));
            };
            self.slabs.entry(order_key(*x)).or_default().push((*y, id));
            self.points += 1;
        }
        Ok(keys.clone())
    }

    pub fn delete(&mut self, keys: &VariantArray, id: IdType) -> Result<()> {
        for key in keys {
            let Variant::Point { x, y } = key else {
                continue;
            };
            let slab_key = order_key(*x);
            if let Some(slab) = self.slabs.get_mut(&slab_key) {
                if let Some(pos) = slab
                    .iter()
                    .position(|&(py, pid)| pid == id && py.to_bits() == y.to_bits())
                {
                    slab.remove(pos);
                    self.points -= 1;
                }
                if slab.is_empty() {
                    self.slabs.remove(&slab_key);
                }
            }
        }
        Ok(())
    }

    /// `DWITHIN(point, radius)`: keys are `[center, radius]`.
    pub fn select_key(&self, keys: &VariantArray, cond: CondType) -> Result<SelectKeyResult> {
        if cond != CondType::DWithin {
            return Err(Error::params("geometry index supports only DWITHIN"));
        }
        let (Some(Variant::Point { x: cx, y: cy }), Some(radius)) = (
            keys.first(),
            keys.get(1).and_then(|v| match v {
                Variant::Double(r) => Some(*r),
                Variant::Int(r) => Some(*r as f64),
                Variant::Int64(r) => Some(*r as f64),
                _ => None,
            }),
        ) else {
            return Err(Error::params("DWITHIN requires (point, radius)"));
        };
        if radius < 0.0 {
            return Err(Error::params("DWITHIN radius must be non-negative"));
        }

        let mut ids = IdSet::new();
        let lo = order_key(cx - radius);
        let hi = order_key(cx + radius);
        for (&xk, slab) in self.slabs.range(lo..=hi) {
            let x = decode_key(xk);
            for &(y, id) in slab {
                let (dx, dy) = (x - cx, y - cy);
                if dx * dx + dy * dy <= radius * radius {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(SelectKeyResult::union(vec![ids]))
    }

    pub fn len(&self) -> usize {
        self.points
    }
}

fn decode_key(k: u64) -> f64 {
    let bits = if k >> 63 == 1 { k ^ (1 << 63) } else { !k };
    f64::from_bits(bits)
}

impl Default for GeometryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f64, y: f64) -> Variant {
        Variant::Point { x, y }
    }

    #[test]
    fn order_key_is_monotonic() {
        let vals = [-10.5, -0.0, 0.0, 0.25, 3.0, 1e9];
        for w in vals.windows(2) {
            assert!(order_key(w[0]) <= order_key(w[1]));
            assert_eq!(decode_key(order_key(w[0])), w[0]);
        }
    }

    #[test]
    fn dwithin_filters_by_exact_distance() {
        let mut idx = GeometryIndex::new();
        idx.upsert(&VariantArray::from_iter([pt(0.0, 0.0)]), 1).unwrap();
        idx.upsert(&VariantArray::from_iter([pt(3.0, 4.0)]), 2).unwrap();
        idx.upsert(&VariantArray::from_iter([pt(10.0, 0.0)]), 3).unwrap();
        let res = idx
            .select_key(
                &VariantArray::from_iter([pt(0.0, 0.0), Variant::Double(5.0)]),
                CondType::DWithin,
            )
            .unwrap();
        assert_eq!(res.id_sets[0], vec![1, 2]);
    }

    #[test]
    fn delete_removes_single_point() {
        let mut idx = GeometryIndex::new();
        let keys = VariantArray::from_iter([pt(1.0, 1.0), pt(2.0, 2.0)]);
        idx.upsert(&keys, 7).unwrap();
        assert_eq!(idx.len(), 2);
        idx.delete(&VariantArray::from_iter([pt(1.0, 1.0)]), 7).unwrap();
        assert_eq!(idx.len(), 1);
    }
}
