//! # Payload Type
//!
//! Ordered field list of a namespace with pre-computed offsets into the
//! serialized fixed row. Offsets are laid out once at declaration time so
//! the storage encoder can place every scalar at a known position, the same
//! way a column catalog pre-computes its fixed-data section.
//!
//! ## Cell widths
//!
//! | Kind | Bytes |
//! |------|-------|
//! | Bool | 1 |
//! | Int | 4 |
//! | Int64 / Double | 8 |
//! | String | 8 (length-prefixed slot in the var section) |
//! | Point | 16 |
//! | array field | 8 (offset+count into the var section) |

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::types::KeyValueType;

#[derive(Debug, Clone)]
pub struct PayloadField {
    pub name: String,
    /// Dotted JSON path the field is populated from; usually equals `name`.
    pub json_path: String,
    pub kind: KeyValueType,
    pub is_array: bool,
    /// Byte offset of this cell in the serialized fixed row.
    pub offset: usize,
}

impl PayloadField {
    fn cell_size(kind: KeyValueType, is_array: bool) -> usize {
        if is_array {
            return 8;
        }
        match kind {
            KeyValueType::Bool => 1,
            KeyValueType::Int => 4,
            KeyValueType::Int64 | KeyValueType::Double | KeyValueType::String => 8,
            KeyValueType::Point => 16,
            KeyValueType::Null | KeyValueType::Composite => 0,
        }
    }
}

/// Schema of the fixed row prefix. Immutable once built; evolving a
/// namespace replaces the whole type and rebinds open transactions.
#[derive(Debug, Clone, Default)]
pub struct PayloadType {
    fields: Vec<PayloadField>,
    by_name: HashMap<String, usize>,
    fixed_size: usize,
}

impl PayloadType {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(
        &mut self,
        name: &str,
        json_path: &str,
        kind: KeyValueType,
        is_array: bool,
    ) -> Result<usize> {
        if self.by_name.contains_key(name) {
            return Err(Error::conflict(format!("field '{name}' already declared")));
        }
        let idx = self.fields.len();
        self.fields.push(PayloadField {
            name: name.to_string(),
            json_path: json_path.to_string(),
            kind,
            is_array,
            offset: self.fixed_size,
        });
        self.fixed_size += PayloadField::cell_size(kind, is_array);
        self.by_name.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub fn field(&self, idx: usize) -> Option<&PayloadField> {
        self.fields.get(idx)
    }

    pub fn field_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn field_by_json_path(&self, path: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.json_path == path)
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[PayloadField] {
        &self.fields
    }

    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    /// True when `other` can read rows written under `self` (a pure suffix
    /// extension). Anything else forces transaction rebinding.
    pub fn compatible_with(&self, other: &PayloadType) -> bool {
        self.fields.len() <= other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|(a, b)| a.name == b.name && a.kind == b.kind && a.is_array == b.is_array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_accumulate_by_cell_width() {
        let mut ty = PayloadType::new();
        ty.add_field("id", "id", KeyValueType::Int, false).unwrap();
        ty.add_field("price", "price", KeyValueType::Double, false)
            .unwrap();
        ty.add_field("title", "title", KeyValueType::String, false)
            .unwrap();
        assert_eq!(ty.field(0).unwrap().offset, 0);
        assert_eq!(ty.field(1).unwrap().offset, 4);
        assert_eq!(ty.field(2).unwrap().offset, 12);
        assert_eq!(ty.fixed_size(), 20);
    }

    #[test]
    fn duplicate_field_is_conflict() {
        let mut ty = PayloadType::new();
        ty.add_field("id", "id", KeyValueType::Int, false).unwrap();
        assert!(ty.add_field("id", "id", KeyValueType::Int, false).is_err());
    }

    #[test]
    fn suffix_extension_is_compatible() {
        let mut a = PayloadType::new();
        a.add_field("id", "id", KeyValueType::Int, false).unwrap();
        let mut b = a.clone();
        b.add_field("title", "title", KeyValueType::String, false)
            .unwrap();
        assert!(a.compatible_with(&b));
        assert!(!b.compatible_with(&a));
    }
}
