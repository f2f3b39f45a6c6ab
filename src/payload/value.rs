//! # Payload Value & Access View
//!
//! [`PayloadValue`] is one stored row: the typed cells of the fixed prefix
//! plus the CJSON body. Rows are shared by `Arc`, so query results keep
//! items alive after the namespace lock is released and cloning a row into
//! a transaction is O(1); mutation goes through copy-on-write.
//!
//! [`Payload`] pairs a row with its [`PayloadType`] for field access. The
//! row itself never stores field names or offsets; the namespace passes the
//! type in explicitly at every access, which keeps rows free of
//! back-references.
//!
//! ## Serialized Fixed Row
//!
//! The storage encoder lays cells out at the offsets pre-computed by the
//! payload type:
//!
//! ```text
//! +-------------+----------------------+--------------+
//! | null bitmap | fixed cells          | var section  |
//! | (nf+7)/8    | at PayloadField.offset| strings,    |
//! |             |                      | array elems  |
//! +-------------+----------------------+--------------+
//! ```
//!
//! Strings and arrays store `(offset, len)` pairs pointing into the var
//! section; everything else is inline little-endian.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::payload::cjson::{read_uvarint, write_uvarint};
use crate::payload::types::PayloadType;
use crate::types::value::{Variant, VariantArray};
use crate::types::{CollateOpts, KeyValueType};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldCell {
    Scalar(Variant),
    Array(Vec<Variant>),
}

impl FieldCell {
    pub fn values(&self) -> VariantArray {
        match self {
            FieldCell::Scalar(Variant::Null) => VariantArray::new(),
            FieldCell::Scalar(v) => VariantArray::from_iter([v.clone()]),
            FieldCell::Array(vs) => vs.iter().cloned().collect(),
        }
    }

    fn is_absent(&self) -> bool {
        matches!(self, FieldCell::Scalar(Variant::Null))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct RowData {
    cells: Vec<FieldCell>,
    body: Vec<u8>,
}

/// One document row; cheap to clone, copy-on-write to mutate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadValue {
    data: Arc<RowData>,
}

impl PayloadValue {
    pub fn new(cells: Vec<FieldCell>, body: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RowData { cells, body }),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.data.body
    }

    pub fn num_cells(&self) -> usize {
        self.data.cells.len()
    }

    pub fn set_field(&mut self, idx: usize, cell: FieldCell) {
        let data = Arc::make_mut(&mut self.data);
        if idx >= data.cells.len() {
            data.cells
                .resize(idx + 1, FieldCell::Scalar(Variant::Null));
        }
        data.cells[idx] = cell;
    }

    /// Grow the cell vector to a newer payload type; existing cells keep
    /// their positions (types only evolve by suffix extension).
    pub fn resize_to(&mut self, ty: &PayloadType) {
        if self.data.cells.len() < ty.num_fields() {
            let data = Arc::make_mut(&mut self.data);
            data.cells
                .resize(ty.num_fields(), FieldCell::Scalar(Variant::Null));
        }
    }
}

/// Field-access view over a row under a payload type.
pub struct Payload<'a> {
    pub ty: &'a PayloadType,
    pub value: &'a PayloadValue,
}

impl<'a> Payload<'a> {
    pub fn new(ty: &'a PayloadType, value: &'a PayloadValue) -> Self {
        Self { ty, value }
    }

    /// All values of a field; one entry for scalars, element-per-entry for
    /// arrays, empty when absent.
    pub fn field_values(&self, idx: usize) -> VariantArray {
        match self.value.data.cells.get(idx) {
            Some(cell) => cell.values(),
            None => VariantArray::new(),
        }
    }

    pub fn field_scalar(&self, idx: usize) -> Variant {
        self.field_values(idx)
            .first()
            .cloned()
            .unwrap_or(Variant::Null)
    }

    /// Concatenation of the referenced fields in declared order, the key
    /// form composite indexes operate on.
    pub fn composite_key(&self, fields: &[usize]) -> Variant {
        Variant::Composite(fields.iter().map(|&f| self.field_scalar(f)).collect())
    }

    pub fn hash_fields(&self, fields: &[usize]) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for &f in fields {
            for v in self.field_values(f) {
                v.hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    pub fn equal_fields(&self, other: &Payload<'_>, fields: &[usize]) -> bool {
        fields.iter().all(|&f| {
            let a = self.field_values(f);
            let b = other.field_values(f);
            a.len() == b.len()
                && a.iter().zip(b.iter()).all(|(x, y)| {
                    x.total_cmp(y, &CollateOpts::default()) == std::cmp::Ordering::Equal
                })
        })
    }

    /// Serialize the fixed prefix at the type's offsets.
    pub fn encode_fixed(&self) -> Vec<u8> {
        let nf = self.ty.num_fields();
        let bitmap_len = nf.div_ceil(8);
        let mut fixed = vec![0u8; bitmap_len + self.ty.fixed_size()];
        let mut var = Vec::new();

        for (idx, field) in self.ty.fields().iter().enumerate() {
            let cell = self
                .value
                .data
                .cells
                .get(idx)
                .cloned()
                .unwrap_or(FieldCell::Scalar(Variant::Null));
            if cell.is_absent() {
                fixed[idx / 8] |= 1 << (idx % 8);
                continue;
            }
            let at = bitmap_len + field.offset;
            match &cell {
                FieldCell::Array(items) => {
                    let offset = var.len() as u32;
                    for item in items {
                        encode_var_elem(&mut var, item);
                    }
                    fixed[at..at + 4].copy_from_slice(&offset.to_le_bytes());
                    fixed[at + 4..at + 8].copy_from_slice(&(items.len() as u32).to_le_bytes());
                }
                FieldCell::Scalar(v) => match v {
                    Variant::Bool(b) => fixed[at] = *b as u8,
                    Variant::Int(i) => fixed[at..at + 4].copy_from_slice(&i.to_le_bytes()),
                    Variant::Int64(i) => fixed[at..at + 8].copy_from_slice(&i.to_le_bytes()),
                    Variant::Double(d) => fixed[at..at + 8].copy_from_slice(&d.to_le_bytes()),
                    Variant::String(s) => {
                        let offset = var.len() as u32;
                        write_uvarint(&mut var, s.len() as u64);
                        var.extend_from_slice(s.as_bytes());
                        fixed[at..at + 4].copy_from_slice(&offset.to_le_bytes());
                        fixed[at + 4..at + 8]
                            .copy_from_slice(&(s.len() as u32).to_le_bytes());
                    }
                    Variant::Point { x, y } => {
                        fixed[at..at + 8].copy_from_slice(&x.to_le_bytes());
                        fixed[at + 8..at + 16].copy_from_slice(&y.to_le_bytes());
                    }
                    Variant::Null | Variant::Composite(_) => {}
                },
            }
        }

        fixed.extend_from_slice(&var);
        fixed
    }
}

fn encode_var_elem(out: &mut Vec<u8>, v: &Variant) {
    match v {
        Variant::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        Variant::Int(i) => {
            out.push(2);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Variant::Int64(i) => {
            out.push(3);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Variant::Double(d) => {
            out.push(4);
            out.extend_from_slice(&d.to_le_bytes());
        }
        Variant::String(s) => {
            out.push(5);
            write_uvarint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Variant::Point { x, y } => {
            out.push(6);
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        _ => out.push(0),
    }
}

fn take_bytes<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let s = buf
        .get(*pos..*pos + n)
        .ok_or_else(|| Error::parse("truncated payload array element"))?;
    *pos += n;
    Ok(s)
}

fn decode_var_elem(buf: &[u8], pos: &mut usize) -> Result<Variant> {
    let tag = *buf
        .get(*pos)
        .ok_or_else(|| Error::parse("truncated payload array element"))?;
    *pos += 1;
    Ok(match tag {
        0 => Variant::Null,
        1 => Variant::Bool(take_bytes(buf, pos, 1)?[0] != 0),
        2 => Variant::Int(i32::from_le_bytes(
            take_bytes(buf, pos, 4)?.try_into().unwrap_or([0; 4]),
        )),
        3 => Variant::Int64(i64::from_le_bytes(
            take_bytes(buf, pos, 8)?.try_into().unwrap_or([0; 8]),
        )),
        4 => Variant::Double(f64::from_le_bytes(
            take_bytes(buf, pos, 8)?.try_into().unwrap_or([0; 8]),
        )),
        5 => {
            let len = read_uvarint(buf, pos)? as usize;
            let bytes = take_bytes(buf, pos, len)?;
            Variant::String(Arc::from(
                std::str::from_utf8(bytes)
                    .map_err(|_| Error::parse("invalid utf-8 in payload string"))?,
            ))
        }
        6 => {
            let x = f64::from_le_bytes(take_bytes(buf, pos, 8)?.try_into().unwrap_or([0; 8]));
            let y = f64::from_le_bytes(take_bytes(buf, pos, 8)?.try_into().unwrap_or([0; 8]));
            Variant::Point { x, y }
        }
        t => return Err(Error::parse(format!("unknown payload element tag {t}"))),
    })
}

/// Deserialize a fixed prefix produced by [`Payload::encode_fixed`].
pub fn decode_fixed(ty: &PayloadType, buf: &[u8]) -> Result<Vec<FieldCell>> {
    let nf = ty.num_fields();
    let bitmap_len = nf.div_ceil(8);
    let var_start = bitmap_len + ty.fixed_size();
    if buf.len() < var_start {
        return Err(Error::parse("fixed row shorter than payload type"));
    }
    let var = &buf[var_start..];
    let mut cells = Vec::with_capacity(nf);

    for (idx, field) in ty.fields().iter().enumerate() {
        if buf[idx / 8] & (1 << (idx % 8)) != 0 {
            cells.push(FieldCell::Scalar(Variant::Null));
            continue;
        }
        let at = bitmap_len + field.offset;
        let cell = if field.is_array {
            let offset =
                u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4])) as usize;
            let count =
                u32::from_le_bytes(buf[at + 4..at + 8].try_into().unwrap_or([0; 4])) as usize;
            let mut pos = offset;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_var_elem(var, &mut pos)?);
            }
            FieldCell::Array(items)
        } else {
            FieldCell::Scalar(match field.kind {
                KeyValueType::Bool => Variant::Bool(buf[at] != 0),
                KeyValueType::Int => {
                    Variant::Int(i32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4])))
                }
                KeyValueType::Int64 => Variant::Int64(i64::from_le_bytes(
                    buf[at..at + 8].try_into().unwrap_or([0; 8]),
                )),
                KeyValueType::Double => Variant::Double(f64::from_le_bytes(
                    buf[at..at + 8].try_into().unwrap_or([0; 8]),
                )),
                KeyValueType::String => {
                    let offset =
                        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4])) as usize;
                    let mut pos = offset;
                    let len = read_uvarint(var, &mut pos)? as usize;
                    let bytes = var
                        .get(pos..pos + len)
                        .ok_or_else(|| Error::parse("truncated payload string"))?;
                    Variant::String(Arc::from(
                        std::str::from_utf8(bytes)
                            .map_err(|_| Error::parse("invalid utf-8 in payload string"))?,
                    ))
                }
                KeyValueType::Point => Variant::Point {
                    x: f64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or([0; 8])),
                    y: f64::from_le_bytes(buf[at + 8..at + 16].try_into().unwrap_or([0; 8])),
                },
                KeyValueType::Null | KeyValueType::Composite => Variant::Null,
            })
        };
        cells.push(cell);
    }

    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_type() -> PayloadType {
        let mut ty = PayloadType::new();
        ty.add_field("id", "id", KeyValueType::Int, false).unwrap();
        ty.add_field("title", "title", KeyValueType::String, false)
            .unwrap();
        ty.add_field("price", "price", KeyValueType::Double, false)
            .unwrap();
        ty.add_field("tags", "tags", KeyValueType::String, true)
            .unwrap();
        ty.add_field("loc", "loc", KeyValueType::Point, false)
            .unwrap();
        ty
    }

    fn sample_row() -> PayloadValue {
        PayloadValue::new(
            vec![
                FieldCell::Scalar(Variant::Int(7)),
                FieldCell::Scalar(Variant::string("dune")),
                FieldCell::Scalar(Variant::Double(9.99)),
                FieldCell::Array(vec![Variant::string("sf"), Variant::string("classic")]),
                FieldCell::Scalar(Variant::Point { x: 1.0, y: -2.0 }),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn fixed_row_roundtrip() {
        let ty = book_type();
        let row = sample_row();
        let bytes = Payload::new(&ty, &row).encode_fixed();
        let cells = decode_fixed(&ty, &bytes).unwrap();
        assert_eq!(cells, row.data.cells);
    }

    #[test]
    fn absent_field_roundtrips_as_null() {
        let ty = book_type();
        let mut row = sample_row();
        row.set_field(2, FieldCell::Scalar(Variant::Null));
        let bytes = Payload::new(&ty, &row).encode_fixed();
        let cells = decode_fixed(&ty, &bytes).unwrap();
        assert_eq!(cells[2], FieldCell::Scalar(Variant::Null));
    }

    #[test]
    fn field_values_fan_out_arrays() {
        let ty = book_type();
        let row = sample_row();
        let p = Payload::new(&ty, &row);
        assert_eq!(p.field_values(3).len(), 2);
        assert_eq!(p.field_values(0).len(), 1);
    }

    #[test]
    fn composite_key_concatenates_in_order() {
        let ty = book_type();
        let row = sample_row();
        let key = Payload::new(&ty, &row).composite_key(&[1, 0]);
        assert_eq!(
            key,
            Variant::Composite(vec![Variant::string("dune"), Variant::Int(7)])
        );
    }

    #[test]
    fn hash_and_equality_agree_on_fields() {
        let ty = book_type();
        let a = sample_row();
        let b = sample_row();
        let pa = Payload::new(&ty, &a);
        let pb = Payload::new(&ty, &b);
        assert!(pa.equal_fields(&pb, &[0, 1, 3]));
        assert_eq!(pa.hash_fields(&[0, 1]), pb.hash_fields(&[0, 1]));
    }
}
