//! # Runtime Value Representation
//!
//! [`Variant`] is the engine's typed scalar. It shows up as index keys,
//! filter operands, aggregation inputs and payload cells, so its comparison
//! semantics define the observable ordering of the whole engine.
//!
//! ## Comparison Semantics
//!
//! - Numeric tags (bool/int/int64/double) widen to the wider side before
//!   comparing, so `Int(1) == Int64(1) == Double(1.0)`.
//! - Strings compare under a [`CollateOpts`]: byte-wise, ASCII or UTF-8
//!   case-insensitive, numeric-aware, or a caller-supplied table.
//! - Composites compare field-wise in declared order.
//! - Everything else cross-type is a typed `Params` error from
//!   [`Variant::compare`]; the infallible [`Variant::total_cmp`] falls back
//!   to type-rank ordering so sorts and sets always have a total order.
//!
//! ## Interning
//!
//! String variants hold `Arc<str>`. The per-namespace string pool hands out
//! shared instances for indexed columns, so cloning a variant never copies
//! string bytes.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{Error, ErrorKind, Result};
use crate::types::{CollateMode, CollateOpts, KeyValueType};

/// Keys extracted from one row for one index; almost always a single value,
/// more for array columns.
pub type VariantArray = SmallVec<[Variant; 2]>;

#[derive(Debug, Clone)]
pub enum Variant {
    Null,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Double(f64),
    String(Arc<str>),
    Composite(Vec<Variant>),
    Point { x: f64, y: f64 },
}

impl Variant {
    pub fn kind(&self) -> KeyValueType {
        match self {
            Variant::Null => KeyValueType::Null,
            Variant::Bool(_) => KeyValueType::Bool,
            Variant::Int(_) => KeyValueType::Int,
            Variant::Int64(_) => KeyValueType::Int64,
            Variant::Double(_) => KeyValueType::Double,
            Variant::String(_) => KeyValueType::String,
            Variant::Composite(_) => KeyValueType::Composite,
            Variant::Point { .. } => KeyValueType::Point,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn string(s: impl AsRef<str>) -> Self {
        Variant::String(Arc::from(s.as_ref()))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Bool(b) => Some(*b as i64 as f64),
            Variant::Int(v) => Some(*v as f64),
            Variant::Int64(v) => Some(*v as f64),
            Variant::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Bool(b) => Some(*b as i64),
            Variant::Int(v) => Some(*v as i64),
            Variant::Int64(v) => Some(*v),
            Variant::Double(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce into the declared type of a payload field.
    pub fn convert(&self, to: KeyValueType) -> Result<Variant> {
        if self.kind() == to || self.is_null() {
            return Ok(self.clone());
        }
        let out = match (self, to) {
            (v, KeyValueType::Bool) if v.kind().is_numeric() => {
                Variant::Bool(v.as_f64().unwrap_or(0.0) != 0.0)
            }
            (v, KeyValueType::Int) if v.kind().is_numeric() => {
                Variant::Int(v.as_i64().unwrap_or(0) as i32)
            }
            (v, KeyValueType::Int64) if v.kind().is_numeric() => {
                Variant::Int64(v.as_i64().unwrap_or(0))
            }
            (v, KeyValueType::Double) if v.kind().is_numeric() => {
                Variant::Double(v.as_f64().unwrap_or(0.0))
            }
            (Variant::String(s), KeyValueType::Int) => Variant::Int(
                s.parse()
                    .map_err(|_| Error::params(format!("'{s}' is not an int")))?,
            ),
            (Variant::String(s), KeyValueType::Int64) => Variant::Int64(
                s.parse()
                    .map_err(|_| Error::params(format!("'{s}' is not an int64")))?,
            ),
            (Variant::String(s), KeyValueType::Double) => Variant::Double(
                s.parse()
                    .map_err(|_| Error::params(format!("'{s}' is not a double")))?,
            ),
            (v, to) => {
                return Err(Error::params(format!(
                    "cannot convert {} to {}",
                    v.kind().as_str(),
                    to.as_str()
                )))
            }
        };
        Ok(out)
    }

    /// Typed comparison used by filters and index probes. Incompatible tags
    /// are a `Params` error; numeric tags widen.
    pub fn compare(&self, other: &Variant, collate: &CollateOpts) -> Result<Ordering> {
        match (self, other) {
            (Variant::Null, Variant::Null) => Ok(Ordering::Equal),
            (Variant::Null, _) => Ok(Ordering::Less),
            (_, Variant::Null) => Ok(Ordering::Greater),
            (Variant::String(a), Variant::String(b)) => Ok(collate_cmp(a, b, collate)),
            (Variant::Composite(a), Variant::Composite(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y, collate)? {
                        Ordering::Equal => continue,
                        ord => return Ok(ord),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) if a.kind().is_numeric() && b.kind().is_numeric() => {
                match (a, b) {
                    // Stay in integer space when no double is involved.
                    (Variant::Double(_), _) | (_, Variant::Double(_)) => Ok(a
                        .as_f64()
                        .unwrap_or(f64::NAN)
                        .total_cmp(&b.as_f64().unwrap_or(f64::NAN))),
                    _ => Ok(a.as_i64().unwrap_or(0).cmp(&b.as_i64().unwrap_or(0))),
                }
            }
            (a, b) => Err(Error::new(
                ErrorKind::Params,
                format!(
                    "cannot compare {} with {}",
                    a.kind().as_str(),
                    b.kind().as_str()
                ),
            )),
        }
    }

    /// Infallible total order: compatible tags compare by value, anything
    /// else by type rank. Used for sort tie-breaks and distinct sets.
    pub fn total_cmp(&self, other: &Variant, collate: &CollateOpts) -> Ordering {
        self.compare(other, collate).unwrap_or_else(|_| {
            let rank = |v: &Variant| v.kind() as u8;
            rank(self).cmp(&rank(other)).then_with(|| match (self, other) {
                (Variant::Point { x: ax, y: ay }, Variant::Point { x: bx, y: by }) => {
                    ax.total_cmp(bx).then(ay.total_cmp(by))
                }
                _ => Ordering::Equal,
            })
        })
    }

    /// Normalized form used as a hash-index key: case-insensitive collations
    /// fold strings so equal-under-collation values collide.
    pub fn folded(&self, collate: &CollateOpts) -> Variant {
        match (self, collate.mode) {
            (Variant::String(s), CollateMode::Ascii) => {
                Variant::String(Arc::from(s.to_ascii_lowercase()))
            }
            (Variant::String(s), CollateMode::Utf8) => {
                Variant::String(Arc::from(s.to_lowercase()))
            }
            (Variant::Composite(fields), _) => {
                Variant::Composite(fields.iter().map(|f| f.folded(collate)).collect())
            }
            _ => self.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Variant::Null => serde_json::Value::Null,
            Variant::Bool(b) => serde_json::Value::Bool(*b),
            Variant::Int(v) => serde_json::Value::from(*v),
            Variant::Int64(v) => serde_json::Value::from(*v),
            Variant::Double(v) => serde_json::Value::from(*v),
            Variant::String(s) => serde_json::Value::String(s.to_string()),
            Variant::Composite(fields) => {
                serde_json::Value::Array(fields.iter().map(Variant::to_json).collect())
            }
            Variant::Point { x, y } => serde_json::Value::Array(vec![
                serde_json::Value::from(*x),
                serde_json::Value::from(*y),
            ]),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Variant> {
        Ok(match value {
            serde_json::Value::Null => Variant::Null,
            serde_json::Value::Bool(b) => Variant::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                        Variant::Int(i as i32)
                    } else {
                        Variant::Int64(i)
                    }
                } else {
                    Variant::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Variant::string(s),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(Error::params("expected scalar JSON value"))
            }
        })
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other, &CollateOpts::default()) == Ordering::Equal
    }
}

impl Eq for Variant {}

impl PartialOrd for Variant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other, &CollateOpts::default())
    }
}

impl Hash for Variant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Variant::Null => 0u8.hash(state),
            Variant::Bool(b) => (*b as i64).hash(state),
            // Numeric tags hash through i64/f64 bits so widened-equal values
            // land in the same bucket.
            Variant::Int(v) => (*v as i64).hash(state),
            Variant::Int64(v) => v.hash(state),
            Variant::Double(v) => {
                if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                    (*v as i64).hash(state)
                } else {
                    v.to_bits().hash(state)
                }
            }
            Variant::String(s) => s.hash(state),
            Variant::Composite(fields) => {
                for f in fields {
                    f.hash(state);
                }
            }
            Variant::Point { x, y } => {
                x.to_bits().hash(state);
                y.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Null => write!(f, "null"),
            Variant::Bool(b) => write!(f, "{b}"),
            Variant::Int(v) => write!(f, "{v}"),
            Variant::Int64(v) => write!(f, "{v}"),
            Variant::Double(v) => write!(f, "{v}"),
            Variant::String(s) => write!(f, "{s}"),
            Variant::Composite(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
            Variant::Point { x, y } => write!(f, "point({x},{y})"),
        }
    }
}

/// String comparison under a collation.
pub fn collate_cmp(a: &str, b: &str, opts: &CollateOpts) -> Ordering {
    match opts.mode {
        CollateMode::None => a.cmp(b),
        CollateMode::Ascii => a
            .bytes()
            .map(|c| c.to_ascii_lowercase())
            .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
        CollateMode::Utf8 => a
            .chars()
            .flat_map(char::to_lowercase)
            .cmp(b.chars().flat_map(char::to_lowercase)),
        CollateMode::Numeric => numeric_cmp(a, b),
        CollateMode::Custom => a
            .chars()
            .map(|c| opts.custom_weight(c))
            .cmp(b.chars().map(|c| opts.custom_weight(c))),
    }
}

/// Digit runs compare as numbers, the rest byte-wise: `img9 < img10`.
fn numeric_cmp(a: &str, b: &str) -> Ordering {
    let (mut ia, mut ib) = (a.as_bytes(), b.as_bytes());
    loop {
        match (ia.first(), ib.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&ca), Some(&cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let run_a = digit_run(ia);
                    let run_b = digit_run(ib);
                    match cmp_digit_runs(&ia[..run_a], &ib[..run_b]) {
                        Ordering::Equal => {
                            ia = &ia[run_a..];
                            ib = &ib[run_b..];
                        }
                        ord => return ord,
                    }
                } else {
                    match ca.cmp(&cb) {
                        Ordering::Equal => {
                            ia = &ia[1..];
                            ib = &ib[1..];
                        }
                        ord => return ord,
                    }
                }
            }
        }
    }
}

fn digit_run(s: &[u8]) -> usize {
    s.iter().take_while(|c| c.is_ascii_digit()).count()
}

fn cmp_digit_runs(a: &[u8], b: &[u8]) -> Ordering {
    let trim = |s: &[u8]| {
        let start = s.iter().take_while(|&&c| c == b'0').count();
        s[start..].to_vec()
    };
    let (ta, tb) = (trim(a), trim(b));
    ta.len().cmp(&tb.len()).then_with(|| ta.cmp(&tb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(mode: CollateMode) -> CollateOpts {
        CollateOpts::new(mode)
    }

    #[test]
    fn numeric_widening() {
        let o = CollateOpts::default();
        assert_eq!(
            Variant::Int(1).compare(&Variant::Int64(1), &o).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            Variant::Int(2).compare(&Variant::Double(2.5), &o).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            Variant::Bool(true).compare(&Variant::Int(1), &o).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn incompatible_tags_fail_typed() {
        let err = Variant::string("a")
            .compare(&Variant::Int(1), &CollateOpts::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Params);
    }

    #[test]
    fn ascii_collation_folds_case() {
        assert_eq!(
            collate_cmp("Hello", "hELLO", &opts(CollateMode::Ascii)),
            Ordering::Equal
        );
        assert_eq!(
            collate_cmp("Hello", "hELLO", &opts(CollateMode::None)),
            Ordering::Less
        );
    }

    #[test]
    fn numeric_collation_compares_digit_runs() {
        let o = opts(CollateMode::Numeric);
        assert_eq!(collate_cmp("img9", "img10", &o), Ordering::Less);
        assert_eq!(collate_cmp("img010", "img10", &o), Ordering::Equal);
        assert_eq!(collate_cmp("a2b1", "a2b", &o), Ordering::Greater);
    }

    #[test]
    fn custom_collation_uses_table() {
        let o = CollateOpts::custom(['z', 'a']);
        assert_eq!(collate_cmp("z", "a", &o), Ordering::Less);
    }

    #[test]
    fn folded_collides_under_hash_collation() {
        let o = opts(CollateMode::Ascii);
        assert_eq!(
            Variant::string("ABC").folded(&o),
            Variant::string("abc").folded(&o)
        );
    }

    #[test]
    fn widened_numeric_hash_matches() {
        use std::collections::hash_map::DefaultHasher;
        let h = |v: &Variant| {
            let mut s = DefaultHasher::new();
            v.hash(&mut s);
            s.finish()
        };
        assert_eq!(h(&Variant::Int(5)), h(&Variant::Int64(5)));
        assert_eq!(h(&Variant::Int64(5)), h(&Variant::Double(5.0)));
    }

    #[test]
    fn composite_compares_fieldwise() {
        let a = Variant::Composite(vec![Variant::string("x"), Variant::Int(2000)]);
        let b = Variant::Composite(vec![Variant::string("x"), Variant::Int(2001)]);
        assert_eq!(
            a.compare(&b, &CollateOpts::default()).unwrap(),
            Ordering::Less
        );
    }
}
