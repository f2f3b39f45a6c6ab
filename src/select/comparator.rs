//! # Row-Wise Comparator
//!
//! Fallback predicate evaluation for conditions no index can answer:
//! `LIKE`, `EMPTY`, sparse paths, unindexed fields, and any condition an
//! index rejected at plan time. A comparator reads field values for one
//! candidate id (column store first, payload reconstruction otherwise) and
//! evaluates the condition in place.

use crate::error::{Error, Result};
use crate::index::CondType;
use crate::namespace::NamespaceImpl;
use crate::types::value::{Variant, VariantArray};
use crate::types::{CollateOpts, IdType};

#[derive(Debug, Clone)]
pub struct Comparator {
    pub field: String,
    pub cond: CondType,
    pub values: VariantArray,
    pub collate: CollateOpts,
}

impl Comparator {
    pub fn new(
        ns: &NamespaceImpl,
        field: &str,
        cond: CondType,
        values: VariantArray,
    ) -> Result<Self> {
        match cond {
            CondType::Range if values.len() != 2 => {
                return Err(Error::params("RANGE requires exactly two values"))
            }
            CondType::Like
                if values.first().and_then(Variant::as_str).is_none() =>
            {
                return Err(Error::params("LIKE requires a string pattern"))
            }
            _ => {}
        }
        Ok(Self {
            field: field.to_string(),
            cond,
            values,
            collate: ns.collate_for(field),
        })
    }

    /// Evaluate the condition against one candidate row.
    pub fn matches(&self, ns: &NamespaceImpl, id: IdType) -> Result<bool> {
        let values = ns.field_values(id, &self.field)?;
        match self.cond {
            CondType::Empty => return Ok(values.is_empty()),
            CondType::Any => return Ok(!values.is_empty()),
            _ => {}
        }
        for v in &values {
            if self.matches_value(v)? {
                return Ok(true);
            }
        }
        // ALLSET: every requested value must appear among the row's values.
        if self.cond == CondType::AllSet {
            return Ok(!self.values.is_empty()
                && self.values.iter().all(|want| {
                    values
                        .iter()
                        .any(|have| have.compare(want, &self.collate) == Ok(std::cmp::Ordering::Equal))
                }));
        }
        Ok(false)
    }

    fn matches_value(&self, v: &Variant) -> Result<bool> {
        use std::cmp::Ordering;
        Ok(match self.cond {
            CondType::Eq | CondType::Set => self
                .values
                .iter()
                .any(|want| v.compare(want, &self.collate) == Ok(Ordering::Equal)),
            CondType::AllSet => false,
            CondType::Lt => self.cmp_first(v)? == Ordering::Less,
            CondType::Le => self.cmp_first(v)? != Ordering::Greater,
            CondType::Gt => self.cmp_first(v)? == Ordering::Greater,
            CondType::Ge => self.cmp_first(v)? != Ordering::Less,
            CondType::Range => {
                v.compare(&self.values[0], &self.collate)? != Ordering::Less
                    && v.compare(&self.values[1], &self.collate)? != Ordering::Greater
            }
            CondType::Like => {
                let pattern = self.values[0].as_str().unwrap_or_default();
                match v.as_str() {
                    Some(s) => like_match(s, pattern),
                    None => false,
                }
            }
            CondType::DWithin => {
                let (Some(Variant::Point { x: cx, y: cy }), Some(r)) = (
                    self.values.first(),
                    self.values.get(1).and_then(|r| match r {
                        Variant::Double(r) => Some(*r),
                        Variant::Int(r) => Some(*r as f64),
                        Variant::Int64(r) => Some(*r as f64),
                        _ => None,
                    }),
                ) else {
                    return Err(Error::params("DWITHIN requires (point, radius)"));
                };
                match v {
                    Variant::Point { x, y } => {
                        let (dx, dy) = (x - cx, y - cy);
                        dx * dx + dy * dy <= r * r
                    }
                    _ => false,
                }
            }
            CondType::Any | CondType::Empty => unreachable!("handled before value loop"),
        })
    }

    fn cmp_first(&self, v: &Variant) -> Result<std::cmp::Ordering> {
        let want = self
            .values
            .first()
            .ok_or_else(|| Error::params("condition requires a value"))?;
        v.compare(want, &self.collate)
    }
}

/// `%`-wildcard matching, ASCII case-insensitive; `_` matches one char.
pub fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[u8], p: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'%'), _) => {
                if inner(s, &p[1..]) {
                    return true;
                }
                !s.is_empty() && inner(&s[1..], p)
            }
            (Some(b'_'), Some(_)) => inner(&s[1..], &p[1..]),
            (Some(&pc), Some(&sc)) => {
                pc.to_ascii_lowercase() == sc.to_ascii_lowercase() && inner(&s[1..], &p[1..])
            }
            _ => false,
        }
    }
    inner(s.as_bytes(), pattern.as_bytes())
}

/// Position of a value in a forced-order list, for hoisted sorting.
pub fn forced_rank(value: &Variant, forced: &[Variant], collate: &CollateOpts) -> Option<usize> {
    forced.iter().position(|f| {
        matches!(
            value.compare(f, collate),
            Ok(std::cmp::Ordering::Equal)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards() {
        assert!(like_match("hello world", "hello%"));
        assert!(like_match("hello", "h_llo"));
        assert!(like_match("HELLO", "hello"));
        assert!(like_match("abc", "%b%"));
        assert!(!like_match("abc", "b%"));
        assert!(like_match("", "%"));
        assert!(!like_match("x", ""));
    }

    #[test]
    fn forced_rank_uses_collation() {
        let forced = vec![Variant::string("B"), Variant::string("a")];
        let collate = CollateOpts::new(crate::types::CollateMode::Ascii);
        assert_eq!(
            forced_rank(&Variant::string("b"), &forced, &collate),
            Some(0)
        );
        assert_eq!(
            forced_rank(&Variant::string("A"), &forced, &collate),
            Some(1)
        );
        assert_eq!(forced_rank(&Variant::string("z"), &forced, &collate), None);
    }
}
