//! # Core Type Vocabulary
//!
//! Shared scalar type tags, collation options and identifier newtypes used
//! across the payload, index and query layers.
//!
//! ## Identifiers
//!
//! - [`IdType`]: dense item slot id inside one namespace. Free slots are
//!   recycled, so an id is only meaningful together with the item's LSN.
//! - [`SortType`]: rank inside a built sort order (see the optimizer).
//! - [`Lsn`]: 64-bit per-namespace sequence number; the upper bits carry the
//!   originating server id so replicated records stay attributable.
//!
//! ## LSN Layout
//!
//! ```text
//! 63           48 47                        0
//! +--------------+--------------------------+
//! | server (15)  | counter (48, monotonic)  |
//! +--------------+--------------------------+
//! ```

pub mod value;

pub use value::{Variant, VariantArray};

use serde::{Deserialize, Serialize};

/// Dense item slot id within a namespace.
pub type IdType = u32;

/// Rank within a built sort order.
pub type SortType = u32;

/// Sentinel rank for ids that are absent from a sort order.
pub const SORT_UNBUILT: SortType = SortType::MAX;

const LSN_COUNTER_BITS: u32 = 48;
const LSN_COUNTER_MASK: i64 = (1 << LSN_COUNTER_BITS) - 1;

/// Per-namespace log sequence number with embedded server id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub i64);

impl Lsn {
    pub fn new(server_id: i16, counter: i64) -> Self {
        Self(((server_id as i64) << LSN_COUNTER_BITS) | (counter & LSN_COUNTER_MASK))
    }

    pub fn counter(self) -> i64 {
        self.0 & LSN_COUNTER_MASK
    }

    pub fn server_id(self) -> i16 {
        (self.0 >> LSN_COUNTER_BITS) as i16
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Scalar type tag of a [`Variant`] or payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyValueType {
    Null,
    Bool,
    Int,
    Int64,
    Double,
    String,
    Composite,
    Point,
}

impl KeyValueType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Bool | Self::Int | Self::Int64 | Self::Double)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Int64 => "int64",
            Self::Double => "double",
            Self::String => "string",
            Self::Composite => "composite",
            Self::Point => "point",
        }
    }
}

/// Access-pattern flavor of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// B-tree-like; equality and ranges, key-ordered iteration.
    Tree,
    /// Hash map; equality and set membership only.
    Hash,
    /// Dense column store; comparator scans only.
    ColumnStore,
    /// Inverted full-text index with stemming and BM25-style scoring.
    FullTextFast,
    /// Trigram full-text index.
    FullTextFuzzy,
    /// R-tree style point index supporting `DWITHIN`.
    RTree,
    /// Ordered int64 index whose entries expire after a fixed TTL.
    Ttl,
}

impl IndexType {
    pub fn is_fulltext(self) -> bool {
        matches!(self, Self::FullTextFast | Self::FullTextFuzzy)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Tree | Self::Ttl)
    }
}

/// String comparison rule attached to string columns and indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollateMode {
    /// Byte-wise comparison.
    #[default]
    None,
    /// ASCII case-insensitive.
    Ascii,
    /// UTF-8 case-insensitive (full case folding via `char::to_lowercase`).
    Utf8,
    /// Numeric substrings compared as numbers (`"img9" < "img10"`).
    Numeric,
    /// Caller-supplied ordering table; characters absent from the table
    /// fall back to their scalar value ordering after all table entries.
    Custom,
}

/// Collation mode plus the ordering table backing `CollateMode::Custom`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateOpts {
    pub mode: CollateMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_order: Vec<char>,
}

impl CollateOpts {
    pub fn new(mode: CollateMode) -> Self {
        Self {
            mode,
            custom_order: Vec::new(),
        }
    }

    pub fn custom(order: impl IntoIterator<Item = char>) -> Self {
        Self {
            mode: CollateMode::Custom,
            custom_order: order.into_iter().collect(),
        }
    }

    pub(crate) fn custom_weight(&self, c: char) -> u32 {
        match self.custom_order.iter().position(|&o| o == c) {
            Some(pos) => pos as u32,
            None => self.custom_order.len() as u32 + c as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_packs_server_and_counter() {
        let lsn = Lsn::new(7, 123_456);
        assert_eq!(lsn.server_id(), 7);
        assert_eq!(lsn.counter(), 123_456);
        assert!(Lsn::new(7, 2) > Lsn::new(7, 1));
    }

    #[test]
    fn custom_weight_orders_table_before_rest() {
        let opts = CollateOpts::custom(['z', 'a']);
        assert!(opts.custom_weight('z') < opts.custom_weight('a'));
        assert!(opts.custom_weight('a') < opts.custom_weight('b'));
    }
}
