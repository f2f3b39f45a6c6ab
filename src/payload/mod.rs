//! # Payload Layer
//!
//! A document in a namespace is stored as a pair:
//!
//! - a **fixed row** of typed cells, one per field declared in the
//!   namespace's [`PayloadType`] (the schema of indexed columns), and
//! - a **dynamic body** in CJSON, a compact binary JSON encoding that
//!   replaces object keys with small integer tags from the namespace's
//!   [`TagsMatcher`].
//!
//! The split keeps index maintenance cheap (cells are pre-converted to the
//! declared column type) while leaving the document schema-free outside the
//! indexed prefix.
//!
//! ```text
//! {"id": 7, "title": "Dune", "meta": {"pages": 412}}
//!        │                          │
//!        v                          v
//! PayloadValue.cells         PayloadValue.body (CJSON)
//! [Int(7), String("Dune")]   tag(meta){ tag(pages): 412 }
//! ```

pub mod cjson;
pub mod tags;
pub mod types;
pub mod value;

pub use tags::{TagId, TagsMatcher};
pub use types::{PayloadField, PayloadType};
pub use value::{FieldCell, Payload, PayloadValue};
