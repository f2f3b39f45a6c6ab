//! # VantaDB - In-Memory Document Database Engine
//!
//! VantaDB is an embeddable, document-oriented database engine for
//! read-heavy workloads over semi-structured JSON records. It combines an
//! in-memory item table with typed secondary indexes, a SQL-like query
//! language, multi-statement transactions, WAL-based durability with an
//! optional disk backend, and a full-text search subsystem.
//!
//! ## Quick Start
//!
//! ```ignore
//! use vantadb::{Database, DatabaseConfig, IndexDef, IndexType, KeyValueType, Context};
//!
//! let db = Database::open_in_memory()?;
//! db.open_namespace("books")?;
//! db.add_index("books", IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk())?;
//! db.add_index("books", IndexDef::new("title", IndexType::Hash, KeyValueType::String))?;
//!
//! db.upsert("books", r#"{"id": 1, "title": "Dune"}"#)?;
//!
//! let rows = db.select_sql(
//!     "SELECT * FROM books WHERE title = 'Dune' ORDER BY id DESC",
//!     &Context::new(),
//! )?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │         Database (namespaces, tx, subs)       │
//! ├───────────────────────────────────────────────┤
//! │  SQL / JSON DSL  │  Selector (plan + merge)   │
//! ├───────────────────────────────────────────────┤
//! │ Namespace: item table │ index layer │ tags    │
//! ├───────────────────────────────────────────────┤
//! │   WAL ring  │  storage sink  │  update hub    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Each namespace is guarded by one shared/exclusive lock: selects run
//! shared and observe a consistent snapshot, mutations run exclusive and
//! get strictly monotonic LSNs. A background task builds index sort
//! orders in two phases, expires TTL rows, reclaims interned strings and
//! flushes storage.
//!
//! ## Error Model
//!
//! Every failure is an [`Error`] with a numeric [`ErrorKind`] that maps
//! one-to-one onto transport status codes; cancellation and deadline
//! expiry are ordinary typed errors, not panics.

pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod index;
pub mod namespace;
pub mod payload;
pub mod query;
pub mod replication;
pub mod select;
pub mod sql;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use config::{DatabaseConfig, FtFastConfig, FtFuzzyConfig};
pub use context::Context;
pub use database::Database;
pub use error::{Error, ErrorKind, Result};
pub use index::{CondType, IndexDef, IndexOpts};
pub use query::{dsl::parse_dsl, AggType, AggregateEntry, JoinType, OpType, Query};
pub use replication::{UpdatesFilter, UpdatesPoll, UpdatesSubscription};
pub use select::results::QueryResults;
pub use sql::parser::{parse_sql, SqlStatement};
pub use txn::TxState;
pub use types::{value::Variant, CollateMode, CollateOpts, IndexType, KeyValueType, Lsn};
pub use wal::ModifyMode;
