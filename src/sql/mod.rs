//! # SQL Dialect
//!
//! The SQL-like query surface: a zero-copy lexer, a recursive-descent
//! parser lowering into the [`crate::query::Query`] tree, and a
//! cursor-probing suggester for interactive completion.
//!
//! Supported statements:
//!
//! ```text
//! [EXPLAIN] SELECT <fields|aggregates> FROM ns [joins] [WHERE ...]
//!           [ORDER BY f [DESC|ASC], ...] [LIMIT n] [OFFSET n]
//! UPDATE ns SET f = v, ... [WHERE ...]
//! DELETE FROM ns [WHERE ...]
//! TRUNCATE ns
//! ```
//!
//! Hard parse errors carry line and column of the offending token.

pub mod lexer;
pub mod parser;
pub mod suggest;

pub use lexer::{Keyword, Lexer, Token, TokenKind};
pub use parser::parse_sql;
pub use suggest::{suggest, SuggestionContext};
