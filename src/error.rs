//! # Engine Error Type
//!
//! Every fallible operation in the engine returns [`Error`], a pairing of a
//! numeric [`ErrorKind`] and a human-readable message. The kind is part of
//! the public contract: transport layers map it to an HTTP status or return
//! it verbatim over binary RPC, and clients branch on it (for example
//! `TagsMismatch` means "refresh the tag dictionary and retry").
//!
//! ## Kind Semantics
//!
//! | Kind | Meaning | HTTP |
//! |------|---------|------|
//! | Parse | Query text or DSL could not be parsed | 400 |
//! | Params | Valid syntax, invalid arguments (bad condition for index, type mismatch) | 400 |
//! | Logic | Internal contract violated | 500 |
//! | NotFound | Namespace / item / index does not exist | 404 |
//! | Forbidden | Operation rejected by policy | 403 |
//! | StateInvalidated | Client tag-matcher version is stale | 409 |
//! | TagsMismatch | Server tag-matcher extended past client's | 409 |
//! | Timeout | Execution deadline exceeded | 408 |
//! | Canceled | Cooperative cancellation | 499 |
//! | Conflict | Duplicate PK on insert, transaction id clash | 409 |
//! | IOError | Storage backend failure | 500 |
//! | Replication | Divergent replication state | 500 |
//! | NamespaceInvalidated | Namespace dropped or marked read-only under use | 500 |
//!
//! ## Propagation Policy
//!
//! Parse/Params/Logic errors never mutate state. A storage failure that
//! leaves the WAL non-durable marks the namespace invalidated; every later
//! write on it fails with `NamespaceInvalidated` until it is reopened.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    Parse = 1,
    Params = 2,
    Logic = 3,
    NotFound = 4,
    Forbidden = 5,
    StateInvalidated = 6,
    TagsMismatch = 7,
    Timeout = 8,
    Canceled = 9,
    Conflict = 10,
    IOError = 11,
    Replication = 12,
    NamespaceInvalidated = 13,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Status code a REST transport reports for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Parse | ErrorKind::Params => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::Conflict | ErrorKind::StateInvalidated | ErrorKind::TagsMismatch => 409,
            ErrorKind::Canceled => 499,
            ErrorKind::Logic
            | ErrorKind::IOError
            | ErrorKind::Replication
            | ErrorKind::NamespaceInvalidated => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Params => "params",
            ErrorKind::Logic => "logic",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::StateInvalidated => "state_invalidated",
            ErrorKind::TagsMismatch => "tags_mismatch",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Conflict => "conflict",
            ErrorKind::IOError => "io_error",
            ErrorKind::Replication => "replication",
            ErrorKind::NamespaceInvalidated => "namespace_invalidated",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {msg}")]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, msg)
    }

    pub fn params(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Params, msg)
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::IOError, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Parse, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping_matches_contract() {
        assert_eq!(ErrorKind::Parse.http_status(), 400);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::TagsMismatch.http_status(), 409);
        assert_eq!(ErrorKind::Canceled.http_status(), 499);
        assert_eq!(ErrorKind::IOError.http_status(), 500);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::params("cannot compare string with point");
        assert_eq!(err.to_string(), "params: cannot compare string with point");
    }
}
