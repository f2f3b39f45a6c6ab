//! # Storage Sink
//!
//! Pluggable key-value persistence behind every namespace. The contract is
//! deliberately small: atomic single-key writes, point reads, ordered
//! prefix iteration, deletes, and a `flush` that makes all prior writes
//! durable. The engine layers its own record framing (sys records, item
//! records, WAL suffix) on top of these five calls.
//!
//! Two backends ship with the crate:
//!
//! - [`disk::LogStorage`]: CRC-framed append-only segments with an
//!   in-memory key directory and mmap reads.
//! - [`mem::MemStorage`]: ordered map, for tests and storage-less
//!   namespaces.

pub mod disk;
pub mod mem;

use crate::error::Result;

pub trait Storage: Send + Sync {
    fn write(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Visit `(key, value)` pairs with the given prefix in ascending key
    /// order; the callback returns `false` to stop early.
    fn iterate_prefix(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()>;

    /// Persist all prior writes durably.
    fn flush(&self) -> Result<()>;
}
