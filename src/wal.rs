//! # Write-Ahead Log
//!
//! Bounded in-memory ring of mutation records keyed by LSN, one per
//! namespace. The ring always holds a contiguous suffix of the namespace's
//! history; older records age out as the ring wraps. Every record is also
//! persisted through the storage sink (`wal/<lsn>` keys), and replication
//! observers receive the same stream.
//!
//! ## Record Kinds
//!
//! | Kind | Payload |
//! |------|---------|
//! | ItemModify | mode + serialized row (fixed prefix + CJSON body) |
//! | IndexAdd / IndexUpdate / IndexDrop | index definition / name |
//! | PutMeta | versioned sys record (tag matcher, schema) |
//! | TxBegin / TxCommit | transaction frame markers |
//!
//! ## Invariants
//!
//! LSNs are strictly increasing for the lifetime of the namespace,
//! including across restarts: recovery seeds the counter from the highest
//! persisted LSN.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::index::IndexDef;
use crate::types::{IdType, Lsn};

/// How an item record mutates the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifyMode {
    Upsert,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalRecord {
    ItemModify {
        id: IdType,
        mode: ModifyMode,
        /// Serialized row: fixed prefix + CJSON body (empty for deletes).
        row: Vec<u8>,
        #[serde(default)]
        in_transaction: bool,
    },
    IndexAdd {
        def: IndexDef,
    },
    IndexUpdate {
        def: IndexDef,
    },
    IndexDrop {
        name: String,
    },
    PutMeta {
        key: String,
        value: Vec<u8>,
    },
    TxBegin,
    TxCommit,
}

impl WalRecord {
    pub fn kind_name(&self) -> &'static str {
        match self {
            WalRecord::ItemModify { .. } => "item_modify",
            WalRecord::IndexAdd { .. } => "index_add",
            WalRecord::IndexUpdate { .. } => "index_update",
            WalRecord::IndexDrop { .. } => "index_drop",
            WalRecord::PutMeta { .. } => "put_meta",
            WalRecord::TxBegin => "tx_begin",
            WalRecord::TxCommit => "tx_commit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub lsn: Lsn,
    pub record: WalRecord,
}

/// Bounded ring of WAL entries plus the namespace LSN counter.
#[derive(Debug)]
pub struct Wal {
    ring: VecDeque<WalEntry>,
    capacity: usize,
    server_id: i16,
    counter: i64,
}

impl Wal {
    pub fn new(capacity: usize, server_id: i16) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            server_id,
            counter: 0,
        }
    }

    /// Seed the counter after recovery so LSNs keep increasing across
    /// restarts.
    pub fn restore_counter(&mut self, last_seen: Lsn) {
        self.counter = self.counter.max(last_seen.counter());
    }

    pub fn next_lsn(&mut self) -> Lsn {
        self.counter += 1;
        Lsn::new(self.server_id, self.counter)
    }

    pub fn last_lsn(&self) -> Lsn {
        Lsn::new(self.server_id, self.counter)
    }

    pub fn add(&mut self, record: WalRecord) -> WalEntry {
        let entry = WalEntry {
            lsn: self.next_lsn(),
            record,
        };
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(entry.clone());
        entry
    }

    pub fn first_lsn(&self) -> Option<Lsn> {
        self.ring.front().map(|e| e.lsn)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Entries with LSN strictly greater than `from`.
    pub fn iter_from(&self, from: Lsn) -> impl Iterator<Item = &WalEntry> {
        let start = self.ring.partition_point(|e| e.lsn <= from);
        self.ring.range(start..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsns_are_strictly_increasing() {
        let mut wal = Wal::new(16, 3);
        let a = wal.add(WalRecord::TxBegin);
        let b = wal.add(WalRecord::TxCommit);
        assert!(b.lsn > a.lsn);
        assert_eq!(a.lsn.server_id(), 3);
    }

    #[test]
    fn ring_keeps_contiguous_suffix() {
        let mut wal = Wal::new(3, 0);
        for _ in 0..5 {
            wal.add(WalRecord::TxBegin);
        }
        assert_eq!(wal.len(), 3);
        assert_eq!(wal.first_lsn().unwrap().counter(), 3);
        let tail: Vec<i64> = wal
            .iter_from(Lsn::new(0, 3))
            .map(|e| e.lsn.counter())
            .collect();
        assert_eq!(tail, vec![4, 5]);
    }

    #[test]
    fn restore_counter_resumes_past_recovered_history() {
        let mut wal = Wal::new(8, 0);
        wal.restore_counter(Lsn::new(0, 41));
        assert_eq!(wal.add(WalRecord::TxBegin).lsn.counter(), 42);
    }

    #[test]
    fn records_roundtrip_through_serde() {
        let entry = WalEntry {
            lsn: Lsn::new(1, 7),
            record: WalRecord::ItemModify {
                id: 3,
                mode: ModifyMode::Upsert,
                row: vec![1, 2, 3],
                in_transaction: true,
            },
        };
        let bytes = serde_json::to_vec(&entry).unwrap();
        let back: WalEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, entry);
    }
}
