//! # Transaction Engine
//!
//! A transaction is an ordered log of staged steps bound to one namespace.
//! Nothing is observable until commit: steps accumulate in the handle, and
//! `Database::commit_transaction` applies them in order under the
//! namespace's exclusive lock, so concurrent selects see either none or
//! all of a transaction's effects.
//!
//! ## States
//!
//! ```text
//! Open ──commit──> Committed
//!   │──rollback──> RolledBack
//!   └──deadline──> Expired        (background sweeper)
//! ```
//!
//! All terminal states are absorbing. Client-scoped transactions carry an
//! idle deadline; the background task rolls back the ones that outlive it.
//!
//! ## Partial Failure
//!
//! If a step fails after at least one has been applied, the commit keeps
//! the applied prefix and reports the first error; the WAL records exactly
//! the applied steps, so replicas converge on the same prefix.

use std::time::Instant;

use crate::query::Query;
use crate::wal::ModifyMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
    Expired,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        self != TxState::Open
    }
}

#[derive(Debug, Clone)]
pub enum TxStep {
    ModifyItem {
        json: String,
        mode: ModifyMode,
        precepts: Vec<String>,
    },
    UpdateQuery(Query),
    DeleteQuery(Query),
}

#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub namespace: String,
    pub(crate) steps: Vec<TxStep>,
    pub(crate) state: TxState,
    /// Tag-matcher version at `NewTransaction` time; commit re-validates.
    pub(crate) tags_version: u32,
    /// Payload-type field count at start, for rebinding checks.
    pub(crate) payload_fields: usize,
    pub(crate) deadline: Option<Instant>,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        namespace: String,
        tags_version: u32,
        payload_fields: usize,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            namespace,
            steps: Vec::new(),
            state: TxState::Open,
            tags_version,
            payload_fields,
            deadline,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn push_item(&mut self, json: &str, mode: ModifyMode, precepts: Vec<String>) {
        self.steps.push(TxStep::ModifyItem {
            json: json.to_string(),
            mode,
            precepts,
        });
    }

    pub(crate) fn push_query(&mut self, query: Query) {
        if query.update_fields.is_empty() {
            self.steps.push(TxStep::DeleteQuery(query));
        } else {
            self.steps.push(TxStep::UpdateQuery(query));
        }
    }

    pub(crate) fn expired_at(&self, now: Instant) -> bool {
        self.state == TxState::Open && self.deadline.is_some_and(|d| now >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn steps_accumulate_in_order() {
        let mut tx = Transaction::new(1, "books".to_string(), 0, 0, None);
        tx.push_item("{}", ModifyMode::Upsert, Vec::new());
        tx.push_query(Query::new("books"));
        assert_eq!(tx.len(), 2);
        assert!(matches!(tx.steps[0], TxStep::ModifyItem { .. }));
        assert!(matches!(tx.steps[1], TxStep::DeleteQuery(_)));
    }

    #[test]
    fn update_query_is_detected_by_set_list() {
        let mut tx = Transaction::new(1, "books".to_string(), 0, 0, None);
        tx.push_query(Query::new("books").set("price", crate::types::Variant::Int(1)));
        assert!(matches!(tx.steps[0], TxStep::UpdateQuery(_)));
    }

    #[test]
    fn deadline_expiry() {
        let now = Instant::now();
        let tx = Transaction::new(
            1,
            "books".to_string(),
            0,
            0,
            Some(now - Duration::from_secs(1)),
        );
        assert!(tx.expired_at(now));
        let open = Transaction::new(2, "books".to_string(), 0, 0, None);
        assert!(!open.expired_at(now));
    }
}
