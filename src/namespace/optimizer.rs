//! # Background Optimizer
//!
//! Two-phase, per-namespace state machine driven by the database's
//! background task:
//!
//! ```text
//! NotOptimized ──> OptimizingIndexes ──> OptimizingSortOrders ──> OptimizationCompleted
//!       ^                                                              │
//!       └──────────────────── any write ──────────────────────────────┘
//! ```
//!
//! Phase one commits deferred index structures (full-text rebuilds run in
//! bounded steps). Phase two builds each ordered index's dense sort-order
//! permutation. Work is chunked, with the cancellation token checked
//! between chunks; a canceled pass leaves the state where it stopped so
//! the next wake-up resumes instead of restarting.
//!
//! The same pass expires TTL rows and reclaims parked strings, both of
//! which need the quiescence the exclusive lock provides.

use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::namespace::{NamespaceImpl, OptimizationState};
use crate::types::IdType;

/// Advance the optimization state machine one pass. Returns `true` when
/// the namespace reached `OptimizationCompleted`.
pub fn optimize(ns: &mut NamespaceImpl, ctx: &Context) -> Result<bool> {
    loop {
        match ns.optimization_state() {
            OptimizationState::OptimizationCompleted => return Ok(true),
            OptimizationState::NotOptimized => {
                ns.set_optimization_state(OptimizationState::OptimizingIndexes);
            }
            OptimizationState::OptimizingIndexes => {
                // Cancellation here keeps the state so the next wake-up
                // re-enters this phase.
                for index in &mut ns.indexes {
                    ctx.check()?;
                    index.commit(ctx)?;
                    while index.ft_dirty() {
                        ctx.check()?;
                        index.commit(ctx)?;
                    }
                }
                ns.set_optimization_state(OptimizationState::OptimizingSortOrders);
            }
            OptimizationState::OptimizingSortOrders => {
                let total = ns.items.len();
                for index in &mut ns.indexes {
                    ctx.check()?;
                    index.update_sorted_ids(total, ctx)?;
                }
                ns.set_optimization_state(OptimizationState::OptimizationCompleted);
                debug!(namespace = %ns.name, "sort orders built");
            }
        }
    }
}

/// Delete rows whose TTL index timestamp fell behind `now - expire_after`.
pub fn expire_ttl(ns: &mut NamespaceImpl, now_unix: i64) -> Result<usize> {
    let mut expired: Vec<IdType> = Vec::new();
    for index in &ns.indexes {
        expired.extend(index.expired_ids(now_unix));
    }
    expired.sort_unstable();
    expired.dedup();
    for &id in &expired {
        ns.do_delete(id, false)?;
    }
    if !expired.is_empty() {
        debug!(namespace = %ns.name, count = expired.len(), "expired ttl rows");
    }
    Ok(expired.len())
}

/// Reclaim strings parked by deletes; safe only under the exclusive lock.
pub fn remove_expired_strings(ns: &mut NamespaceImpl) -> usize {
    ns.strings.remove_expired()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDef;
    use crate::replication::UpdatesHub;
    use crate::types::{IndexType, KeyValueType};
    use crate::wal::ModifyMode;
    use std::sync::Arc;

    fn ns_with_tree() -> NamespaceImpl {
        let mut ns = NamespaceImpl::new(
            "opt",
            0,
            1024,
            16,
            16,
            None,
            Arc::new(UpdatesHub::new(4)),
        )
        .unwrap();
        ns.add_index(IndexDef::new("id", IndexType::Tree, KeyValueType::Int).pk())
            .unwrap();
        for i in [5, 1, 3] {
            ns.modify_item_json(
                &format!(r#"{{"id":{i}}}"#),
                ModifyMode::Upsert,
                &[],
                false,
            )
            .unwrap();
        }
        ns
    }

    #[test]
    fn state_machine_progresses_to_completed() {
        let mut ns = ns_with_tree();
        assert_eq!(ns.optimization_state(), OptimizationState::NotOptimized);
        assert!(optimize(&mut ns, &Context::new()).unwrap());
        assert_eq!(
            ns.optimization_state(),
            OptimizationState::OptimizationCompleted
        );
        assert!(ns.indexes[0].sort_orders().is_some());
    }

    #[test]
    fn write_resets_state_and_invalidates_nothing_mid_flight() {
        let mut ns = ns_with_tree();
        optimize(&mut ns, &Context::new()).unwrap();
        ns.modify_item_json(r#"{"id":9}"#, ModifyMode::Upsert, &[], false)
            .unwrap();
        assert_eq!(ns.optimization_state(), OptimizationState::NotOptimized);
        // Next pass rebuilds and completes again.
        assert!(optimize(&mut ns, &Context::new()).unwrap());
    }

    #[test]
    fn ttl_expiry_deletes_old_rows() {
        let mut ns = NamespaceImpl::new(
            "ttl",
            0,
            1024,
            16,
            16,
            None,
            Arc::new(UpdatesHub::new(4)),
        )
        .unwrap();
        ns.add_index(IndexDef::new("id", IndexType::Hash, KeyValueType::Int).pk())
            .unwrap();
        ns.add_index(
            IndexDef::new("stamp", IndexType::Ttl, KeyValueType::Int64).expire_after(3600),
        )
        .unwrap();
        ns.modify_item_json(r#"{"id":1,"stamp":100}"#, ModifyMode::Upsert, &[], false)
            .unwrap();
        ns.modify_item_json(
            r#"{"id":2,"stamp":1000000}"#,
            ModifyMode::Upsert,
            &[],
            false,
        )
        .unwrap();
        let removed = expire_ttl(&mut ns, 100 + 3600 + 1000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ns.item_count(), 1);
    }
}
