//! # Database Facade
//!
//! The engine's public surface: a registry of namespaces behind
//! shared/exclusive locks, the transaction registry, the update-stream
//! hub, and the background task that runs the optimizer, TTL expiry,
//! string reclamation, storage flushing and the transaction sweeper.
//!
//! ## Locking
//!
//! Selects take the namespace lock shared; every mutation takes it
//! exclusive. A select that touches several namespaces (joins) acquires
//! their locks in sorted-name order, so concurrent multi-namespace
//! selects cannot deadlock. One special case: a select whose full-text
//! index has uncommitted text takes the exclusive lock instead and
//! commits the index first.
//!
//! ## Mirror of the wire API
//!
//! The methods here mirror the REST/RPC command set (open namespace, add
//! index, modify item, select/SQL, transactions, subscribe), so a
//! transport layer stays a thin codec.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::index::IndexDef;
use crate::namespace::{optimizer, NamespaceImpl};
use crate::query::Query;
use crate::replication::{UpdatesFilter, UpdatesHub, UpdatesSubscription};
use crate::select::results::QueryResults;
use crate::select::JoinTarget;
use crate::sql::parser::{parse_sql, SqlStatement};
use crate::sql::suggest::{self, SuggestionContext};
use crate::storage::{disk::LogStorage, Storage};
use crate::txn::{Transaction, TxState, TxStep};
use crate::wal::ModifyMode;

type NsHandle = Arc<RwLock<NamespaceImpl>>;

struct DatabaseInner {
    config: DatabaseConfig,
    namespaces: RwLock<HashMap<String, NsHandle>>,
    hub: Arc<UpdatesHub>,
    transactions: Mutex<HashMap<u64, Transaction>>,
    tx_counter: AtomicU64,
    stop: Arc<AtomicBool>,
}

pub struct Database {
    inner: Arc<DatabaseInner>,
    bg_thread: Option<std::thread::JoinHandle<()>>,
}

impl Database {
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let inner = Arc::new(DatabaseInner {
            hub: Arc::new(UpdatesHub::new(config.updates_buffer_size)),
            namespaces: RwLock::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            tx_counter: AtomicU64::new(1),
            stop: Arc::new(AtomicBool::new(false)),
            config,
        });

        // Reopen namespaces already present under the storage root.
        if let Some(root) = inner.config.storage_path.clone() {
            if root.exists() {
                for entry in std::fs::read_dir(&root)
                    .map_err(|e| Error::new(ErrorKind::IOError, e.to_string()))?
                {
                    let entry =
                        entry.map_err(|e| Error::new(ErrorKind::IOError, e.to_string()))?;
                    if entry.path().is_dir() {
                        let name = entry.file_name().to_string_lossy().to_string();
                        inner.open_namespace(&name)?;
                    }
                }
            }
        }

        let bg_inner = inner.clone();
        let bg_thread = std::thread::Builder::new()
            .name("vantadb-bg".to_string())
            .spawn(move || bg_inner.background_loop())
            .map_err(|e| Error::new(ErrorKind::IOError, e.to_string()))?;

        info!(namespaces = inner.namespaces.read().len(), "database opened");
        Ok(Self {
            inner,
            bg_thread: Some(bg_thread),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(DatabaseConfig::in_memory())
    }

    // ------------------------------------------------------------------
    // Namespace lifecycle.
    // ------------------------------------------------------------------

    pub fn open_namespace(&self, name: &str) -> Result<()> {
        self.inner.open_namespace(name)
    }

    /// Flush and forget a namespace; its storage stays on disk.
    pub fn close_namespace(&self, name: &str) -> Result<()> {
        let handle = self.inner.take_namespace(name)?;
        let result = handle.write().flush_storage();
        result
    }

    /// Drop a namespace and its storage.
    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        let _ = self.inner.take_namespace(name)?;
        if let Some(root) = &self.inner.config.storage_path {
            let dir = root.join(name);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .map_err(|e| Error::new(ErrorKind::IOError, e.to_string()))?;
            }
        }
        info!(namespace = name, "dropped");
        Ok(())
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.namespaces.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    // ------------------------------------------------------------------
    // Index management.
    // ------------------------------------------------------------------

    pub fn add_index(&self, ns: &str, def: IndexDef) -> Result<()> {
        self.inner.ns(ns)?.write().add_index(def)
    }

    pub fn update_index(&self, ns: &str, def: IndexDef) -> Result<()> {
        self.inner.ns(ns)?.write().update_index(def)
    }

    pub fn drop_index(&self, ns: &str, name: &str) -> Result<()> {
        self.inner.ns(ns)?.write().drop_index(name)
    }

    // ------------------------------------------------------------------
    // Item mutations.
    // ------------------------------------------------------------------

    pub fn upsert(&self, ns: &str, json: &str) -> Result<()> {
        self.modify_item(ns, json, ModifyMode::Upsert, &[])
    }

    pub fn insert(&self, ns: &str, json: &str) -> Result<()> {
        self.modify_item(ns, json, ModifyMode::Insert, &[])
    }

    pub fn update(&self, ns: &str, json: &str) -> Result<()> {
        self.modify_item(ns, json, ModifyMode::Update, &[])
    }

    pub fn delete(&self, ns: &str, json: &str) -> Result<()> {
        self.modify_item(ns, json, ModifyMode::Delete, &[])
    }

    pub fn modify_item(
        &self,
        ns: &str,
        json: &str,
        mode: ModifyMode,
        precepts: &[String],
    ) -> Result<()> {
        self.inner
            .ns(ns)?
            .write()
            .modify_item_json(json, mode, precepts, false)
            .map(|_| ())
    }

    pub fn truncate(&self, ns: &str) -> Result<()> {
        self.inner.ns(ns)?.write().truncate()
    }

    // ------------------------------------------------------------------
    // Queries.
    // ------------------------------------------------------------------

    pub fn select(&self, query: &Query, ctx: &Context) -> Result<QueryResults> {
        let mut results = self.inner.select_one(query, ctx)?;
        for merged in &query.merge_queries {
            if merged.namespace != query.namespace {
                return Err(Error::params(
                    "merged sub-queries must target the same namespace",
                ));
            }
            let sub = self.inner.select_one(merged, ctx)?;
            results.total_count += sub.total_count;
            results.rows.extend(sub.rows);
        }
        Ok(results)
    }

    /// `SELECT ...` only; mutating statements go through `execute_sql`.
    pub fn select_sql(&self, sql: &str, ctx: &Context) -> Result<QueryResults> {
        match parse_sql(sql)? {
            SqlStatement::Select(query) => self.select(&query, ctx),
            _ => Err(Error::params("expected a SELECT statement")),
        }
    }

    /// Run any SQL statement; returns the number of affected rows for
    /// mutations and the result size for selects.
    pub fn execute_sql(&self, sql: &str, ctx: &Context) -> Result<usize> {
        match parse_sql(sql)? {
            SqlStatement::Select(query) => Ok(self.select(&query, ctx)?.len()),
            SqlStatement::Update(query) => {
                let ns = self.inner.ns(&query.namespace)?;
                let ids = ns.write().update_query(&query, ctx)?;
                Ok(ids.len())
            }
            SqlStatement::Delete(query) => {
                let ns = self.inner.ns(&query.namespace)?;
                let ids = ns.write().delete_query(&query, ctx)?;
                Ok(ids.len())
            }
            SqlStatement::Truncate(name) => {
                self.truncate(&name)?;
                Ok(0)
            }
        }
    }

    /// SQL completion candidates at a byte offset.
    pub fn suggest(&self, sql: &str, pos: usize) -> Vec<String> {
        suggest::suggest(sql, pos, self)
    }

    // ------------------------------------------------------------------
    // Transactions.
    // ------------------------------------------------------------------

    pub fn begin_transaction(&self, ns: &str) -> Result<u64> {
        let handle = self.inner.ns(ns)?;
        let guard = handle.read();
        let id = self.inner.tx_counter.fetch_add(1, Ordering::AcqRel);
        let tx = Transaction::new(
            id,
            ns.to_string(),
            guard.tags.version(),
            guard.payload_type.num_fields(),
            Some(Instant::now() + self.inner.config.tx_idle_timeout),
        );
        drop(guard);
        self.inner.transactions.lock().insert(id, tx);
        Ok(id)
    }

    pub fn tx_modify_item(
        &self,
        tx_id: u64,
        json: &str,
        mode: ModifyMode,
        precepts: &[String],
    ) -> Result<()> {
        let mut txs = self.inner.transactions.lock();
        let tx = open_tx(&mut txs, tx_id)?;
        tx.push_item(json, mode, precepts.to_vec());
        Ok(())
    }

    pub fn tx_modify_query(&self, tx_id: u64, query: Query) -> Result<()> {
        let mut txs = self.inner.transactions.lock();
        let tx = open_tx(&mut txs, tx_id)?;
        if tx.namespace != query.namespace {
            return Err(Error::params("transaction is bound to another namespace"));
        }
        tx.push_query(query);
        Ok(())
    }

    /// Apply all staged steps atomically with respect to selects. On a
    /// step failure the applied prefix stays and the first error is
    /// returned.
    pub fn commit_transaction(&self, tx_id: u64) -> Result<()> {
        let mut tx = {
            let mut txs = self.inner.transactions.lock();
            let tx = txs
                .remove(&tx_id)
                .ok_or_else(|| Error::not_found(format!("transaction {tx_id} not found")))?;
            if tx.state().is_terminal() {
                return Err(Error::conflict(format!(
                    "transaction {tx_id} is already {:?}",
                    tx.state()
                )));
            }
            tx
        };
        if tx.expired_at(Instant::now()) {
            tx.state = TxState::Expired;
            return Err(Error::timeout(format!("transaction {tx_id} expired")));
        }

        let handle = self.inner.ns(&tx.namespace)?;
        let mut ns = handle.write();
        if tx.payload_fields > ns.payload_type.num_fields()
            || tx.tags_version > ns.tags.version()
        {
            return Err(Error::conflict(
                "namespace evolved incompatibly since transaction start",
            ));
        }

        ns.wal_tx_begin()?;
        let ctx = Context::new();
        let mut first_error: Option<Error> = None;
        for step in std::mem::take(&mut tx.steps) {
            let outcome = match step {
                TxStep::ModifyItem {
                    json,
                    mode,
                    precepts,
                } => ns
                    .modify_item_json(&json, mode, &precepts, true)
                    .map(|_| ()),
                TxStep::UpdateQuery(query) => ns.update_query(&query, &ctx).map(|_| ()),
                TxStep::DeleteQuery(query) => ns.delete_query(&query, &ctx).map(|_| ()),
            };
            if let Err(e) = outcome {
                // Applied prefix stays; replicas observe the same prefix.
                first_error = Some(e);
                break;
            }
        }
        let commit_marker = ns.wal_tx_commit();
        tx.state = TxState::Committed;

        match first_error {
            Some(e) => {
                warn!(tx = tx_id, error = %e, "transaction committed partially");
                Err(e)
            }
            None => commit_marker,
        }
    }

    /// Roll back before commit: no side effects.
    pub fn rollback_transaction(&self, tx_id: u64) -> Result<()> {
        let mut txs = self.inner.transactions.lock();
        match txs.remove(&tx_id) {
            Some(mut tx) if tx.state() == TxState::Open => {
                tx.state = TxState::RolledBack;
                Ok(())
            }
            Some(tx) => Err(Error::conflict(format!(
                "transaction {tx_id} is already {:?}",
                tx.state()
            ))),
            None => Err(Error::not_found(format!("transaction {tx_id} not found"))),
        }
    }

    // ------------------------------------------------------------------
    // Updates stream.
    // ------------------------------------------------------------------

    pub fn subscribe_updates(&self, filter: UpdatesFilter) -> UpdatesSubscription {
        self.inner.hub.subscribe(filter)
    }

    // ------------------------------------------------------------------
    // Introspection.
    // ------------------------------------------------------------------

    pub fn index_defs(&self, ns: &str) -> Result<Vec<IndexDef>> {
        Ok(self.inner.ns(ns)?.read().index_defs())
    }

    pub fn item_count(&self, ns: &str) -> Result<usize> {
        Ok(self.inner.ns(ns)?.read().item_count())
    }

    pub fn mem_stats(&self, ns: &str) -> Result<Vec<crate::index::IndexMemStat>> {
        Ok(self.inner.ns(ns)?.read().mem_stats())
    }
}

impl SuggestionContext for Database {
    fn namespace_names(&self) -> Vec<String> {
        self.namespace_names()
    }

    fn field_names(&self, namespace: &str) -> Vec<String> {
        self.inner
            .ns(namespace)
            .map(|h| h.read().field_names())
            .unwrap_or_default()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.bg_thread.take() {
            let _ = handle.join();
        }
        for handle in self.inner.namespaces.read().values() {
            let _ = handle.write().flush_storage();
        }
        self.inner.hub.close_all();
    }
}

impl DatabaseInner {
    fn ns(&self, name: &str) -> Result<NsHandle> {
        self.namespaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("namespace '{name}' not found")))
    }

    fn take_namespace(&self, name: &str) -> Result<NsHandle> {
        self.namespaces
            .write()
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("namespace '{name}' not found")))
    }

    fn open_namespace(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::params(format!("bad namespace name '{name}'")));
        }
        if self.namespaces.read().contains_key(name) {
            return Ok(());
        }
        let storage: Option<Arc<dyn Storage>> = match &self.config.storage_path {
            Some(root) => Some(Arc::new(LogStorage::open(&root.join(name))?)),
            None => None,
        };
        let ns = NamespaceImpl::new(
            name,
            self.config.server_id,
            self.config.wal_size,
            self.config.query_cache_size,
            self.config.join_cache_size,
            storage,
            self.hub.clone(),
        )?;
        self.namespaces
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ns)));
        Ok(())
    }

    /// Select over one namespace plus its join targets, locks taken in
    /// sorted-name order.
    fn select_one(&self, query: &Query, ctx: &Context) -> Result<QueryResults> {
        let main = self.ns(&query.namespace)?;

        // Full-text commit needs the exclusive lock; do it before taking
        // the shared locks for the actual select.
        if main.read().needs_ft_commit(query) {
            main.write().commit_ft_indexes(ctx)?;
        }

        let mut join_names: Vec<&str> = query
            .join_queries
            .iter()
            .map(|j| j.query.namespace.as_str())
            .collect();
        join_names.sort_unstable();
        join_names.dedup();

        let join_handles: HashMap<&str, NsHandle> = join_names
            .iter()
            .map(|&n| Ok((n, self.ns(n)?)))
            .collect::<Result<_>>()?;

        // Deadlock avoidance: all lock acquisitions ordered by name.
        let mut ordered: Vec<&str> = join_names.clone();
        if !ordered.contains(&query.namespace.as_str()) {
            ordered.push(query.namespace.as_str());
        }
        ordered.sort_unstable();

        let mut guards: HashMap<&str, parking_lot::RwLockReadGuard<'_, NamespaceImpl>> =
            HashMap::new();
        for &name in &ordered {
            let handle = if name == query.namespace {
                &main
            } else {
                join_handles
                    .get(name)
                    .ok_or_else(|| Error::logic("join handle vanished"))?
            };
            guards.insert(name, handle.read());
        }

        let main_guard = guards
            .get(query.namespace.as_str())
            .ok_or_else(|| Error::logic("main namespace guard missing"))?;
        let targets: Vec<JoinTarget<'_>> = query
            .join_queries
            .iter()
            .map(|j| {
                guards
                    .get(j.query.namespace.as_str())
                    .map(|g| JoinTarget { ns: &**g })
                    .ok_or_else(|| Error::logic("join guard missing"))
            })
            .collect::<Result<_>>()?;

        crate::select::execute(&**main_guard, query, ctx, &targets)
    }

    fn background_loop(self: Arc<Self>) {
        let ctx = Context::with_cancel(self.stop.clone());
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(self.config.bg_interval);

            // Transaction sweeper: expired handles become terminal.
            let now = Instant::now();
            {
                let mut txs = self.transactions.lock();
                txs.retain(|id, tx| {
                    if tx.expired_at(now) {
                        warn!(tx = id, "transaction expired, rolling back");
                        tx.state = TxState::Expired;
                        return false;
                    }
                    true
                });
            }

            let handles: Vec<NsHandle> = self.namespaces.read().values().cloned().collect();
            let now_unix = std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            for handle in handles {
                if self.stop.load(Ordering::Acquire) {
                    break;
                }
                let mut ns = handle.write();
                // Cancellation between phases leaves resumable state.
                if let Err(e) = optimizer::optimize(&mut ns, &ctx) {
                    if e.kind() != ErrorKind::Canceled {
                        warn!(namespace = %ns.name, error = %e, "optimizer pass failed");
                    }
                    continue;
                }
                let _ = optimizer::expire_ttl(&mut ns, now_unix);
                optimizer::remove_expired_strings(&mut ns);
                if let Err(e) = ns.flush_storage() {
                    warn!(namespace = %ns.name, error = %e, "storage flush failed");
                }
            }
        }
    }
}

fn open_tx<'a>(
    txs: &'a mut HashMap<u64, Transaction>,
    tx_id: u64,
) -> Result<&'a mut Transaction> {
    let tx = txs
        .get_mut(&tx_id)
        .ok_or_else(|| Error::not_found(format!("transaction {tx_id} not found")))?;
    if tx.state().is_terminal() {
        return Err(Error::conflict(format!(
            "transaction {tx_id} is already {:?}",
            tx.state()
        )));
    }
    Ok(tx)
}
