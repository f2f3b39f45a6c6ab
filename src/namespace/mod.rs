//! # Namespace
//!
//! The per-namespace storage-and-query engine: item table, index list, tag
//! matcher, string pool, WAL, optional storage sink and the optimization
//! state machine. A namespace is guarded by one shared/exclusive lock at
//! the database layer: selects run under shared, every mutation under
//! exclusive, so a select always observes a single snapshot.
//!
//! ## Write Path
//!
//! ```text
//! JSON item ──> split into fixed cells + CJSON body (tag matcher COW)
//!           ──> PK lookup ──> index upserts per field ──> WAL append
//!           ──> storage write ──> observer broadcast
//! ```
//!
//! Every write bumps the namespace version (query-cache invalidation) and
//! drops the optimization state back to `NotOptimized`.
//!
//! ## Recovery
//!
//! On open with storage: sys records first (index defs, tag matcher,
//! replication state; latest version wins), then the item log, then any
//! WAL records past the checkpoint. The LSN counter resumes above
//! everything recovered.

pub mod items;
pub mod optimizer;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::index::fulltext::FtMatch;
use crate::index::{strings::StringPool, CondType, Index, IndexDef};
use crate::payload::{cjson, value::decode_fixed, FieldCell, Payload, PayloadType, PayloadValue, TagsMatcher};
use crate::query::Query;
use crate::replication::UpdatesHub;
use crate::select::cache::{JoinCache, QueryCache};
use crate::select::results::NsSnapshot;
use crate::storage::Storage;
use crate::types::value::{Variant, VariantArray};
use crate::types::{IdType, IndexType, KeyValueType, Lsn};
use crate::wal::{ModifyMode, Wal, WalEntry, WalRecord};

use items::ItemTable;

const META_INDEXES: &[u8] = b"meta/indexes";
const META_TAGS: &[u8] = b"meta/tags";
const META_SCHEMA: &[u8] = b"meta/schema";
const META_REPLICATION: &[u8] = b"meta/replication";
const ITEM_PREFIX: &[u8] = b"itm/";
const WAL_PREFIX: &[u8] = b"wal/";

/// Two-phase optimization state machine. Any write stores `NotOptimized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptimizationState {
    NotOptimized = 0,
    OptimizingIndexes = 1,
    OptimizingSortOrders = 2,
    OptimizationCompleted = 3,
}

impl OptimizationState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::OptimizingIndexes,
            2 => Self::OptimizingSortOrders,
            3 => Self::OptimizationCompleted,
            _ => Self::NotOptimized,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IndexesMeta {
    version: u64,
    defs: Vec<IndexDef>,
}

#[derive(Serialize, Deserialize)]
struct SchemaMeta {
    version: u64,
    fields: Vec<(String, String, KeyValueType, bool)>,
}

#[derive(Serialize, Deserialize, Default)]
struct ReplicationMeta {
    last_lsn: Lsn,
}

#[derive(Debug)]
pub struct ItemModifyResult {
    pub id: IdType,
    pub lsn: Lsn,
}

pub struct NamespaceImpl {
    pub name: String,
    pub(crate) payload_type: Arc<PayloadType>,
    pub(crate) tags: Arc<TagsMatcher>,
    pub(crate) indexes: Vec<Index>,
    pub(crate) items: ItemTable,
    pub(crate) strings: StringPool,
    pub(crate) wal: Wal,
    pub(crate) query_cache: QueryCache,
    pub(crate) join_cache: JoinCache,
    storage: Option<Arc<dyn Storage>>,
    hub: Arc<UpdatesHub>,
    index_by_name: HashMap<String, usize>,
    /// Serial-precept counters, one per field.
    serials: HashMap<String, i64>,
    optimization: AtomicU8,
    version: AtomicU64,
    meta_version: u64,
    invalidated: bool,
}

impl NamespaceImpl {
    pub fn new(
        name: &str,
        server_id: i16,
        wal_size: usize,
        query_cache_size: usize,
        join_cache_size: usize,
        storage: Option<Arc<dyn Storage>>,
        hub: Arc<UpdatesHub>,
    ) -> Result<Self> {
        let state_token = name
            .bytes()
            .fold(0x811c_9dc5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
        let mut ns = Self {
            name: name.to_string(),
            payload_type: Arc::new(PayloadType::new()),
            tags: Arc::new(TagsMatcher::new(state_token)),
            indexes: Vec::new(),
            items: ItemTable::new(),
            strings: StringPool::new(),
            wal: Wal::new(wal_size, server_id),
            query_cache: QueryCache::new(query_cache_size),
            join_cache: JoinCache::new(join_cache_size),
            storage,
            hub,
            index_by_name: HashMap::new(),
            serials: HashMap::new(),
            optimization: AtomicU8::new(OptimizationState::NotOptimized as u8),
            version: AtomicU64::new(0),
            meta_version: 0,
        invalidated: false,
        };
        if ns.storage.is_some() {
            ns.load_from_storage()?;
        }
        Ok(ns)
    }

    // ------------------------------------------------------------------
    // Read interface used by the selector.
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> NsSnapshot {
        NsSnapshot {
            name: self.name.clone(),
            payload_type: self.payload_type.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn optimization_state(&self) -> OptimizationState {
        OptimizationState::from_u8(self.optimization.load(Ordering::Acquire))
    }

    pub(crate) fn set_optimization_state(&self, state: OptimizationState) {
        self.optimization.store(state as u8, Ordering::Release);
    }

    pub fn sort_orders_ready(&self) -> bool {
        self.optimization_state() == OptimizationState::OptimizationCompleted
    }

    /// Index position by index name or backing json path.
    pub fn index_pos_by_field(&self, field: &str) -> Option<usize> {
        if let Some(&pos) = self.index_by_name.get(field) {
            return Some(pos);
        }
        self.indexes
            .iter()
            .position(|idx| idx.def.json_paths.len() == 1 && idx.def.json_paths[0] == field)
    }

    pub fn collate_for(&self, field: &str) -> crate::types::CollateOpts {
        self.index_pos_by_field(field)
            .map(|pos| self.indexes[pos].def.opts.collate.clone())
            .unwrap_or_default()
    }

    /// All values of a field for one row: payload cell, sparse CJSON path,
    /// or column store, whichever backs the name.
    pub fn field_values(&self, id: IdType, field: &str) -> Result<VariantArray> {
        let payload = self
            .items
            .get(id)
            .ok_or_else(|| Error::logic("field read from free slot"))?;
        if let Some(pos) = self.payload_type.field_by_name(field) {
            return Ok(Payload::new(&self.payload_type, payload).field_values(pos));
        }
        if let Some(pos) = self.index_pos_by_field(field) {
            let index = &self.indexes[pos];
            if index.def.opts.sparse {
                return cjson::extract_path(payload.body(), &self.tags, &index.def.json_paths[0]);
            }
            if let Some(v) = index.store_value(id) {
                return Ok(VariantArray::from_iter([v.clone()]));
            }
        }
        // Unindexed dynamic field: read the body.
        cjson::extract_path(payload.body(), &self.tags, field)
    }

    /// Convert probe keys to the index's key domain.
    pub fn convert_keys_for(&self, pos: usize, values: &VariantArray) -> Result<VariantArray> {
        let index = &self.indexes[pos];
        if index.def.is_composite() {
            let mut out = VariantArray::new();
            for v in values {
                let Variant::Composite(members) = v else {
                    return Err(Error::params(format!(
                        "composite index '{}' requires composite keys",
                        index.name()
                    )));
                };
                if members.len() != index.fields.len() {
                    return Err(Error::params(format!(
                        "composite key arity mismatch for '{}'",
                        index.name()
                    )));
                }
                let converted = members
                    .iter()
                    .zip(&index.fields)
                    .map(|(m, &f)| {
                        let kind = self
                            .payload_type
                            .field(f)
                            .map(|pf| pf.kind)
                            .unwrap_or(KeyValueType::Null);
                        m.convert(kind)
                    })
                    .collect::<Result<Vec<_>>>()?;
                out.push(Variant::Composite(converted));
            }
            return Ok(out);
        }
        if index.def.index_type == IndexType::RTree {
            return Ok(values.clone());
        }
        values.iter().map(|v| v.convert(index.def.field_type)).collect()
    }

    pub fn ft_search(&self, pos: usize, pattern: &str, ctx: &Context) -> Result<Vec<FtMatch>> {
        let index = &self.indexes[pos];
        if let Some(ft) = index.ft_fast() {
            let dsl = crate::index::fulltext::FtDsl::parse(
                pattern,
                &ft.config().extra_word_symbols,
            )?;
            return ft.search(&dsl, ctx);
        }
        if let Some(ft) = index.ft_fuzzy() {
            let dsl = crate::index::fulltext::FtDsl::parse(pattern, "")?;
            return ft.search(&dsl, ctx);
        }
        Err(Error::logic("fulltext search on non-fulltext index"))
    }

    /// True when a select over these filters needs a full-text commit
    /// first (which requires the exclusive lock).
    pub fn needs_ft_commit(&self, query: &Query) -> bool {
        fn scan(ns: &NamespaceImpl, filters: &[crate::query::Filter]) -> bool {
            filters.iter().any(|f| match &f.node {
                crate::query::FilterNode::Cond { field, .. } => ns
                    .index_pos_by_field(field)
                    .is_some_and(|pos| ns.indexes[pos].ft_dirty()),
                crate::query::FilterNode::Bracket(inner) => scan(ns, inner),
            })
        }
        scan(self, &query.filters)
    }

    pub fn commit_ft_indexes(&mut self, ctx: &Context) -> Result<()> {
        for index in &mut self.indexes {
            // Stepped rebuilds may need several passes on large corpora.
            while index.ft_dirty() {
                index.commit(ctx)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Index management.
    // ------------------------------------------------------------------

    pub fn add_index(&mut self, def: IndexDef) -> Result<()> {
        self.check_writable()?;
        if self.index_by_name.contains_key(&def.name) {
            return Err(Error::conflict(format!(
                "index '{}' already exists in '{}'",
                def.name, self.name
            )));
        }
        self.add_index_internal(def.clone(), true)?;
        let entry = self.wal_append(WalRecord::IndexAdd { def });
        self.persist_meta()?;
        self.publish(&entry);
        self.mark_modified();
        Ok(())
    }

    /// Replace an index definition (drop + add under one lock).
    pub fn update_index(&mut self, def: IndexDef) -> Result<()> {
        self.check_writable()?;
        if !self.index_by_name.contains_key(&def.name) {
            return Err(Error::not_found(format!(
                "index '{}' not found in '{}'",
                def.name, self.name
            )));
        }
        self.drop_index_internal(&def.name)?;
        self.add_index_internal(def.clone(), true)?;
        let entry = self.wal_append(WalRecord::IndexUpdate { def });
        self.persist_meta()?;
        self.publish(&entry);
        self.mark_modified();
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        self.drop_index_internal(name)?;
        let entry = self.wal_append(WalRecord::IndexDrop {
            name: name.to_string(),
        });
        self.persist_meta()?;
        self.publish(&entry);
        self.mark_modified();
        Ok(())
    }

    fn drop_index_internal(&mut self, name: &str) -> Result<()> {
        let pos = *self
            .index_by_name
            .get(name)
            .ok_or_else(|| Error::not_found(format!("index '{name}' not found")))?;
        if self.indexes[pos].def.opts.pk {
            return Err(Error::params("cannot drop the primary key index"));
        }
        self.indexes.remove(pos);
        self.index_by_name.remove(name);
        for v in self.index_by_name.values_mut() {
            if *v > pos {
                *v -= 1;
            }
        }
        Ok(())
    }

    fn add_index_internal(&mut self, def: IndexDef, reindex: bool) -> Result<()> {
        let fields = self.resolve_index_fields(&def)?;
        let mut index = Index::new(def, fields)?;

        if reindex && self.items.live_count() > 0 {
            let ids: Vec<IdType> = self.items.iter_live().map(|(id, _)| id).collect();
            for id in ids {
                let payload = self.items.get(id).cloned().unwrap_or_default();
                let keys = self.extract_keys_for(&index, &payload)?;
                index.upsert(&keys, id, &mut self.strings)?;
            }
        }

        self.index_by_name
            .insert(index.def.name.clone(), self.indexes.len());
        self.indexes.push(index);
        Ok(())
    }

    /// Resolve payload field positions, evolving the payload type for new
    /// plain columns. Sparse indexes bind no fields.
    fn resolve_index_fields(&mut self, def: &IndexDef) -> Result<Vec<usize>> {
        if def.opts.sparse {
            if def.is_composite() {
                return Err(Error::params("composite indexes cannot be sparse"));
            }
            return Ok(Vec::new());
        }
        let mut fields = Vec::with_capacity(def.json_paths.len());
        for path in &def.json_paths {
            if let Some(pos) = self.payload_type.field_by_json_path(path) {
                fields.push(pos);
                continue;
            }
            if def.is_composite() {
                return Err(Error::params(format!(
                    "composite index '{}' references unknown field '{}'",
                    def.name, path
                )));
            }
            if path.contains('.') {
                return Err(Error::params(format!(
                    "nested path '{path}' requires a sparse index"
                )));
            }
            let ty = Arc::make_mut(&mut self.payload_type);
            let pos = ty.add_field(path, path, def.field_type, def.opts.is_array)?;
            fields.push(pos);
        }
        // New columns shift the row layout; existing rows grow lazily.
        Ok(fields)
    }

    fn extract_keys_for(&self, index: &Index, payload: &PayloadValue) -> Result<VariantArray> {
        if index.def.opts.sparse {
            let raw = cjson::extract_path(payload.body(), &self.tags, &index.def.json_paths[0])?;
            return raw
                .iter()
                .map(|v| v.convert(index.def.field_type))
                .collect();
        }
        if index.def.is_composite() {
            let p = Payload::new(&self.payload_type, payload);
            return Ok(VariantArray::from_iter([p.composite_key(&index.fields)]));
        }
        let p = Payload::new(&self.payload_type, payload);
        Ok(index
            .fields
            .first()
            .map(|&f| p.field_values(f))
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Item write path.
    // ------------------------------------------------------------------

    pub fn modify_item_json(
        &mut self,
        json: &str,
        mode: ModifyMode,
        precepts: &[String],
        in_transaction: bool,
    ) -> Result<Option<ItemModifyResult>> {
        self.check_writable()?;
        let mut doc: serde_json::Value = serde_json::from_str(json)?;
        self.apply_precepts(&mut doc, precepts)?;

        if mode == ModifyMode::Delete {
            return self.delete_by_doc(&doc, in_transaction).map(Some);
        }

        let (payload, _) = self.build_payload(&doc)?;
        let pk_pos = self.pk_index_pos()?;
        let pk_keys = self.extract_keys_for(&self.indexes[pk_pos], &payload)?;
        if pk_keys.is_empty() {
            return Err(Error::params("item lacks a primary key value"));
        }
        let existing = self.lookup_pk(&pk_keys)?;

        let id = match (existing, mode) {
            (Some(_), ModifyMode::Insert) => {
                return Err(Error::conflict(format!(
                    "duplicate primary key {} in '{}'",
                    pk_keys[0], self.name
                )))
            }
            (None, ModifyMode::Update) => return Ok(None),
            (Some(id), _) => {
                self.remove_from_indexes(id)?;
                id
            }
            (None, _) => self.items.create_item(),
        };

        let mut payload = payload;
        payload.resize_to(&self.payload_type);
        let stored = self.upsert_into_indexes(id, &payload)?;

        let entry = self.wal_append(WalRecord::ItemModify {
            id,
            mode,
            row: encode_row(&self.payload_type, &stored),
            in_transaction,
        });
        self.items.set(id, stored, entry.lsn);
        self.persist_item(id, entry.lsn)?;
        self.persist_wal_entry(&entry)?;
        self.publish(&entry);
        self.mark_modified();
        Ok(Some(ItemModifyResult { id, lsn: entry.lsn }))
    }

    fn delete_by_doc(
        &mut self,
        doc: &serde_json::Value,
        in_transaction: bool,
    ) -> Result<ItemModifyResult> {
        let (payload, _) = self.build_payload(doc)?;
        let pk_pos = self.pk_index_pos()?;
        let pk_keys = self.extract_keys_for(&self.indexes[pk_pos], &payload)?;
        let id = self
            .lookup_pk(&pk_keys)?
            .ok_or_else(|| Error::not_found(format!("item not found in '{}'", self.name)))?;
        self.do_delete(id, in_transaction)
    }

    /// Remove an item everywhere: indexes, slot, storage, WAL, observers.
    pub fn do_delete(&mut self, id: IdType, in_transaction: bool) -> Result<ItemModifyResult> {
        self.check_writable()?;
        self.remove_from_indexes(id)?;
        self.items.free_item(id);
        let entry = self.wal_append(WalRecord::ItemModify {
            id,
            mode: ModifyMode::Delete,
            row: Vec::new(),
            in_transaction,
        });
        if let Some(storage) = &self.storage {
            storage.delete(&item_key(id))?;
        }
        self.persist_wal_entry(&entry)?;
        self.publish(&entry);
        self.mark_modified();
        Ok(ItemModifyResult { id, lsn: entry.lsn })
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.check_writable()?;
        let ids: Vec<IdType> = self.items.iter_live().map(|(id, _)| id).collect();
        for id in ids {
            self.remove_from_indexes(id)?;
            self.items.free_item(id);
        }
        self.items.clear();
        self.strings.remove_expired();
        if let Some(storage) = &self.storage {
            let keys = self.collect_keys(ITEM_PREFIX)?;
            for key in keys {
                storage.delete(&key)?;
            }
        }
        self.mark_modified();
        info!(namespace = %self.name, "truncated");
        Ok(())
    }

    /// Apply an `UPDATE ... SET` query; returns affected ids.
    pub fn update_query(&mut self, query: &Query, ctx: &Context) -> Result<Vec<IdType>> {
        self.check_writable()?;
        let mut probe = query.clone();
        probe.with_cache = false;
        let found = crate::select::execute(self, &probe, ctx, &[])?;
        let snapshot = self.snapshot();
        let mut updated = Vec::with_capacity(found.rows.len());
        for row in &found.rows {
            let mut doc = render_row_json(&snapshot, &row.payload)?;
            if let serde_json::Value::Object(map) = &mut doc {
                for set in &query.update_fields {
                    map.insert(set.field.clone(), set.value.to_json());
                }
            }
            self.modify_item_json(&doc.to_string(), ModifyMode::Update, &[], false)?;
            updated.push(row.id);
        }
        Ok(updated)
    }

    /// Apply a `DELETE FROM` query; returns affected ids.
    pub fn delete_query(&mut self, query: &Query, ctx: &Context) -> Result<Vec<IdType>> {
        self.check_writable()?;
        let mut probe = query.clone();
        probe.with_cache = false;
        let found = crate::select::execute(self, &probe, ctx, &[])?;
        let ids = found.ids();
        for &id in &ids {
            self.do_delete(id, false)?;
        }
        Ok(ids)
    }

    fn remove_from_indexes(&mut self, id: IdType) -> Result<()> {
        let Some(payload) = self.items.get(id).cloned() else {
            return Ok(());
        };
        for pos in 0..self.indexes.len() {
            let keys = self.extract_keys_for(&self.indexes[pos], &payload)?;
            let index = &mut self.indexes[pos];
            index.delete(&keys, id, &mut self.strings)?;
        }
        Ok(())
    }

    fn upsert_into_indexes(&mut self, id: IdType, payload: &PayloadValue) -> Result<PayloadValue> {
        let mut stored = payload.clone();
        for pos in 0..self.indexes.len() {
            let keys = self.extract_keys_for(&self.indexes[pos], &stored)?;
            let index = &mut self.indexes[pos];
            let stored_keys = index.upsert(&keys, id, &mut self.strings)?;
            // Share interned strings with the row for plain scalar columns.
            if !index.def.opts.sparse && !index.def.is_composite() && !index.def.opts.is_array {
                if let (Some(&field), Some(key)) = (index.fields.first(), stored_keys.first()) {
                    if matches!(key, Variant::String(_)) {
                        stored.set_field(field, FieldCell::Scalar(key.clone()));
                    }
                }
            }
        }
        Ok(stored)
    }

    fn pk_index_pos(&self) -> Result<usize> {
        self.indexes
            .iter()
            .position(|idx| idx.def.opts.pk)
            .ok_or_else(|| {
                Error::params(format!("namespace '{}' has no primary key index", self.name))
            })
    }

    fn lookup_pk(&self, keys: &VariantArray) -> Result<Option<IdType>> {
        let pos = self.pk_index_pos()?;
        let converted = self.convert_keys_for(pos, keys)?;
        let result =
            self.indexes[pos].select_key(&converted, CondType::Eq, &Context::new())?;
        Ok(result.id_sets.iter().flatten().next().copied())
    }

    /// Split a JSON document into typed cells and the dynamic CJSON body,
    /// extending the tag matcher copy-on-write when new keys appear.
    fn build_payload(&mut self, doc: &serde_json::Value) -> Result<(PayloadValue, bool)> {
        let serde_json::Value::Object(map) = doc else {
            return Err(Error::parse("item must be a JSON object"));
        };

        let mut cells = vec![FieldCell::Scalar(Variant::Null); self.payload_type.num_fields()];
        let mut dynamic = serde_json::Map::new();
        for (key, value) in map {
            match self.payload_type.field_by_name(key) {
                Some(pos) => {
                    let field = &self.payload_type.fields()[pos];
                    cells[pos] = json_to_cell(value, field.kind, field.is_array)?;
                }
                None => {
                    dynamic.insert(key.clone(), value.clone());
                }
            }
        }

        let old_version = self.tags.version();
        let mut tags = (*self.tags).clone();
        let body = cjson::encode(&serde_json::Value::Object(dynamic), &mut tags)?;
        let extended = tags.version() != old_version;
        if extended {
            // Copy-on-write swap; readers keep their snapshot.
            self.tags = Arc::new(tags);
            self.persist_tags()?;
        }
        Ok((PayloadValue::new(cells, body), extended))
    }

    fn apply_precepts(&mut self, doc: &mut serde_json::Value, precepts: &[String]) -> Result<()> {
        if precepts.is_empty() {
            return Ok(());
        }
        let serde_json::Value::Object(map) = doc else {
            return Err(Error::parse("item must be a JSON object"));
        };
        for precept in precepts {
            let (field, func) = precept
                .split_once('=')
                .ok_or_else(|| Error::params(format!("bad precept '{precept}'")))?;
            let value = match func.trim() {
                "serial()" => {
                    let counter = self.serials.entry(field.to_string()).or_insert(0);
                    *counter += 1;
                    serde_json::Value::from(*counter)
                }
                "now()" => serde_json::Value::from(unix_now()),
                other => {
                    return Err(Error::params(format!("unknown precept function '{other}'")))
                }
            };
            map.insert(field.trim().to_string(), value);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Durability.
    // ------------------------------------------------------------------

    fn wal_append(&mut self, record: WalRecord) -> WalEntry {
        self.wal.add(record)
    }

    /// Frame markers for transaction commits.
    pub(crate) fn wal_tx_begin(&mut self) -> Result<()> {
        let entry = self.wal_append(WalRecord::TxBegin);
        self.persist_wal_entry(&entry)?;
        self.publish(&entry);
        Ok(())
    }

    pub(crate) fn wal_tx_commit(&mut self) -> Result<()> {
        let entry = self.wal_append(WalRecord::TxCommit);
        self.persist_wal_entry(&entry)?;
        self.publish(&entry);
        Ok(())
    }

    fn publish(&self, entry: &WalEntry) {
        self.hub.publish(&self.name, entry);
    }

    fn mark_modified(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.set_optimization_state(OptimizationState::NotOptimized);
    }

    fn check_writable(&self) -> Result<()> {
        if self.invalidated {
            return Err(Error::new(
                ErrorKind::NamespaceInvalidated,
                format!("namespace '{}' is read-only after a storage failure", self.name),
            ));
        }
        Ok(())
    }

    fn persist_item(&mut self, id: IdType, lsn: Lsn) -> Result<()> {
        let Some(storage) = self.storage.clone() else {
            return Ok(());
        };
        let payload = self
            .items
            .get(id)
            .ok_or_else(|| Error::logic("persisting a free slot"))?;
        let mut record = Vec::with_capacity(16);
        record.extend_from_slice(&lsn.0.to_le_bytes());
        record.extend_from_slice(&encode_row(&self.payload_type, payload));
        self.run_storage(|| storage.write(&item_key(id), &record))
    }

    fn persist_wal_entry(&mut self, entry: &WalEntry) -> Result<()> {
        let Some(storage) = self.storage.clone() else {
            return Ok(());
        };
        let value = serde_json::to_vec(entry)?;
        let key = wal_key(entry.lsn);
        self.run_storage(|| storage.write(&key, &value))
    }

    fn persist_tags(&mut self) -> Result<()> {
        let Some(storage) = self.storage.clone() else {
            return Ok(());
        };
        let value = serde_json::to_vec(&*self.tags)?;
        let entry = self.wal_append(WalRecord::PutMeta {
            key: "tags".to_string(),
            value: value.clone(),
        });
        self.publish(&entry);
        self.run_storage(|| storage.write(META_TAGS, &value))
    }

    fn persist_meta(&mut self) -> Result<()> {
        let Some(storage) = self.storage.clone() else {
            return Ok(());
        };
        self.meta_version += 1;
        let indexes = serde_json::to_vec(&IndexesMeta {
            version: self.meta_version,
            defs: self.indexes.iter().map(|i| i.def.clone()).collect(),
        })?;
        let schema = serde_json::to_vec(&SchemaMeta {
            version: self.meta_version,
            fields: self
                .payload_type
                .fields()
                .iter()
                .map(|f| (f.name.clone(), f.json_path.clone(), f.kind, f.is_array))
                .collect(),
        })?;
        let replication = serde_json::to_vec(&ReplicationMeta {
            last_lsn: self.wal.last_lsn(),
        })?;
        let storage = storage.clone();
        self.run_storage(move || {
            storage.write(META_INDEXES, &indexes)?;
            storage.write(META_SCHEMA, &schema)?;
            storage.write(META_REPLICATION, &replication)
        })
    }

    /// Run one storage operation; a failure invalidates the namespace.
    fn run_storage(&mut self, op: impl FnOnce() -> Result<()>) -> Result<()> {
        match op() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(namespace = %self.name, error = %e, "storage failure, marking read-only");
                self.invalidated = true;
                self.hub.close_all();
                Err(e)
            }
        }
    }

    /// Flush the storage batch and trim persisted WAL records the ring no
    /// longer covers. Called by the background task.
    pub fn flush_storage(&mut self) -> Result<()> {
        let Some(storage) = self.storage.clone() else {
            return Ok(());
        };
        let first = self.wal.first_lsn().unwrap_or_default();
        let stale: Vec<Vec<u8>> = {
            let mut out = Vec::new();
            storage.iterate_prefix(WAL_PREFIX, &mut |k, _| {
                if k < wal_key(first).as_slice() {
                    out.push(k.to_vec());
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            out
        };
        for key in stale {
            storage.delete(&key)?;
        }
        let replication = serde_json::to_vec(&ReplicationMeta {
            last_lsn: self.wal.last_lsn(),
        })?;
        self.run_storage(move || {
            storage.write(META_REPLICATION, &replication)?;
            storage.flush()
        })
    }

    fn collect_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        storage.iterate_prefix(prefix, &mut |k, _| {
            keys.push(k.to_vec());
            Ok(true)
        })?;
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // Recovery.
    // ------------------------------------------------------------------

    fn load_from_storage(&mut self) -> Result<()> {
        let Some(storage) = self.storage.clone() else {
            return Ok(());
        };

        if let Some(raw) = storage.read(META_TAGS)? {
            let mut tags: TagsMatcher = serde_json::from_slice(&raw)?;
            tags.rebuild();
            self.tags = Arc::new(tags);
        }
        if let Some(raw) = storage.read(META_INDEXES)? {
            let meta: IndexesMeta = serde_json::from_slice(&raw)?;
            self.meta_version = meta.version;
            for def in meta.defs {
                self.add_index_internal(def, false)?;
            }
        }
        let mut last_lsn = Lsn::default();
        if let Some(raw) = storage.read(META_REPLICATION)? {
            let meta: ReplicationMeta = serde_json::from_slice(&raw)?;
            last_lsn = meta.last_lsn;
        }

        // Item log: rebuild the table and all indexes.
        let mut items: Vec<(IdType, Lsn, Vec<u8>)> = Vec::new();
        storage.iterate_prefix(ITEM_PREFIX, &mut |k, v| {
            let id = parse_item_key(k)?;
            if v.len() < 8 {
                return Err(Error::parse("truncated item record"));
            }
            let lsn = Lsn(i64::from_le_bytes(v[..8].try_into().unwrap_or([0; 8])));
            items.push((id, lsn, v[8..].to_vec()));
            Ok(true)
        })?;
        let mut max_item_lsn = Lsn::default();
        for (id, lsn, row) in items {
            self.restore_item(id, lsn, &row)?;
            max_item_lsn = max_item_lsn.max(lsn);
        }

        // Replay WAL records past the item checkpoint.
        let mut wal_entries: Vec<WalEntry> = Vec::new();
        storage.iterate_prefix(WAL_PREFIX, &mut |_, v| {
            wal_entries.push(serde_json::from_slice(v)?);
            Ok(true)
        })?;
        wal_entries.sort_by_key(|e| e.lsn);
        for entry in &wal_entries {
            last_lsn = last_lsn.max(entry.lsn);
            if entry.lsn <= max_item_lsn {
                continue;
            }
            if let WalRecord::ItemModify { id, mode, row, .. } = &entry.record {
                match mode {
                    ModifyMode::Delete => {
                        if !self.items.is_free(*id) {
                            self.remove_from_indexes(*id)?;
                            self.items.free_item(*id);
                        }
                    }
                    _ => self.restore_item(*id, entry.lsn, row)?,
                }
            }
        }

        self.wal.restore_counter(last_lsn.max(max_item_lsn));
        info!(
            namespace = %self.name,
            items = self.items.live_count(),
            indexes = self.indexes.len(),
            "recovered from storage"
        );
        Ok(())
    }

    fn restore_item(&mut self, id: IdType, lsn: Lsn, row: &[u8]) -> Result<()> {
        self.items.reserve_slot(id);
        if !self.items.is_free(id) {
            self.remove_from_indexes(id)?;
        }
        let payload = decode_row(&self.payload_type, row)?;
        let stored = self.upsert_into_indexes(id, &payload)?;
        self.items.set(id, stored, lsn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection.
    // ------------------------------------------------------------------

    pub fn index_defs(&self) -> Vec<IndexDef> {
        self.indexes.iter().map(|i| i.def.clone()).collect()
    }

    pub fn mem_stats(&self) -> Vec<crate::index::IndexMemStat> {
        self.indexes.iter().map(Index::mem_stat).collect()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.payload_type
            .fields()
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn item_count(&self) -> usize {
        self.items.live_count()
    }
}

fn json_to_cell(value: &serde_json::Value, kind: KeyValueType, is_array: bool) -> Result<FieldCell> {
    if is_array {
        let serde_json::Value::Array(items) = value else {
            // A scalar in an array field indexes as a single element.
            return Ok(FieldCell::Array(vec![json_scalar(value, kind)?]));
        };
        // A bare `[x, y]` in a point array is one point, not two scalars.
        if kind == KeyValueType::Point
            && items.len() == 2
            && items.iter().all(serde_json::Value::is_number)
        {
            return Ok(FieldCell::Array(vec![json_scalar(value, kind)?]));
        }
        return Ok(FieldCell::Array(
            items
                .iter()
                .map(|v| json_scalar(v, kind))
                .collect::<Result<_>>()?,
        ));
    }
    Ok(FieldCell::Scalar(json_scalar(value, kind)?))
}

fn json_scalar(value: &serde_json::Value, kind: KeyValueType) -> Result<Variant> {
    if kind == KeyValueType::Point {
        let serde_json::Value::Array(xy) = value else {
            return Err(Error::params("point field requires [x, y]"));
        };
        let (Some(x), Some(y)) = (
            xy.first().and_then(serde_json::Value::as_f64),
            xy.get(1).and_then(serde_json::Value::as_f64),
        ) else {
            return Err(Error::params("point field requires [x, y] numbers"));
        };
        return Ok(Variant::Point { x, y });
    }
    Variant::from_json(value)?.convert(kind)
}

fn encode_row(ty: &PayloadType, payload: &PayloadValue) -> Vec<u8> {
    let fixed = Payload::new(ty, payload).encode_fixed();
    let mut out = Vec::with_capacity(4 + fixed.len() + payload.body().len());
    out.extend_from_slice(&(fixed.len() as u32).to_le_bytes());
    out.extend_from_slice(&fixed);
    out.extend_from_slice(payload.body());
    out
}

fn decode_row(ty: &PayloadType, row: &[u8]) -> Result<PayloadValue> {
    if row.len() < 4 {
        return Err(Error::parse("truncated item row"));
    }
    let fixed_len = u32::from_le_bytes(row[..4].try_into().unwrap_or([0; 4])) as usize;
    let fixed = row
        .get(4..4 + fixed_len)
        .ok_or_else(|| Error::parse("truncated item row"))?;
    let body = row[4 + fixed_len..].to_vec();
    Ok(PayloadValue::new(decode_fixed(ty, fixed)?, body))
}

fn render_row_json(snapshot: &NsSnapshot, payload: &PayloadValue) -> Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    let p = Payload::new(&snapshot.payload_type, payload);
    for (idx, field) in snapshot.payload_type.fields().iter().enumerate() {
        let values = p.field_values(idx);
        if values.is_empty() {
            continue;
        }
        let json = if field.is_array {
            serde_json::Value::Array(values.iter().map(Variant::to_json).collect())
        } else {
            values[0].to_json()
        };
        map.insert(field.name.clone(), json);
    }
    let body = cjson::decode(payload.body(), &snapshot.tags)?;
    if let serde_json::Value::Object(dynamic) = body {
        for (k, v) in dynamic {
            map.entry(k).or_insert(v);
        }
    }
    Ok(serde_json::Value::Object(map))
}

fn item_key(id: IdType) -> Vec<u8> {
    format!("itm/{id:010}").into_bytes()
}

fn parse_item_key(key: &[u8]) -> Result<IdType> {
    std::str::from_utf8(key)
        .ok()
        .and_then(|s| s.strip_prefix("itm/"))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::parse("bad item key in storage"))
}

fn wal_key(lsn: Lsn) -> Vec<u8> {
    format!("wal/{:020}", lsn.counter()).into_bytes()
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
