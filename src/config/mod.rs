//! # Engine Configuration
//!
//! Process-wide and per-subsystem knobs, loaded once at startup and passed
//! down by value. Nothing here is read from environment variables; the
//! embedding process decides where configuration comes from.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Root directory for namespace storage. `None` keeps every namespace
    /// purely in memory.
    pub storage_path: Option<PathBuf>,
    /// Server id embedded into the high bits of every LSN.
    pub server_id: i16,
    /// Wake-up period of the background task (optimizer, TTL sweep,
    /// transaction sweeper, storage flush).
    #[serde(with = "duration_ms")]
    pub bg_interval: Duration,
    /// Idle deadline for client-scoped transactions.
    #[serde(with = "duration_ms")]
    pub tx_idle_timeout: Duration,
    /// Capacity of the in-memory WAL ring, in records.
    pub wal_size: usize,
    /// Entries kept in the per-namespace query cache.
    pub query_cache_size: usize,
    /// Entries kept in the per-namespace join cache.
    pub join_cache_size: usize,
    /// Per-subscriber replication buffer length; oldest records are dropped
    /// (with a resync marker) once it overflows.
    pub updates_buffer_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            server_id: 0,
            bg_interval: Duration::from_millis(100),
            tx_idle_timeout: Duration::from_secs(600),
            wal_size: 100_000,
            query_cache_size: 1024,
            join_cache_size: 4096,
            updates_buffer_size: 1024,
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_storage(path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// Tuning of the fast (inverted) full-text index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtFastConfig {
    pub bm25_k1: f64,
    pub bm25_b: f64,
    pub bm25_weight: f64,
    pub term_len_weight: f64,
    pub position_weight: f64,
    pub distance_weight: f64,
    pub full_match_boost: f64,
    /// Relevancy step of a prefix/partial match:
    /// `relevancy = 100 - partial_match_decrease * unmatched / matched`.
    pub partial_match_decrease: i32,
    pub min_relevancy: f64,
    pub max_typos_in_word: i32,
    pub max_typo_len: i32,
    pub max_rebuild_steps: i32,
    pub max_step_size: i32,
    /// Symbols treated as word characters in addition to alphanumerics.
    pub extra_word_symbols: String,
}

impl Default for FtFastConfig {
    fn default() -> Self {
        Self {
            bm25_k1: 2.0,
            bm25_b: 0.75,
            bm25_weight: 0.1,
            term_len_weight: 0.3,
            position_weight: 0.1,
            distance_weight: 0.5,
            full_match_boost: 1.1,
            partial_match_decrease: 15,
            min_relevancy: 0.05,
            max_typos_in_word: 1,
            max_typo_len: 15,
            max_rebuild_steps: 50,
            max_step_size: 4000,
            extra_word_symbols: "-/+".to_string(),
        }
    }
}

/// Tuning of the fuzzy (trigram) full-text index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtFuzzyConfig {
    /// Matches scoring below this percentage of the best match are dropped.
    pub min_ok_proc: f64,
}

impl Default for FtFuzzyConfig {
    fn default() -> Self {
        Self { min_ok_proc: 10.0 }
    }
}

mod duration_ms {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
