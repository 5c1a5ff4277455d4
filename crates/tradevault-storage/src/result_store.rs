//! Durable key/value result cache stored in the `result_cache` table.
//!
//! Entries are keyed by the SHA-256 of the caller's key so arbitrary strings
//! (OCR text, screen regions) make safe primary keys.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use tradevault_core::error::{StorageError, StorageResult};

use crate::executor::QueryExecutor;
use crate::sql;

pub struct ResultStore {
    executor: Arc<QueryExecutor>,
}

impl ResultStore {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }

    pub fn cache_result(&self, key: &str, value: &serde_json::Value) -> StorageResult<()> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| StorageError::InvalidInput(format!("unserialisable value: {e}")))?;
        let hash = sql::sha256_hex(key.as_bytes());
        let now = sql::timestamp(Utc::now());

        self.executor.transaction("cache_result", |tx| {
            tx.execute(
                "INSERT INTO result_cache (content_hash, cache_key, value, hit_count, created_at, last_accessed)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)
                 ON CONFLICT(content_hash) DO UPDATE SET
                     value = excluded.value,
                     last_accessed = excluded.last_accessed",
                params![hash, key, encoded, now],
            )?;
            Ok(())
        })
    }

    /// Stored value for `key`. A hit bumps the entry's hit count and access time.
    pub fn get_cached_result(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        let hash = sql::sha256_hex(key.as_bytes());
        let now = sql::timestamp(Utc::now());

        let stored: Option<String> = self.executor.transaction("get_cached_result", |tx| {
            let value = tx
                .query_row(
                    "SELECT value FROM result_cache WHERE content_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?;
            if value.is_some() {
                tx.execute(
                    "UPDATE result_cache SET hit_count = hit_count + 1, last_accessed = ?2
                     WHERE content_hash = ?1",
                    params![hash, now],
                )?;
            }
            Ok(value)
        })?;

        stored
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| StorageError::database("decode cached result", e))
            })
            .transpose()
    }

    pub fn hit_count(&self, key: &str) -> StorageResult<Option<i64>> {
        let hash = sql::sha256_hex(key.as_bytes());
        self.executor.read("result_cache_hits", |conn| {
            conn.query_row(
                "SELECT hit_count FROM result_cache WHERE content_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Remove entries not read or written within `age`. Returns how many.
    pub fn purge_older_than(&self, age: Duration) -> StorageResult<usize> {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| StorageError::InvalidInput(format!("purge age {age:?} is out of range")))?;
        let cutoff = sql::timestamp(cutoff);

        let removed = self.executor.transaction("purge_result_cache", |tx| {
            tx.execute(
                "DELETE FROM result_cache WHERE last_accessed < ?1",
                params![cutoff],
            )
        })?;
        if removed > 0 {
            tracing::debug!(removed, "Purged stale cached results");
        }
        Ok(removed)
    }
}
