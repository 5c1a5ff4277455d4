//! Backup registry: the id → metadata map persisted as one JSON file.
//!
//! Readers get an immutable snapshot through an atomic pointer swap. Writers
//! are serialised, build a new map, persist it with write-temp-then-rename,
//! and only then publish it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tradevault_core::error::{StorageError, StorageResult};

pub const REGISTRY_FILE: &str = "backup_registry.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
}

/// Everything recorded about one backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub backup_type: BackupType,
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Size of the uncompressed store copy.
    pub original_size: u64,
    /// Size of the file on disk (equal to `original_size` when uncompressed).
    pub compressed_size: u64,
    /// SHA-256 of the file at `backup_path`.
    pub sha256: String,
    /// SHA-256 of the uncompressed store.
    pub content_sha256: String,
    pub table_row_counts: BTreeMap<String, i64>,
    pub integrity_verified: bool,
    pub compression_ratio: f64,
    pub duration: Duration,
    pub compressed: bool,
}

impl BackupMetadata {
    pub fn file_exists(&self) -> bool {
        self.backup_path.is_file()
    }

    /// Usable as a restore source right now.
    pub fn is_recoverable(&self) -> bool {
        self.integrity_verified && self.file_exists()
    }
}

pub struct BackupRegistry {
    path: PathBuf,
    entries: ArcSwap<BTreeMap<String, BackupMetadata>>,
    write_lock: Mutex<()>,
}

impl BackupRegistry {
    /// Load the registry in `directory`, starting empty if none exists yet.
    pub fn load(directory: &Path) -> StorageResult<Self> {
        let path = directory.join(REGISTRY_FILE);
        let entries = if path.exists() {
            let raw = fs::read(&path).map_err(|e| StorageError::io("read backup registry", e))?;
            serde_json::from_slice(&raw).map_err(|e| {
                StorageError::Registry(format!("{} is not a valid registry: {e}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "Backup registry loaded");
        Ok(Self {
            path,
            entries: ArcSwap::from_pointee(entries),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<String, BackupMetadata>> {
        self.entries.load_full()
    }

    pub fn get(&self, id: &str) -> Option<BackupMetadata> {
        self.entries.load().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.load().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, metadata: BackupMetadata) -> StorageResult<()> {
        self.update(|entries| {
            entries.insert(metadata.id.clone(), metadata);
        })
    }

    pub fn remove(&self, id: &str) -> StorageResult<Option<BackupMetadata>> {
        let mut removed = None;
        self.update(|entries| removed = entries.remove(id))?;
        Ok(removed)
    }

    fn update<F>(&self, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, BackupMetadata>),
    {
        let _writer = self.write_lock.lock();
        let mut next = (*self.entries.load_full()).clone();
        f(&mut next);
        self.persist(&next)?;
        self.entries.store(Arc::new(next));
        Ok(())
    }

    fn persist(&self, entries: &BTreeMap<String, BackupMetadata>) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| StorageError::Registry(format!("serialize registry: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| StorageError::io("write backup registry", e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::io("write backup registry", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io("replace backup registry", e))
    }
}
