// src/ledger.rs
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{
    ActionStateRecord, ActionType, MonthYear, ToilProcessingRecord, ToilRecord, ToilUsage,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Ledger I/O error ({context}): {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },
    #[error("Ledger JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// Helper to create context-aware IO errors
fn io_context<E: Into<std::io::Error>, S: Into<String>>(source: E, context: S) -> StorageError {
    StorageError::Io {
        source: source.into(),
        context: context.into(),
    }
}

// --- Key Namespaces ---
//
// Every ledger document lives under a namespaced string key:
//   toil:<userId>:<YYYY-MM>                   month-end processing history
//   toilrecord:<id>                           accrual grant
//   toilusage:<id>                            usage row
//   entry:<id>                                time entry (when ledger-backed)
//   action:<userId>:<YYYY-MM-DD>:<action>     tracked synthetic entry id

pub const PROCESSING_PREFIX: &str = "toil:";
pub const TOIL_RECORD_PREFIX: &str = "toilrecord:";
pub const USAGE_PREFIX: &str = "toilusage:";
pub const ENTRY_PREFIX: &str = "entry:";
pub const ACTION_PREFIX: &str = "action:";

pub fn processing_key(user_id: &str, month: MonthYear) -> String {
    format!("{}{}:{}", PROCESSING_PREFIX, user_id, month)
}

pub fn toil_record_key(record_id: &str) -> String {
    format!("{}{}", TOIL_RECORD_PREFIX, record_id)
}

pub fn usage_key(usage_id: &str) -> String {
    format!("{}{}", USAGE_PREFIX, usage_id)
}

pub fn entry_key(entry_id: &str) -> String {
    format!("{}{}", ENTRY_PREFIX, entry_id)
}

pub fn action_state_key(user_id: &str, date: NaiveDate, action: ActionType) -> String {
    format!("{}{}:{}:{}", ACTION_PREFIX, user_id, date, action)
}

/// On-disk envelope for one ledger document. The key is stored inside the
/// file because file names are sanitized and cannot round-trip it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: Value,
}

/// Namespaced key-value store backing the whole engine. All reads are served
/// from an in-memory index; writes go to disk first (temp file then rename)
/// and only then update the index, so a failed write never leaves memory
/// ahead of the files.
pub struct LedgerStore {
    data_dir: Option<PathBuf>,
    records: Mutex<HashMap<String, Value>>,
}

impl LedgerStore {
    /// Opens (or creates) a file-backed store at `data_dir` and loads every
    /// document found there into the index.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                io_context(e, format!("Failed to create ledger directory: {:?}", dir))
            })?;
        }
        let records = Self::scan_dir(&dir)?;
        info!("Ledger opened at {:?} with {} records", dir, records.len());
        Ok(Self {
            data_dir: Some(dir),
            records: Mutex::new(records),
        })
    }

    /// Purely in-memory store for tests.
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.data_dir.is_some()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Re-reads every document from disk, replacing the in-memory index.
    /// Lets a long-running process observe writes made by another one
    /// sharing the same data directory. No-op for in-memory stores.
    pub fn reload_from_disk(&self) -> Result<usize, StorageError> {
        let Some(dir) = &self.data_dir else {
            return Ok(self.len());
        };
        let fresh = Self::scan_dir(dir)?;
        let count = fresh.len();
        let mut guard = self.records.lock().unwrap();
        *guard = fresh;
        debug!("Ledger reloaded from disk: {} records", count);
        Ok(count)
    }

    fn scan_dir(dir: &Path) -> Result<HashMap<String, Value>, StorageError> {
        let mut records = HashMap::new();
        let entries = fs::read_dir(dir)
            .map_err(|e| io_context(e, format!("Failed to read ledger directory: {:?}", dir)))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| io_context(e, format!("Failed to list ledger directory: {:?}", dir)))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json_string = fs::read_to_string(&path)
                .map_err(|e| io_context(e, format!("Failed to read ledger file: {:?}", path)))?;
            // Handle potentially corrupt files: drop them and keep loading.
            match serde_json::from_str::<StoredRecord>(&json_string) {
                Ok(stored) => {
                    records.insert(stored.key, stored.value);
                }
                Err(e) => {
                    warn!(
                        "Failed to deserialize ledger file {:?}: {}. Removing corrupt file.",
                        path, e
                    );
                    if let Err(remove_err) = fs::remove_file(&path) {
                        error!(
                            "Failed to remove corrupt ledger file {:?}: {}",
                            path, remove_err
                        );
                    }
                }
            }
        }
        Ok(records)
    }

    fn file_path_for_key(dir: &Path, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        dir.join(format!("{}.json", sanitized))
    }

    /// Writes one document to disk via a temp file and rename, so readers
    /// never observe a half-written file.
    fn persist(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let stored = StoredRecord {
            key: key.to_string(),
            value: value.clone(),
        };
        let json_string = serde_json::to_string_pretty(&stored)?;
        let path = Self::file_path_for_key(dir, key);
        let tmp_path = path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)
            .map_err(|e| io_context(e, format!("Failed to create ledger file: {:?}", tmp_path)))?;
        file.write_all(json_string.as_bytes())
            .map_err(|e| io_context(e, format!("Failed to write ledger file: {:?}", tmp_path)))?;
        fs::rename(&tmp_path, &path)
            .map_err(|e| io_context(e, format!("Failed to commit ledger file: {:?}", path)))?;
        Ok(())
    }

    fn remove_persisted(&self, key: &str) -> Result<(), StorageError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let path = Self::file_path_for_key(dir, key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| io_context(e, format!("Failed to remove ledger file: {:?}", path)))?;
        }
        Ok(())
    }

    // --- Generic Operations ---

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let guard = self.records.lock().unwrap();
        match guard.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, record: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(record)?;
        let mut guard = self.records.lock().unwrap();
        self.persist(key, &value)?;
        guard.insert(key.to_string(), value);
        Ok(())
    }

    /// Removes a document, returning whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut guard = self.records.lock().unwrap();
        self.remove_persisted(key)?;
        Ok(guard.remove(key).is_some())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().unwrap().contains_key(key)
    }

    /// Read-modify-write under the store lock. The closure sees the current
    /// document (or `T::default()` for a missing key) and its return value is
    /// handed back to the caller after the mutation has been committed.
    /// Concurrent updates to the same key are serialized here, which is what
    /// makes the month-end duplicate check race-free.
    pub fn update<T, R, F>(&self, key: &str, mutate: F) -> Result<R, StorageError>
    where
        T: Default + Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.records.lock().unwrap();
        let mut current: T = match guard.get(key) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => T::default(),
        };
        let outcome = mutate(&mut current);
        let value = serde_json::to_value(&current)?;
        self.persist(key, &value)?;
        guard.insert(key.to_string(), value);
        Ok(outcome)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let guard = self.records.lock().unwrap();
        let mut keys: Vec<String> = guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Deserializes every document under a prefix. Documents that no longer
    /// match the expected shape are skipped with a warning rather than
    /// failing the whole scan.
    pub fn load_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StorageError> {
        let guard = self.records.lock().unwrap();
        let mut out = Vec::new();
        for (key, value) in guard.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            match serde_json::from_value::<T>(value.clone()) {
                Ok(record) => out.push(record),
                Err(e) => {
                    warn!("Skipping malformed ledger record '{}': {}", key, e);
                }
            }
        }
        Ok(out)
    }

    // --- Typed Accessors ---

    /// All accrual grants for a user in a month, oldest first.
    pub fn toil_records_for(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<Vec<ToilRecord>, StorageError> {
        let mut records: Vec<ToilRecord> = self
            .load_prefix(TOIL_RECORD_PREFIX)?
            .into_iter()
            .filter(|r: &ToilRecord| r.user_id == user_id && r.month_year == month)
            .collect();
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// All usage rows for a user in a month, oldest first.
    pub fn usage_for(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<Vec<ToilUsage>, StorageError> {
        let mut usages: Vec<ToilUsage> = self
            .load_prefix(USAGE_PREFIX)?
            .into_iter()
            .filter(|u: &ToilUsage| u.user_id == user_id && u.month_year == month)
            .collect();
        usages.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(usages)
    }

    pub fn usage_rows_for_user(&self, user_id: &str) -> Result<Vec<ToilUsage>, StorageError> {
        Ok(self
            .load_prefix(USAGE_PREFIX)?
            .into_iter()
            .filter(|u: &ToilUsage| u.user_id == user_id)
            .collect())
    }

    /// Month-end processing history for one user and month. Rejected
    /// attempts stay in the list; at most one element is non-rejected.
    pub fn processing_history(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<Vec<ToilProcessingRecord>, StorageError> {
        Ok(self
            .get::<Vec<ToilProcessingRecord>>(&processing_key(user_id, month))?
            .unwrap_or_default())
    }

    /// Every processing record in the ledger, across all users and months.
    pub fn all_processing_records(&self) -> Result<Vec<ToilProcessingRecord>, StorageError> {
        let histories: Vec<Vec<ToilProcessingRecord>> = self.load_prefix(PROCESSING_PREFIX)?;
        Ok(histories.into_iter().flatten().collect())
    }

    /// Locates a processing record by id, returning the history key holding
    /// it alongside the record itself.
    pub fn find_processing_record(
        &self,
        record_id: &str,
    ) -> Result<Option<(String, ToilProcessingRecord)>, StorageError> {
        for key in self.keys_with_prefix(PROCESSING_PREFIX) {
            let history: Vec<ToilProcessingRecord> = self.get(&key)?.unwrap_or_default();
            if let Some(record) = history.into_iter().find(|r| r.id == record_id) {
                return Ok(Some((key, record)));
            }
        }
        Ok(None)
    }

    pub fn action_state(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
    ) -> Result<Option<ActionStateRecord>, StorageError> {
        self.get(&action_state_key(user_id, date, action))
    }

    pub fn put_action_state(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
        entry_id: &str,
    ) -> Result<(), StorageError> {
        self.put(
            &action_state_key(user_id, date, action),
            &ActionStateRecord {
                entry_id: entry_id.to_string(),
            },
        )
    }

    pub fn clear_action_state(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
    ) -> Result<bool, StorageError> {
        self.delete(&action_state_key(user_id, date, action))
    }
}
