// src/entry_store.rs
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::debug;

use crate::ledger::{entry_key, LedgerStore, StorageError, ENTRY_PREFIX};
use crate::model::{new_record_id, TimeEntry};

/// Store of timesheet entries. In production this is the ledger-backed
/// implementation below; tests substitute doubles that fail on demand.
#[async_trait]
pub trait TimeEntryStore: Send + Sync {
    /// Persists an entry, assigning an id when the caller left it empty.
    /// Returns `None` when the store declined the entry without a hard error.
    async fn create(&self, entry: TimeEntry) -> Result<Option<String>, StorageError>;

    /// Deletes by id, returning whether the entry existed.
    async fn delete(&self, entry_id: &str) -> Result<bool, StorageError>;

    async fn get(&self, entry_id: &str) -> Result<Option<TimeEntry>, StorageError>;

    async fn query_by_user_and_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<TimeEntry>, StorageError>;

    async fn query_by_user_and_job_number(
        &self,
        user_id: &str,
        job_number: &str,
    ) -> Result<Vec<TimeEntry>, StorageError>;
}

/// Time entries kept in the same ledger as everything else, under the
/// `entry:` namespace.
pub struct LedgerEntryStore {
    ledger: Arc<LedgerStore>,
}

impl LedgerEntryStore {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl TimeEntryStore for LedgerEntryStore {
    async fn create(&self, mut entry: TimeEntry) -> Result<Option<String>, StorageError> {
        if entry.id.is_empty() {
            entry.id = new_record_id();
        }
        let id = entry.id.clone();
        self.ledger.put(&entry_key(&id), &entry)?;
        debug!(
            "Created time entry {} ({}h on {} for {})",
            id, entry.hours, entry.date, entry.user_id
        );
        Ok(Some(id))
    }

    async fn delete(&self, entry_id: &str) -> Result<bool, StorageError> {
        self.ledger.delete(&entry_key(entry_id))
    }

    async fn get(&self, entry_id: &str) -> Result<Option<TimeEntry>, StorageError> {
        self.ledger.get(&entry_key(entry_id))
    }

    async fn query_by_user_and_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<TimeEntry>, StorageError> {
        let mut entries: Vec<TimeEntry> = self
            .ledger
            .load_prefix(ENTRY_PREFIX)?
            .into_iter()
            .filter(|e: &TimeEntry| e.user_id == user_id && e.date == date)
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn query_by_user_and_job_number(
        &self,
        user_id: &str,
        job_number: &str,
    ) -> Result<Vec<TimeEntry>, StorageError> {
        let mut entries: Vec<TimeEntry> = self
            .ledger
            .load_prefix(ENTRY_PREFIX)?
            .into_iter()
            .filter(|e: &TimeEntry| e.user_id == user_id && e.job_number == job_number)
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }
}
