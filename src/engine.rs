// src/engine.rs
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::accrual;
use crate::approval::ApprovalWorkflow;
use crate::clock::EngineClock;
use crate::directory::UserDirectory;
use crate::entry_store::TimeEntryStore;
use crate::ledger::{toil_record_key, LedgerStore, StorageError};
use crate::model::{
    new_record_id, ActionType, MonthYear, SurplusAction, TimeEntry, ToggleResponse,
    ToilProcessingRecord, ToilRecord, ToilRecordStatus, ToilSummary, ToilThresholds,
    HOURS_EPSILON,
};
use crate::month_end::MonthEndProcessor;
use crate::notifier::{ChangeEvent, ChangeNotifier, Subscription, Topic};
use crate::reconciler::ActionReconciler;

/// Everything the engine can refuse or fail with. Business-rule variants
/// carry messages fit to show a user; storage problems stay generic and are
/// retried by the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("TOIL for {month} has already been processed")]
    AlreadyProcessed { month: MonthYear },
    #[error("{month} cannot be processed yet: the month has not ended and there are no remaining hours")]
    NotProcessable { month: MonthYear },
    #[error("This TOIL request has already been decided")]
    InvalidTransition,
    #[error("Cannot approve your own TOIL request")]
    SelfApproval,
    #[error("Only managers or admins may act on the approval queue")]
    NotAuthorized,
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Could not create the '{action}' entry for {date}; please try again")]
    EntryCreationFailed { action: ActionType, date: NaiveDate },
    #[error("Could not remove the '{action}' entry for {date}; please try again")]
    EntryRemovalFailed { action: ActionType, date: NaiveDate },
    #[error("Storage failure; please try again")]
    Storage(#[from] StorageError),
}

/// Facade over the TOIL components. One instance per process; every public
/// operation is safe to call from concurrent tasks.
pub struct ToilEngine {
    ledger: Arc<LedgerStore>,
    entries: Arc<dyn TimeEntryStore>,
    directory: Arc<dyn UserDirectory>,
    notifier: ChangeNotifier,
    clock: EngineClock,
    reconciler: ActionReconciler,
    month_end: MonthEndProcessor,
    approvals: ApprovalWorkflow,
}

impl ToilEngine {
    pub fn new(
        ledger: Arc<LedgerStore>,
        entries: Arc<dyn TimeEntryStore>,
        directory: Arc<dyn UserDirectory>,
        thresholds: ToilThresholds,
        clock: EngineClock,
    ) -> Self {
        let notifier = ChangeNotifier::new();
        let reconciler = ActionReconciler::new(
            ledger.clone(),
            entries.clone(),
            directory.clone(),
            notifier.clone(),
            clock.clone(),
        );
        let month_end = MonthEndProcessor::new(
            ledger.clone(),
            directory.clone(),
            notifier.clone(),
            clock.clone(),
            thresholds,
        );
        let approvals = ApprovalWorkflow::new(
            ledger.clone(),
            directory.clone(),
            notifier.clone(),
            clock.clone(),
        );
        Self {
            ledger,
            entries,
            directory,
            notifier,
            clock,
            reconciler,
            month_end,
            approvals,
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.notifier.subscribe(topic)
    }

    pub fn record_count(&self) -> usize {
        self.ledger.len()
    }

    pub async fn user_ids(&self) -> Vec<String> {
        self.directory.user_ids().await
    }

    // --- Summaries ---

    pub async fn toil_summary(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<ToilSummary, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".to_string()));
        }
        let records = self.ledger.toil_records_for(user_id, month)?;
        let usages = self.ledger.usage_for(user_id, month)?;
        Ok(accrual::summarize(user_id, month, &records, &usages))
    }

    pub async fn toil_records(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<Vec<ToilRecord>, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".to_string()));
        }
        Ok(self.ledger.toil_records_for(user_id, month)?)
    }

    pub fn processing_history(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<Vec<ToilProcessingRecord>, EngineError> {
        Ok(self.ledger.processing_history(user_id, month)?)
    }

    // --- Day Actions ---

    pub async fn toggle_action(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
        desired: bool,
    ) -> Result<ToggleResponse, EngineError> {
        self.reconciler.toggle(user_id, date, action, desired).await
    }

    pub async fn cleanup_duplicate_synthetic_entries(
        &self,
        user_id: &str,
    ) -> Result<usize, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".to_string()));
        }
        self.reconciler.cleanup_duplicates(user_id).await
    }

    // --- Accrual ---

    /// Recomputes the TOIL accrued by one user's day: hours worked beyond
    /// the schedule become (or update) a single day grant, and a day that no
    /// longer runs over clears it. Rollover grants are left alone. Returns
    /// the grant now standing for the day, if any.
    pub async fn accrue_day(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<ToilRecord>, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".to_string()));
        }
        let entries = self.entries.query_by_user_and_date(user_id, date).await?;
        let worked = accrual::worked_hours_for_day(&entries);
        let profile = self.directory.get_user(user_id).await;
        let scheduled = accrual::scheduled_hours_for(profile.as_ref());
        let excess = accrual::excess_hours(worked, scheduled);
        let month = MonthYear::from_date(date);

        // Day grants carry a source entry id; rollover grants do not and are
        // never touched here.
        let existing: Vec<ToilRecord> = self
            .ledger
            .toil_records_for(user_id, month)?
            .into_iter()
            .filter(|r| {
                r.date == date && r.status == ToilRecordStatus::Active && r.entry_id.is_some()
            })
            .collect();

        if excess <= 0.0 {
            let mut removed = false;
            for grant in &existing {
                self.ledger.delete(&toil_record_key(&grant.id))?;
                removed = true;
            }
            if removed {
                info!(
                    "Cleared day accrual for {} on {} (worked {:.2}h of {:.2}h)",
                    user_id, date, worked, scheduled
                );
                self.notifier.publish(ChangeEvent::ToilUpdated {
                    user_id: user_id.to_string(),
                    month_year: month,
                });
            }
            return Ok(None);
        }

        if existing.len() == 1 && (existing[0].hours - excess).abs() < HOURS_EPSILON {
            return Ok(Some(existing[0].clone()));
        }
        for grant in &existing {
            self.ledger.delete(&toil_record_key(&grant.id))?;
        }

        let source_entry_id = worked_source_entry(&entries).map(|e| e.id.clone());
        let grant = ToilRecord {
            id: new_record_id(),
            user_id: user_id.to_string(),
            date,
            hours: excess,
            month_year: month,
            entry_id: source_entry_id,
            status: ToilRecordStatus::Active,
        };
        self.ledger.put(&toil_record_key(&grant.id), &grant)?;
        info!(
            "Accrued {:.2}h TOIL for {} on {} (worked {:.2}h, scheduled {:.2}h)",
            excess, user_id, date, worked, scheduled
        );
        self.notifier.publish(ChangeEvent::ToilUpdated {
            user_id: user_id.to_string(),
            month_year: month,
        });
        Ok(Some(grant))
    }

    // --- Month End & Approvals ---

    pub fn is_month_processable(&self, month: MonthYear) -> bool {
        self.month_end.is_processable(month)
    }

    pub async fn submit_month_end(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<ToilProcessingRecord, EngineError> {
        self.month_end.submit(user_id, month).await
    }

    pub async fn approve_toil(
        &self,
        record_id: &str,
        approver_id: &str,
    ) -> Result<bool, EngineError> {
        self.approvals.approve(record_id, approver_id).await
    }

    pub async fn reject_toil(
        &self,
        record_id: &str,
        approver_id: &str,
    ) -> Result<bool, EngineError> {
        self.approvals.reject(record_id, approver_id).await
    }

    pub async fn set_surplus_action(
        &self,
        record_id: &str,
        acting_user_id: &str,
        action: SurplusAction,
    ) -> Result<ToilProcessingRecord, EngineError> {
        self.approvals
            .set_surplus_action(record_id, acting_user_id, action)
            .await
    }

    pub async fn pending_approvals(
        &self,
        acting_user_id: &str,
    ) -> Result<Vec<ToilProcessingRecord>, EngineError> {
        self.approvals.pending_queue(acting_user_id).await
    }
}

/// The entry that completed the day's overtime: the latest-created one that
/// counts as worked time.
fn worked_source_entry(entries: &[TimeEntry]) -> Option<&TimeEntry> {
    entries
        .iter()
        .filter(|e| {
            if !e.synthetic {
                return true;
            }
            ActionType::from_job_number(&e.job_number)
                .map(|a| !a.is_absence())
                .unwrap_or(true)
        })
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
}

#[cfg(test)]
mod accrue_day_tests {
    use super::*;
    use crate::directory::FileUserDirectory;
    use crate::entry_store::{LedgerEntryStore, TimeEntryStore};
    use crate::model::{Role, UserProfile};
    use chrono::Utc;
    use std::collections::HashMap;

    fn setup() -> (ToilEngine, Arc<LedgerStore>, Arc<LedgerEntryStore>) {
        let ledger = Arc::new(LedgerStore::in_memory());
        let entries = Arc::new(LedgerEntryStore::new(ledger.clone()));
        let mut users = HashMap::new();
        users.insert(
            "u1".to_string(),
            UserProfile {
                fte: 1.0,
                role: Role::TeamMember,
            },
        );
        let directory = Arc::new(FileUserDirectory::from_users(users));
        let engine = ToilEngine::new(
            ledger.clone(),
            entries.clone(),
            directory,
            ToilThresholds::default(),
            EngineClock::fixed("2026-03-14 18:00:00"),
        );
        (engine, ledger, entries)
    }

    async fn add_entry(
        entries: &LedgerEntryStore,
        user_id: &str,
        date: NaiveDate,
        hours: f64,
        job_number: &str,
        synthetic: bool,
    ) -> String {
        entries
            .create(TimeEntry {
                id: String::new(),
                user_id: user_id.to_string(),
                date,
                hours,
                job_number: job_number.to_string(),
                synthetic,
                description: String::new(),
                created_at: Utc::now(),
            })
            .await
            .expect("create entry")
            .expect("id assigned")
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date")
    }

    #[tokio::test]
    async fn overtime_creates_a_day_grant() {
        let (engine, _, entries) = setup();
        add_entry(&entries, "u1", date(), 7.6, "J1042", false).await;
        let source = add_entry(&entries, "u1", date(), 2.0, "J2000", false).await;

        let grant = engine
            .accrue_day("u1", date())
            .await
            .expect("accrue")
            .expect("grant created");
        assert!((grant.hours - 2.0).abs() < HOURS_EPSILON);
        assert_eq!(grant.entry_id.as_deref(), Some(source.as_str()));
        assert_eq!(grant.status, ToilRecordStatus::Active);

        let month: MonthYear = "2026-03".parse().expect("parse month");
        let summary = engine.toil_summary("u1", month).await.expect("summary");
        assert!((summary.accrued - 2.0).abs() < HOURS_EPSILON);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let (engine, _, entries) = setup();
        add_entry(&entries, "u1", date(), 9.6, "J1042", false).await;

        let first = engine
            .accrue_day("u1", date())
            .await
            .expect("accrue")
            .expect("grant");
        let second = engine
            .accrue_day("u1", date())
            .await
            .expect("accrue")
            .expect("grant");
        assert_eq!(first.id, second.id);

        let month: MonthYear = "2026-03".parse().expect("parse month");
        let records = engine.toil_records("u1", month).await.expect("records");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn changed_hours_replace_the_grant() {
        let (engine, _, entries) = setup();
        add_entry(&entries, "u1", date(), 9.6, "J1042", false).await;
        let first = engine
            .accrue_day("u1", date())
            .await
            .expect("accrue")
            .expect("grant");
        assert!((first.hours - 2.0).abs() < HOURS_EPSILON);

        add_entry(&entries, "u1", date(), 1.0, "J2000", false).await;
        let second = engine
            .accrue_day("u1", date())
            .await
            .expect("accrue")
            .expect("grant");
        assert_ne!(first.id, second.id);
        assert!((second.hours - 3.0).abs() < HOURS_EPSILON);

        let month: MonthYear = "2026-03".parse().expect("parse month");
        let records = engine.toil_records("u1", month).await.expect("records");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn day_back_under_schedule_clears_the_grant() {
        let (engine, _, entries) = setup();
        let entry_id = add_entry(&entries, "u1", date(), 9.6, "J1042", false).await;
        engine
            .accrue_day("u1", date())
            .await
            .expect("accrue")
            .expect("grant");

        entries.delete(&entry_id).await.expect("delete entry");
        add_entry(&entries, "u1", date(), 7.0, "J1042", false).await;
        let cleared = engine.accrue_day("u1", date()).await.expect("accrue");
        assert!(cleared.is_none());

        let month: MonthYear = "2026-03".parse().expect("parse month");
        assert!(engine
            .toil_records("u1", month)
            .await
            .expect("records")
            .is_empty());
    }

    #[tokio::test]
    async fn synthetic_absences_do_not_count_as_worked_time() {
        let (engine, _, entries) = setup();
        add_entry(&entries, "u1", date(), 7.6, "SICK", true).await;
        add_entry(&entries, "u1", date(), 2.0, "J1042", false).await;

        let grant = engine.accrue_day("u1", date()).await.expect("accrue");
        assert!(grant.is_none(), "2h worked is under the 7.6h schedule");
    }

    #[tokio::test]
    async fn working_through_breaks_counts() {
        let (engine, _, entries) = setup();
        add_entry(&entries, "u1", date(), 7.6, "J1042", false).await;
        add_entry(&entries, "u1", date(), 0.5, "LUNCH", true).await;
        add_entry(&entries, "u1", date(), 0.25, "SMOKO", true).await;

        let grant = engine
            .accrue_day("u1", date())
            .await
            .expect("accrue")
            .expect("grant");
        assert!((grant.hours - 0.75).abs() < HOURS_EPSILON);
    }

    #[tokio::test]
    async fn rollover_grants_are_not_clobbered() {
        let (engine, ledger, entries) = setup();
        let first_of_march = NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date");
        let rollover = ToilRecord {
            id: "rollover-1".to_string(),
            user_id: "u1".to_string(),
            date: first_of_march,
            hours: 4.0,
            month_year: "2026-03".parse().expect("parse month"),
            entry_id: None,
            status: ToilRecordStatus::Active,
        };
        ledger
            .put(&toil_record_key(&rollover.id), &rollover)
            .expect("seed rollover");

        add_entry(&entries, "u1", first_of_march, 9.6, "J1042", false).await;
        engine
            .accrue_day("u1", first_of_march)
            .await
            .expect("accrue")
            .expect("day grant");

        let month: MonthYear = "2026-03".parse().expect("parse month");
        let records = engine.toil_records("u1", month).await.expect("records");
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.id == "rollover-1"));

        // Worked hours drop back to schedule: day grant goes, rollover stays.
        let worked: Vec<String> = entries
            .query_by_user_and_date("u1", first_of_march)
            .await
            .expect("query")
            .into_iter()
            .map(|e| e.id)
            .collect();
        for id in worked {
            entries.delete(&id).await.expect("delete");
        }
        engine
            .accrue_day("u1", first_of_march)
            .await
            .expect("accrue");
        let records = engine.toil_records("u1", month).await.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "rollover-1");
    }

    #[tokio::test]
    async fn unknown_user_falls_back_to_standard_day() {
        let (engine, _, entries) = setup();
        add_entry(&entries, "stranger", date(), 8.6, "J1042", false).await;

        let grant = engine
            .accrue_day("stranger", date())
            .await
            .expect("accrue")
            .expect("grant");
        assert!((grant.hours - 1.0).abs() < HOURS_EPSILON);
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let (engine, _, _) = setup();
        let err = engine
            .accrue_day("  ", date())
            .await
            .expect_err("validation");
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
