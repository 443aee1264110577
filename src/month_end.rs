// src/month_end.rs
use std::sync::Arc;
use tracing::info;

use crate::accrual;
use crate::clock::EngineClock;
use crate::directory::UserDirectory;
use crate::engine::EngineError;
use crate::ledger::{processing_key, LedgerStore};
use crate::model::{
    new_record_id, MonthYear, ProcessingStatus, ToilProcessingRecord, ToilRecordStatus,
    ToilThresholds, HOURS_EPSILON,
};
use crate::notifier::{ChangeEvent, ChangeNotifier};

pub struct MonthEndProcessor {
    ledger: Arc<LedgerStore>,
    directory: Arc<dyn UserDirectory>,
    notifier: ChangeNotifier,
    clock: EngineClock,
    thresholds: ToilThresholds,
}

impl MonthEndProcessor {
    pub fn new(
        ledger: Arc<LedgerStore>,
        directory: Arc<dyn UserDirectory>,
        notifier: ChangeNotifier,
        clock: EngineClock,
        thresholds: ToilThresholds,
    ) -> Self {
        Self {
            ledger,
            directory,
            notifier,
            clock,
            thresholds,
        }
    }

    /// A month can be closed out once it has fully ended, i.e. from the
    /// first day of the following month.
    pub fn is_processable(&self, month: MonthYear) -> bool {
        self.clock.today() >= month.first_day_of_following()
    }

    /// Closes out a user's month: summarizes the balance, splits it against
    /// the user's threshold and persists a pending processing record for the
    /// approval queue. A month that is not yet over may still be submitted
    /// early as long as there is a balance to process.
    pub async fn submit(
        &self,
        user_id: &str,
        month: MonthYear,
    ) -> Result<ToilProcessingRecord, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".to_string()));
        }
        let profile = self.directory.get_user(user_id).await.ok_or_else(|| {
            EngineError::Validation(format!("Unknown user '{}'", user_id))
        })?;

        if self
            .ledger
            .processing_history(user_id, month)?
            .iter()
            .any(|r| r.status != ProcessingStatus::Rejected)
        {
            return Err(EngineError::AlreadyProcessed { month });
        }

        let records = self.ledger.toil_records_for(user_id, month)?;
        let usages = self.ledger.usage_for(user_id, month)?;
        let summary = accrual::summarize(user_id, month, &records, &usages);

        if !self.is_processable(month) && summary.remaining.abs() < HOURS_EPSILON {
            return Err(EngineError::NotProcessable { month });
        }

        let threshold = accrual::threshold_for(&self.thresholds, profile.fte);
        let split = accrual::distribute(summary.remaining, threshold);
        let original_records: Vec<String> = records
            .iter()
            .filter(|r| r.status == ToilRecordStatus::Active)
            .map(|r| r.id.clone())
            .collect();

        let record = ToilProcessingRecord {
            id: new_record_id(),
            user_id: user_id.to_string(),
            month,
            total_hours: summary.remaining,
            rollover_hours: split.rollover_hours,
            surplus_hours: split.surplus_hours,
            surplus_action: None,
            status: ProcessingStatus::Pending,
            submitted_at: self.clock.now(),
            approver_id: None,
            approved_at: None,
            original_records,
        };

        // Insert under the store lock; a concurrent submit for the same
        // (user, month) loses here even if it passed the check above.
        let inserted = {
            let record = record.clone();
            self.ledger.update::<Vec<ToilProcessingRecord>, _, _>(
                &processing_key(user_id, month),
                move |history| {
                    if history.iter().any(|r| r.status != ProcessingStatus::Rejected) {
                        false
                    } else {
                        history.push(record);
                        true
                    }
                },
            )?
        };
        if !inserted {
            return Err(EngineError::AlreadyProcessed { month });
        }

        info!(
            "Month-end submitted for {} {}: {}h total, {}h rollover, {}h surplus",
            user_id, month, record.total_hours, record.rollover_hours, record.surplus_hours
        );
        self.notifier.publish(ChangeEvent::ToilMonthStateUpdated {
            user_id: user_id.to_string(),
            month,
        });
        Ok(record)
    }
}
