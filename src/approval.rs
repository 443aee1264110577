// src/approval.rs
//
// Two-party sign-off for month-end close-outs. A record moves
// pending -> approved or pending -> rejected exactly once, never by the
// user who submitted it.

use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::EngineClock;
use crate::directory::UserDirectory;
use crate::engine::EngineError;
use crate::ledger::{toil_record_key, LedgerStore};
use crate::model::{
    new_record_id, ProcessingStatus, SurplusAction, ToilProcessingRecord, ToilRecord,
    ToilRecordStatus, HOURS_EPSILON,
};
use crate::notifier::{ChangeEvent, ChangeNotifier};

pub struct ApprovalWorkflow {
    ledger: Arc<LedgerStore>,
    directory: Arc<dyn UserDirectory>,
    notifier: ChangeNotifier,
    clock: EngineClock,
}

enum TransitionOutcome {
    Done(ToilProcessingRecord),
    NotPending,
    Missing,
}

enum SurplusOutcome {
    Done(ToilProcessingRecord),
    Locked,
    Rejected,
    Missing,
}

impl ApprovalWorkflow {
    pub fn new(
        ledger: Arc<LedgerStore>,
        directory: Arc<dyn UserDirectory>,
        notifier: ChangeNotifier,
        clock: EngineClock,
    ) -> Self {
        Self {
            ledger,
            directory,
            notifier,
            clock,
        }
    }

    /// Pure transition guard: not the submitter, and not yet decided.
    pub fn can_approve(record: &ToilProcessingRecord, acting_user_id: &str) -> bool {
        record.user_id != acting_user_id && record.approver_id.is_none()
    }

    pub async fn approve(&self, record_id: &str, approver_id: &str) -> Result<bool, EngineError> {
        self.decide(record_id, approver_id, true).await
    }

    pub async fn reject(&self, record_id: &str, approver_id: &str) -> Result<bool, EngineError> {
        self.decide(record_id, approver_id, false).await
    }

    async fn decide(
        &self,
        record_id: &str,
        approver_id: &str,
        approve: bool,
    ) -> Result<bool, EngineError> {
        let Some((history_key, record)) = self.ledger.find_processing_record(record_id)? else {
            return Err(EngineError::Validation(format!(
                "Unknown processing record '{}'",
                record_id
            )));
        };

        // Self-approval is refused before anything else, whatever state the
        // record is in.
        if record.user_id == approver_id {
            return Err(EngineError::SelfApproval);
        }
        let approver = self.directory.get_user(approver_id).await;
        if !approver.map(|p| p.role.can_decide_approvals()).unwrap_or(false) {
            return Err(EngineError::NotAuthorized);
        }

        let decided_at = self.clock.now();
        let new_status = if approve {
            ProcessingStatus::Approved
        } else {
            ProcessingStatus::Rejected
        };
        let approver_owned = approver_id.to_string();
        let record_id_owned = record_id.to_string();

        let outcome = self.ledger.update::<Vec<ToilProcessingRecord>, _, _>(
            &history_key,
            move |history| {
                let Some(target) = history.iter_mut().find(|r| r.id == record_id_owned) else {
                    return TransitionOutcome::Missing;
                };
                if target.status != ProcessingStatus::Pending || target.approver_id.is_some() {
                    return TransitionOutcome::NotPending;
                }
                target.status = new_status;
                target.approver_id = Some(approver_owned);
                target.approved_at = Some(decided_at);
                TransitionOutcome::Done(target.clone())
            },
        )?;

        let updated = match outcome {
            TransitionOutcome::Done(updated) => updated,
            TransitionOutcome::NotPending => return Err(EngineError::InvalidTransition),
            TransitionOutcome::Missing => {
                return Err(EngineError::Validation(format!(
                    "Unknown processing record '{}'",
                    record_id
                )))
            }
        };

        if approve {
            self.consume_original_grants(&updated)?;
            self.materialize_rollover(&updated)?;
        }

        info!(
            "Processing record {} for {} {} {} by {}",
            updated.id,
            updated.user_id,
            updated.month,
            if approve { "approved" } else { "rejected" },
            approver_id
        );
        self.notifier.publish(ChangeEvent::ApprovalUpdated {
            record_id: updated.id.clone(),
            user_id: updated.user_id.clone(),
            month: updated.month,
            status: updated.status,
        });
        self.notifier.publish(ChangeEvent::ToilMonthStateUpdated {
            user_id: updated.user_id.clone(),
            month: updated.month,
        });
        Ok(true)
    }

    /// Flips the grants consumed by an approved close-out to `used` so they
    /// stop counting toward the month's balance. Grants that have vanished
    /// are logged and skipped.
    fn consume_original_grants(&self, record: &ToilProcessingRecord) -> Result<(), EngineError> {
        for grant_id in &record.original_records {
            let key = toil_record_key(grant_id);
            match self.ledger.get::<ToilRecord>(&key)? {
                Some(mut grant) => {
                    if grant.status == ToilRecordStatus::Active {
                        grant.status = ToilRecordStatus::Used;
                        self.ledger.put(&key, &grant)?;
                    }
                }
                None => {
                    warn!(
                        "Grant {} referenced by processing record {} no longer exists",
                        grant_id, record.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Credits the approved rollover as a fresh grant on the first day of
    /// the following month.
    fn materialize_rollover(&self, record: &ToilProcessingRecord) -> Result<(), EngineError> {
        if record.rollover_hours <= HOURS_EPSILON {
            return Ok(());
        }
        let next_month = record.month.next();
        let grant = ToilRecord {
            id: new_record_id(),
            user_id: record.user_id.clone(),
            date: next_month.first_day(),
            hours: record.rollover_hours,
            month_year: next_month,
            entry_id: None,
            status: ToilRecordStatus::Active,
        };
        self.ledger.put(&toil_record_key(&grant.id), &grant)?;
        info!(
            "Rolled {}h of TOIL into {} for {}",
            grant.hours, next_month, record.user_id
        );
        self.notifier.publish(ChangeEvent::ToilUpdated {
            user_id: record.user_id.clone(),
            month_year: next_month,
        });
        Ok(())
    }

    /// Records what should happen to surplus hours: paid out or banked.
    /// Requires the record to carry surplus hours. Allowed while pending
    /// (and may be changed), or once on an approved record that has none
    /// set yet. The submitter or an approver role may set it.
    pub async fn set_surplus_action(
        &self,
        record_id: &str,
        acting_user_id: &str,
        action: SurplusAction,
    ) -> Result<ToilProcessingRecord, EngineError> {
        let Some((history_key, record)) = self.ledger.find_processing_record(record_id)? else {
            return Err(EngineError::Validation(format!(
                "Unknown processing record '{}'",
                record_id
            )));
        };

        if record.user_id != acting_user_id {
            let acting = self.directory.get_user(acting_user_id).await;
            if !acting.map(|p| p.role.can_decide_approvals()).unwrap_or(false) {
                return Err(EngineError::NotAuthorized);
            }
        }
        if record.surplus_hours < HOURS_EPSILON {
            return Err(EngineError::Validation(format!(
                "Record '{}' has no surplus hours to dispose of",
                record_id
            )));
        }

        let record_id_owned = record_id.to_string();
        let outcome = self.ledger.update::<Vec<ToilProcessingRecord>, _, _>(
            &history_key,
            move |history| {
                let Some(target) = history.iter_mut().find(|r| r.id == record_id_owned) else {
                    return SurplusOutcome::Missing;
                };
                match target.status {
                    ProcessingStatus::Rejected => SurplusOutcome::Rejected,
                    ProcessingStatus::Approved if target.surplus_action.is_some() => {
                        SurplusOutcome::Locked
                    }
                    _ => {
                        target.surplus_action = Some(action);
                        SurplusOutcome::Done(target.clone())
                    }
                }
            },
        )?;

        match outcome {
            SurplusOutcome::Done(updated) => {
                info!(
                    "Surplus action for record {} set to '{}' by {}",
                    updated.id, action, acting_user_id
                );
                self.notifier.publish(ChangeEvent::ToilMonthStateUpdated {
                    user_id: updated.user_id.clone(),
                    month: updated.month,
                });
                Ok(updated)
            }
            SurplusOutcome::Locked | SurplusOutcome::Rejected => {
                Err(EngineError::InvalidTransition)
            }
            SurplusOutcome::Missing => Err(EngineError::Validation(format!(
                "Unknown processing record '{}'",
                record_id
            ))),
        }
    }

    /// Pending close-outs across all users, oldest first. Only approver
    /// roles may look at the queue.
    pub async fn pending_queue(
        &self,
        acting_user_id: &str,
    ) -> Result<Vec<ToilProcessingRecord>, EngineError> {
        let acting = self.directory.get_user(acting_user_id).await;
        if !acting.map(|p| p.role.can_decide_approvals()).unwrap_or(false) {
            return Err(EngineError::NotAuthorized);
        }
        let mut pending: Vec<ToilProcessingRecord> = self
            .ledger
            .all_processing_records()?
            .into_iter()
            .filter(|r| r.status == ProcessingStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(pending)
    }
}

#[cfg(test)]
mod approval_tests {
    use super::*;
    use crate::directory::FileUserDirectory;
    use crate::ledger::processing_key;
    use crate::model::{MonthYear, Role, ToilThresholds, UserProfile};
    use crate::month_end::MonthEndProcessor;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    struct Fixture {
        ledger: Arc<LedgerStore>,
        workflow: ApprovalWorkflow,
        processor: MonthEndProcessor,
    }

    fn setup() -> Fixture {
        let ledger = Arc::new(LedgerStore::in_memory());
        let mut users = HashMap::new();
        users.insert(
            "alice".to_string(),
            UserProfile {
                fte: 1.0,
                role: Role::Manager,
            },
        );
        users.insert(
            "bob".to_string(),
            UserProfile {
                fte: 1.0,
                role: Role::TeamMember,
            },
        );
        users.insert(
            "carol".to_string(),
            UserProfile {
                fte: 1.0,
                role: Role::Admin,
            },
        );
        let directory = Arc::new(FileUserDirectory::from_users(users));
        let notifier = ChangeNotifier::new();
        let clock = EngineClock::fixed("2026-04-02 09:00:00");
        let workflow = ApprovalWorkflow::new(
            ledger.clone(),
            directory.clone(),
            notifier.clone(),
            clock.clone(),
        );
        let processor = MonthEndProcessor::new(
            ledger.clone(),
            directory,
            notifier,
            clock,
            ToilThresholds::default(),
        );
        Fixture {
            ledger,
            workflow,
            processor,
        }
    }

    fn march() -> MonthYear {
        "2026-03".parse().expect("parse month")
    }

    fn seed_grant(ledger: &LedgerStore, user_id: &str, id: &str, day: u32, hours: f64) {
        let date = NaiveDate::from_ymd_opt(2026, 3, day).expect("valid date");
        let record = ToilRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            date,
            hours,
            month_year: MonthYear::from_date(date),
            entry_id: None,
            status: ToilRecordStatus::Active,
        };
        ledger.put(&toil_record_key(id), &record).expect("seed grant");
    }

    async fn submit(fixture: &Fixture, user_id: &str) -> ToilProcessingRecord {
        fixture
            .processor
            .submit(user_id, march())
            .await
            .expect("submit")
    }

    #[tokio::test]
    async fn approve_transitions_and_consumes_grants() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 6.0);
        let record = submit(&fixture, "bob").await;

        let ok = fixture
            .workflow
            .approve(&record.id, "alice")
            .await
            .expect("approve");
        assert!(ok);

        let history = fixture
            .ledger
            .processing_history("bob", march())
            .expect("history");
        assert_eq!(history[0].status, ProcessingStatus::Approved);
        assert_eq!(history[0].approver_id.as_deref(), Some("alice"));
        assert!(history[0].approved_at.is_some());

        let grant: ToilRecord = fixture
            .ledger
            .get(&toil_record_key("r1"))
            .expect("get")
            .expect("present");
        assert_eq!(grant.status, ToilRecordStatus::Used);

        // 6h is under the full-time threshold, so all of it rolls into April.
        let april: MonthYear = "2026-04".parse().expect("parse month");
        let rolled = fixture
            .ledger
            .toil_records_for("bob", april)
            .expect("records");
        assert_eq!(rolled.len(), 1);
        assert!((rolled[0].hours - 6.0).abs() < HOURS_EPSILON);
        assert_eq!(rolled[0].date, NaiveDate::from_ymd_opt(2026, 4, 1).expect("valid date"));
        assert!(rolled[0].entry_id.is_none());
    }

    #[tokio::test]
    async fn reject_is_terminal_and_keeps_grants_active() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 6.0);
        let record = submit(&fixture, "bob").await;

        fixture
            .workflow
            .reject(&record.id, "alice")
            .await
            .expect("reject");

        let history = fixture
            .ledger
            .processing_history("bob", march())
            .expect("history");
        assert_eq!(history[0].status, ProcessingStatus::Rejected);
        assert!(history[0].approved_at.is_some());

        let grant: ToilRecord = fixture
            .ledger
            .get(&toil_record_key("r1"))
            .expect("get")
            .expect("present");
        assert_eq!(grant.status, ToilRecordStatus::Active);

        let april: MonthYear = "2026-04".parse().expect("parse month");
        assert!(fixture
            .ledger
            .toil_records_for("bob", april)
            .expect("records")
            .is_empty());
    }

    #[tokio::test]
    async fn self_approval_always_fails() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "alice", "r1", 5, 6.0);
        let record = submit(&fixture, "alice").await;

        let err = fixture
            .workflow
            .approve(&record.id, "alice")
            .await
            .expect_err("self approval");
        assert!(matches!(err, EngineError::SelfApproval));

        // Still refused once the record has been decided by someone else.
        fixture
            .workflow
            .approve(&record.id, "carol")
            .await
            .expect("approve");
        let err = fixture
            .workflow
            .approve(&record.id, "alice")
            .await
            .expect_err("self approval after decision");
        assert!(matches!(err, EngineError::SelfApproval));
    }

    #[tokio::test]
    async fn team_members_cannot_decide() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "alice", "r1", 5, 6.0);
        let record = submit(&fixture, "alice").await;

        let err = fixture
            .workflow
            .approve(&record.id, "bob")
            .await
            .expect_err("role gate");
        assert!(matches!(err, EngineError::NotAuthorized));

        let err = fixture
            .workflow
            .approve(&record.id, "nobody")
            .await
            .expect_err("unknown approver");
        assert!(matches!(err, EngineError::NotAuthorized));
    }

    #[tokio::test]
    async fn second_decision_is_an_invalid_transition() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 6.0);
        let record = submit(&fixture, "bob").await;

        fixture
            .workflow
            .approve(&record.id, "alice")
            .await
            .expect("approve");
        let err = fixture
            .workflow
            .reject(&record.id, "carol")
            .await
            .expect_err("already decided");
        assert!(matches!(err, EngineError::InvalidTransition));
    }

    #[tokio::test]
    async fn unknown_record_is_a_validation_error() {
        let fixture = setup();
        let err = fixture
            .workflow
            .approve("missing", "alice")
            .await
            .expect_err("unknown record");
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn can_approve_guard_matches_decision_rules() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 6.0);
        let record = submit(&fixture, "bob").await;

        assert!(ApprovalWorkflow::can_approve(&record, "alice"));
        assert!(!ApprovalWorkflow::can_approve(&record, "bob"));

        fixture
            .workflow
            .approve(&record.id, "alice")
            .await
            .expect("approve");
        let history = fixture
            .ledger
            .processing_history("bob", march())
            .expect("history");
        assert!(!ApprovalWorkflow::can_approve(&history[0], "carol"));
    }

    #[tokio::test]
    async fn surplus_action_set_while_pending_and_locked_after_approval() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 14.0);
        let record = submit(&fixture, "bob").await;
        assert!((record.surplus_hours - 4.0).abs() < HOURS_EPSILON);

        let updated = fixture
            .workflow
            .set_surplus_action(&record.id, "bob", SurplusAction::Paid)
            .await
            .expect("set surplus");
        assert_eq!(updated.surplus_action, Some(SurplusAction::Paid));

        // Changing their mind while still pending is fine.
        fixture
            .workflow
            .set_surplus_action(&record.id, "bob", SurplusAction::Banked)
            .await
            .expect("change surplus");

        fixture
            .workflow
            .approve(&record.id, "alice")
            .await
            .expect("approve");
        let err = fixture
            .workflow
            .set_surplus_action(&record.id, "bob", SurplusAction::Paid)
            .await
            .expect_err("locked after approval");
        assert!(matches!(err, EngineError::InvalidTransition));
    }

    #[tokio::test]
    async fn surplus_action_respects_roles() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 14.0);
        let record = submit(&fixture, "bob").await;

        let err = fixture
            .workflow
            .set_surplus_action(&record.id, "nobody", SurplusAction::Paid)
            .await
            .expect_err("stranger may not set");
        assert!(matches!(err, EngineError::NotAuthorized));

        fixture
            .workflow
            .set_surplus_action(&record.id, "alice", SurplusAction::Paid)
            .await
            .expect("manager may set");
    }

    #[tokio::test]
    async fn surplus_action_needs_surplus_hours() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 6.0);
        let record = submit(&fixture, "bob").await;
        assert!(record.surplus_hours.abs() < HOURS_EPSILON);

        let err = fixture
            .workflow
            .set_surplus_action(&record.id, "bob", SurplusAction::Banked)
            .await
            .expect_err("nothing to dispose of");
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn pending_queue_is_role_gated_and_ordered() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 6.0);
        seed_grant(&fixture.ledger, "alice", "r2", 6, 3.0);
        let first = submit(&fixture, "bob").await;
        let second = submit(&fixture, "alice").await;

        let err = fixture
            .workflow
            .pending_queue("bob")
            .await
            .expect_err("team member may not view");
        assert!(matches!(err, EngineError::NotAuthorized));

        let queue = fixture.workflow.pending_queue("alice").await.expect("queue");
        let ids: Vec<&str> = queue.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id.as_str()));
        assert!(ids.contains(&second.id.as_str()));

        fixture
            .workflow
            .approve(&first.id, "alice")
            .await
            .expect("approve");
        let queue = fixture.workflow.pending_queue("carol").await.expect("queue");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, second.id);
    }

    #[tokio::test]
    async fn concurrent_decisions_settle_to_one_winner() {
        let fixture = setup();
        seed_grant(&fixture.ledger, "bob", "r1", 5, 6.0);
        let record = submit(&fixture, "bob").await;

        let first = fixture.workflow.approve(&record.id, "alice").await;
        let second = fixture.workflow.reject(&record.id, "carol").await;
        assert!(first.is_ok());
        assert!(matches!(second, Err(EngineError::InvalidTransition)));

        let key = processing_key("bob", march());
        let history: Vec<ToilProcessingRecord> =
            fixture.ledger.get(&key).expect("get").expect("present");
        assert_eq!(history[0].status, ProcessingStatus::Approved);
    }
}
