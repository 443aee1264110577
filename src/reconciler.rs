// src/reconciler.rs
//
// State machine per (userId, date, actionType): off means no synthetic entry
// exists for the key, on means exactly one exists and its id is tracked in
// the ledger. Toggles from concurrent sessions can still race at the store
// level; the duplicate-cleanup sweep restores the at-most-one invariant.

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::accrual;
use crate::clock::EngineClock;
use crate::directory::UserDirectory;
use crate::engine::EngineError;
use crate::entry_store::TimeEntryStore;
use crate::ledger::{usage_key, LedgerStore, ACTION_PREFIX};
use crate::model::{
    new_record_id, ActionType, MonthYear, TimeEntry, ToggleResponse, ToilUsage,
    EXCLUSIVE_DAY_ACTIONS, JOB_TOIL, SYNTHETIC_JOB_NUMBERS,
};
use crate::notifier::{ChangeEvent, ChangeNotifier};

/// Rapid repeated toggles on one key inside this window collapse into the
/// first one; later calls are dropped, not queued.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

const GUARD_PRUNE_LEN: usize = 1024;

type ActionKey = (String, NaiveDate, ActionType);

enum InFlight {
    Running,
    SettledAt(Instant),
}

pub struct ActionReconciler {
    ledger: Arc<LedgerStore>,
    entries: Arc<dyn TimeEntryStore>,
    directory: Arc<dyn UserDirectory>,
    notifier: ChangeNotifier,
    clock: EngineClock,
    in_flight: Mutex<HashMap<ActionKey, InFlight>>,
}

impl ActionReconciler {
    pub fn new(
        ledger: Arc<LedgerStore>,
        entries: Arc<dyn TimeEntryStore>,
        directory: Arc<dyn UserDirectory>,
        notifier: ChangeNotifier,
        clock: EngineClock,
    ) -> Self {
        Self {
            ledger,
            entries,
            directory,
            notifier,
            clock,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Drives the key's state machine toward `desired`. Returns
    /// `success=false` without touching anything when the key is still in
    /// flight or inside the debounce window.
    pub async fn toggle(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
        desired: bool,
    ) -> Result<ToggleResponse, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".to_string()));
        }
        let key: ActionKey = (user_id.to_string(), date, action);
        if !self.try_begin(&key) {
            debug!(
                "Dropping toggle for {}:{}:{} (in flight or debounced)",
                user_id, date, action
            );
            let tracked = self.ledger.action_state(user_id, date, action)?;
            return Ok(ToggleResponse {
                success: false,
                entry_id: tracked.map(|t| t.entry_id),
            });
        }

        let result = if desired {
            self.activate(user_id, date, action).await
        } else {
            self.deactivate(user_id, date, action, true).await
        };
        self.finish(&key);
        result
    }

    fn try_begin(&self, key: &ActionKey) -> bool {
        let mut guard = self.in_flight.lock().unwrap();
        match guard.get(key) {
            Some(InFlight::Running) => return false,
            Some(InFlight::SettledAt(settled)) if settled.elapsed() < DEBOUNCE_WINDOW => {
                return false;
            }
            _ => {}
        }
        if guard.len() > GUARD_PRUNE_LEN {
            guard.retain(|_, state| match state {
                InFlight::Running => true,
                InFlight::SettledAt(settled) => settled.elapsed() < DEBOUNCE_WINDOW,
            });
        }
        guard.insert(key.clone(), InFlight::Running);
        true
    }

    fn finish(&self, key: &ActionKey) {
        let mut guard = self.in_flight.lock().unwrap();
        guard.insert(key.clone(), InFlight::SettledAt(Instant::now()));
    }

    async fn activate(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
    ) -> Result<ToggleResponse, EngineError> {
        // Whole-day actions exclude each other: turning one on turns the
        // others off through the same state machine.
        if action.is_exclusive() {
            for other in EXCLUSIVE_DAY_ACTIONS {
                if other == action {
                    continue;
                }
                let other_active = self.ledger.action_state(user_id, date, other)?.is_some()
                    || !self.synthetic_entries_for(user_id, date, other).await?.is_empty();
                if other_active {
                    info!(
                        "Turning '{}' off for {} on {} before activating '{}'",
                        other, user_id, date, action
                    );
                    self.deactivate(user_id, date, other, false).await?;
                }
            }
        }

        // Scan for an existing entry rather than trusting the tracked id;
        // another session may have created one already.
        let existing = self.synthetic_entries_for(user_id, date, action).await?;
        if let Some(keeper) = existing.into_iter().min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        }) {
            debug!(
                "Adopting existing synthetic entry {} for {}:{}:{}",
                keeper.id, user_id, date, action
            );
            self.ledger
                .put_action_state(user_id, date, action, &keeper.id)?;
            if action == ActionType::Toil {
                self.ensure_usage_row(user_id, date, &keeper)?;
            }
            self.publish_toggled(user_id, date, action, true);
            return Ok(ToggleResponse {
                success: true,
                entry_id: Some(keeper.id),
            });
        }

        let profile = self.directory.get_user(user_id).await;
        let scheduled = accrual::scheduled_hours_for(profile.as_ref());
        let hours = accrual::hours_to_record(action, scheduled);
        let entry = TimeEntry {
            id: String::new(),
            user_id: user_id.to_string(),
            date,
            hours,
            job_number: action.job_number().to_string(),
            synthetic: true,
            description: action.entry_description(),
            created_at: self.clock.now(),
        };

        match self.entries.create(entry).await {
            Ok(Some(entry_id)) => {
                self.ledger
                    .put_action_state(user_id, date, action, &entry_id)?;
                if action == ActionType::Toil {
                    let usage = ToilUsage {
                        id: new_record_id(),
                        user_id: user_id.to_string(),
                        date,
                        hours,
                        entry_id: entry_id.clone(),
                        month_year: MonthYear::from_date(date),
                    };
                    self.ledger.put(&usage_key(&usage.id), &usage)?;
                }
                info!(
                    "Activated '{}' for {} on {} (entry {}, {}h)",
                    action, user_id, date, entry_id, hours
                );
                self.publish_toggled(user_id, date, action, true);
                Ok(ToggleResponse {
                    success: true,
                    entry_id: Some(entry_id),
                })
            }
            Ok(None) => {
                warn!(
                    "Store declined to create '{}' entry for {} on {}",
                    action, user_id, date
                );
                Err(EngineError::EntryCreationFailed { action, date })
            }
            Err(e) => {
                error!(
                    "Failed to create '{}' entry for {} on {}: {}",
                    action, user_id, date, e
                );
                Err(EngineError::EntryCreationFailed { action, date })
            }
        }
    }

    /// Turns a key off. With `explicit` set the toggled event is emitted even
    /// when nothing had to be removed, so views converge on the off state.
    async fn deactivate(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
        explicit: bool,
    ) -> Result<ToggleResponse, EngineError> {
        let tracked = self.ledger.action_state(user_id, date, action)?;
        let mut removed_any = false;

        match tracked {
            Some(state) => match self.entries.delete(&state.entry_id).await {
                Ok(existed) => {
                    if !existed {
                        debug!(
                            "Tracked entry {} for {}:{}:{} was already gone",
                            state.entry_id, user_id, date, action
                        );
                    }
                    if action == ActionType::Toil {
                        self.remove_usage_rows_for_entry(user_id, &state.entry_id)?;
                    }
                    self.ledger.clear_action_state(user_id, date, action)?;
                    removed_any = existed;
                }
                Err(e) => {
                    // Leave the tracked id in place: the entry still exists,
                    // and the caller reverts to the on state.
                    error!(
                        "Failed to delete entry {} for {}:{}:{}: {}",
                        state.entry_id, user_id, date, action, e
                    );
                    return Err(EngineError::EntryRemovalFailed { action, date });
                }
            },
            None => {
                // Nothing tracked; remove strays created by other sessions.
                for stray in self.synthetic_entries_for(user_id, date, action).await? {
                    match self.entries.delete(&stray.id).await {
                        Ok(existed) => {
                            if action == ActionType::Toil {
                                self.remove_usage_rows_for_entry(user_id, &stray.id)?;
                            }
                            removed_any |= existed;
                        }
                        Err(e) => {
                            error!(
                                "Failed to delete stray entry {} for {}:{}:{}: {}",
                                stray.id, user_id, date, action, e
                            );
                            return Err(EngineError::EntryRemovalFailed { action, date });
                        }
                    }
                }
            }
        }

        if removed_any {
            info!("Deactivated '{}' for {} on {}", action, user_id, date);
        }
        if removed_any || explicit {
            self.publish_toggled(user_id, date, action, false);
        }
        Ok(ToggleResponse {
            success: true,
            entry_id: None,
        })
    }

    /// Removes all but the earliest-created synthetic entry per (date, job)
    /// for one user, repairs tracked ids and usage rows, and returns how many
    /// duplicate entries were deleted. Safe to run at any time; this is the
    /// backstop for races between sessions that per-process serialization
    /// cannot see.
    pub async fn cleanup_duplicates(&self, user_id: &str) -> Result<usize, EngineError> {
        if self.ledger.is_persistent() {
            self.ledger.reload_from_disk()?;
        }

        let mut removed = 0usize;
        let mut toil_months_touched: HashSet<MonthYear> = HashSet::new();

        for job_number in SYNTHETIC_JOB_NUMBERS {
            let Some(action) = ActionType::from_job_number(job_number) else {
                continue;
            };
            let mut entries = self
                .entries
                .query_by_user_and_job_number(user_id, job_number)
                .await?;
            entries.retain(|e| e.synthetic);

            let mut by_date: HashMap<NaiveDate, Vec<TimeEntry>> = HashMap::new();
            for entry in entries {
                by_date.entry(entry.date).or_default().push(entry);
            }

            for (date, mut group) in by_date {
                group.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
                let keeper = group.remove(0);

                for duplicate in group {
                    match self.entries.delete(&duplicate.id).await {
                        Ok(true) => {
                            removed += 1;
                            info!(
                                "Removed duplicate synthetic entry {} ({} on {} for {})",
                                duplicate.id, job_number, date, user_id
                            );
                            if action == ActionType::Toil {
                                self.remove_usage_rows_for_entry(user_id, &duplicate.id)?;
                                toil_months_touched.insert(MonthYear::from_date(date));
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            // Keep sweeping; the next pass retries this one.
                            error!(
                                "Failed to remove duplicate entry {} for {}: {}",
                                duplicate.id, user_id, e
                            );
                        }
                    }
                }

                let tracked = self.ledger.action_state(user_id, date, action)?;
                let needs_repoint = tracked.map(|t| t.entry_id != keeper.id).unwrap_or(true);
                if needs_repoint {
                    debug!(
                        "Repointing tracked id for {}:{}:{} at surviving entry {}",
                        user_id, date, action, keeper.id
                    );
                    self.ledger
                        .put_action_state(user_id, date, action, &keeper.id)?;
                }
                if action == ActionType::Toil {
                    self.ensure_usage_row(user_id, date, &keeper)?;
                }
            }
        }

        // Tracked ids whose entry no longer exists anywhere.
        for key in self.ledger.keys_with_prefix(ACTION_PREFIX) {
            let Some((key_user, date, action)) = parse_action_key(&key) else {
                warn!("Skipping unparseable action key '{}'", key);
                continue;
            };
            if key_user != user_id {
                continue;
            }
            let Some(state) = self.ledger.action_state(user_id, date, action)? else {
                continue;
            };
            if self.entries.get(&state.entry_id).await?.is_none() {
                debug!(
                    "Clearing stale tracked id {} for {}:{}:{}",
                    state.entry_id, user_id, date, action
                );
                self.ledger.clear_action_state(user_id, date, action)?;
            }
        }

        // Usage rows whose backing TOIL entry is gone.
        let live_toil_ids: HashSet<String> = self
            .entries
            .query_by_user_and_job_number(user_id, JOB_TOIL)
            .await?
            .into_iter()
            .filter(|e| e.synthetic)
            .map(|e| e.id)
            .collect();
        for usage in self.ledger.usage_rows_for_user(user_id)? {
            if !live_toil_ids.contains(&usage.entry_id) {
                warn!(
                    "Removing orphaned TOIL usage {} for {} (entry {} is gone)",
                    usage.id, user_id, usage.entry_id
                );
                self.ledger.delete(&usage_key(&usage.id))?;
                toil_months_touched.insert(usage.month_year);
            }
        }

        for month in toil_months_touched {
            self.notifier.publish(ChangeEvent::ToilUpdated {
                user_id: user_id.to_string(),
                month_year: month,
            });
        }
        if removed > 0 {
            info!(
                "Cleanup removed {} duplicate synthetic entries for {}",
                removed, user_id
            );
        }
        Ok(removed)
    }

    async fn synthetic_entries_for(
        &self,
        user_id: &str,
        date: NaiveDate,
        action: ActionType,
    ) -> Result<Vec<TimeEntry>, EngineError> {
        let job_number = action.job_number();
        let entries = self
            .entries
            .query_by_user_and_date(user_id, date)
            .await?
            .into_iter()
            .filter(|e| e.synthetic && e.job_number == job_number)
            .collect();
        Ok(entries)
    }

    /// Guarantees exactly one usage row backs the given TOIL entry.
    fn ensure_usage_row(
        &self,
        user_id: &str,
        date: NaiveDate,
        entry: &TimeEntry,
    ) -> Result<(), EngineError> {
        let existing = self
            .ledger
            .usage_rows_for_user(user_id)?
            .into_iter()
            .any(|u| u.entry_id == entry.id);
        if existing {
            return Ok(());
        }
        let usage = ToilUsage {
            id: new_record_id(),
            user_id: user_id.to_string(),
            date,
            hours: entry.hours,
            entry_id: entry.id.clone(),
            month_year: MonthYear::from_date(date),
        };
        self.ledger.put(&usage_key(&usage.id), &usage)?;
        Ok(())
    }

    fn remove_usage_rows_for_entry(
        &self,
        user_id: &str,
        entry_id: &str,
    ) -> Result<(), EngineError> {
        for usage in self.ledger.usage_rows_for_user(user_id)? {
            if usage.entry_id == entry_id {
                self.ledger.delete(&usage_key(&usage.id))?;
            }
        }
        Ok(())
    }

    fn publish_toggled(&self, user_id: &str, date: NaiveDate, action: ActionType, active: bool) {
        self.notifier.publish(ChangeEvent::ActionToggled {
            user_id: user_id.to_string(),
            date,
            action,
            active,
        });
        if action == ActionType::Toil {
            self.notifier.publish(ChangeEvent::ToilUpdated {
                user_id: user_id.to_string(),
                month_year: MonthYear::from_date(date),
            });
        }
    }
}

fn parse_action_key(key: &str) -> Option<(String, NaiveDate, ActionType)> {
    let rest = key.strip_prefix(ACTION_PREFIX)?;
    let (rest, action_str) = rest.rsplit_once(':')?;
    let (user_id, date_str) = rest.rsplit_once(':')?;
    let date: NaiveDate = date_str.parse().ok()?;
    let action: ActionType = action_str.parse().ok()?;
    Some((user_id.to_string(), date, action))
}

#[cfg(test)]
mod reconciler_key_tests {
    use super::*;
    use crate::ledger::action_state_key;

    #[test]
    fn action_keys_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date");
        let key = action_state_key("u1", date, ActionType::Smoko);
        assert_eq!(
            parse_action_key(&key),
            Some(("u1".to_string(), date, ActionType::Smoko))
        );
    }

    #[test]
    fn action_keys_tolerate_colons_in_user_ids() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date");
        let key = action_state_key("org:42:u1", date, ActionType::Sick);
        assert_eq!(
            parse_action_key(&key),
            Some(("org:42:u1".to_string(), date, ActionType::Sick))
        );
    }

    #[test]
    fn garbage_action_keys_are_rejected() {
        assert_eq!(parse_action_key("action:u1"), None);
        assert_eq!(parse_action_key("action:u1:2026-03-14:not-an-action"), None);
        assert_eq!(parse_action_key("toilrecord:u1"), None);
    }
}
