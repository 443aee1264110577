// src/accrual.rs
//
// Pure TOIL arithmetic. Everything here is a function of its inputs; storage
// access and event publishing stay in the callers.

use crate::model::{
    ActionType, Distribution, EmploymentType, MonthYear, TimeEntry, ToilRecord, ToilRecordStatus,
    ToilSummary, ToilThresholds, ToilUsage, UserProfile, HOURS_EPSILON, LUNCH_BREAK_HOURS,
    SMOKO_BREAK_HOURS, STANDARD_DAY_HOURS, STANDARD_TOIL_DAY_HOURS,
};

/// Accrued/used/remaining hours for one user and month.
///
/// Only `active` grants count as accrued; grants consumed by an approved
/// month-end close (`used`) and lapsed ones (`expired`) drop out. Records
/// outside the requested user/month are ignored so callers can pass broader
/// slices without pre-filtering.
pub fn summarize(
    user_id: &str,
    month: MonthYear,
    records: &[ToilRecord],
    usages: &[ToilUsage],
) -> ToilSummary {
    let accrued: f64 = records
        .iter()
        .filter(|r| {
            r.user_id == user_id && r.month_year == month && r.status == ToilRecordStatus::Active
        })
        .map(|r| r.hours)
        .sum();
    let used: f64 = usages
        .iter()
        .filter(|u| u.user_id == user_id && u.month_year == month)
        .map(|u| u.hours)
        .sum();
    ToilSummary {
        user_id: user_id.to_string(),
        month_year: month,
        accrued,
        used,
        remaining: accrued - used,
    }
}

/// Splits a month-end balance into rollover and surplus against a threshold.
/// A non-positive balance distributes to zero on both sides.
pub fn distribute(remaining: f64, threshold: f64) -> Distribution {
    let remaining = remaining.max(0.0);
    let threshold = threshold.max(0.0);
    if remaining <= threshold + HOURS_EPSILON {
        Distribution {
            rollover_hours: remaining,
            surplus_hours: 0.0,
        }
    } else {
        Distribution {
            rollover_hours: threshold,
            surplus_hours: remaining - threshold,
        }
    }
}

/// The rollover threshold that applies to a user with the given FTE fraction.
pub fn threshold_for(thresholds: &ToilThresholds, fte: f64) -> f64 {
    thresholds.for_type(EmploymentType::from_fte(fte))
}

/// Contracted hours for one day of this user's schedule. Unknown users and
/// nonsensical FTE values fall back to a standard day.
pub fn scheduled_hours_for(profile: Option<&UserProfile>) -> f64 {
    match profile {
        Some(p) if p.fte > 0.0 => p.fte * STANDARD_DAY_HOURS,
        _ => STANDARD_DAY_HOURS,
    }
}

/// Hours carried by the synthetic entry for a toggled day action.
///
/// Whole-day absences cover the user's scheduled day, except TOIL days which
/// use the fixed standard TOIL day. Break actions record the time worked
/// through the break.
pub fn hours_to_record(action: ActionType, scheduled_hours: f64) -> f64 {
    match action {
        ActionType::Sick | ActionType::Leave => scheduled_hours,
        ActionType::Toil => STANDARD_TOIL_DAY_HOURS,
        ActionType::Lunch => LUNCH_BREAK_HOURS,
        ActionType::Smoko => SMOKO_BREAK_HOURS,
    }
}

/// Total hours actually worked on a day. Synthetic absence entries (sick,
/// leave, TOIL taken) are excluded; worked-through-break entries count.
pub fn worked_hours_for_day(entries: &[TimeEntry]) -> f64 {
    entries
        .iter()
        .filter(|e| {
            if !e.synthetic {
                return true;
            }
            match ActionType::from_job_number(&e.job_number) {
                Some(action) => !action.is_absence(),
                None => true,
            }
        })
        .map(|e| e.hours)
        .sum()
}

/// TOIL accrued by a day's work: hours beyond the scheduled day, floored
/// at zero.
pub fn excess_hours(worked: f64, scheduled: f64) -> f64 {
    let excess = worked - scheduled;
    if excess > HOURS_EPSILON {
        excess
    } else {
        0.0
    }
}
