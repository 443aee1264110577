// src/model.rs
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// --- Business Constants ---

/// Contracted hours for a standard full-time day.
pub const STANDARD_DAY_HOURS: f64 = 7.6;
/// Hours credited when a whole day is taken as TOIL.
pub const STANDARD_TOIL_DAY_HOURS: f64 = 9.0;
pub const LUNCH_BREAK_HOURS: f64 = 0.5;
pub const SMOKO_BREAK_HOURS: f64 = 0.25;

/// Tolerance for comparing hour totals.
pub const HOURS_EPSILON: f64 = 1e-6;

// Job numbers reserved for synthetic (system-generated) time entries.
pub const JOB_SICK: &str = "SICK";
pub const JOB_LEAVE: &str = "LEAVE";
pub const JOB_TOIL: &str = "TOIL";
pub const JOB_LUNCH: &str = "LUNCH";
pub const JOB_SMOKO: &str = "SMOKO";
pub const SYNTHETIC_JOB_NUMBERS: [&str; 5] = [JOB_SICK, JOB_LEAVE, JOB_TOIL, JOB_LUNCH, JOB_SMOKO];

/// Generates a random identifier for newly created records.
pub fn new_record_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

// --- Calendar Month ---

/// A calendar month, rendered as "YYYY-MM" everywhere it crosses a boundary
/// (storage keys, JSON payloads, log lines).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthYear {
    year: i32,
    month: u32,
}

impl MonthYear {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// First calendar day of this month.
    pub fn first_day(&self) -> NaiveDate {
        // Valid by construction: month is always 1..=12.
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(self.year, 1, 1).unwrap_or_default())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First day of the following month; the earliest date on which this
    /// month may be closed out.
    pub fn first_day_of_following(&self) -> NaiveDate {
        self.next().first_day()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl fmt::Display for MonthYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthYear {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year_part, month_part) = s
            .split_once('-')
            .ok_or_else(|| format!("Invalid month format '{}', expected YYYY-MM", s))?;
        let year: i32 = year_part
            .parse()
            .map_err(|_| format!("Invalid year in month '{}'", s))?;
        let month: u32 = month_part
            .parse()
            .map_err(|_| format!("Invalid month number in '{}'", s))?;
        MonthYear::new(year, month).ok_or_else(|| format!("Month out of range in '{}'", s))
    }
}

impl TryFrom<String> for MonthYear {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthYear> for String {
    fn from(value: MonthYear) -> Self {
        value.to_string()
    }
}

// --- Day Actions ---

/// The toggleable whole-day actions a user can mark on a timesheet day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Sick,
    Leave,
    Toil,
    Lunch,
    Smoko,
}

/// Actions that occupy the whole day and therefore exclude one another.
pub const EXCLUSIVE_DAY_ACTIONS: [ActionType; 3] =
    [ActionType::Leave, ActionType::Sick, ActionType::Toil];

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Sick => "sick",
            ActionType::Leave => "leave",
            ActionType::Toil => "toil",
            ActionType::Lunch => "lunch",
            ActionType::Smoko => "smoko",
        }
    }

    /// The reserved job number carried by this action's synthetic entries.
    pub fn job_number(&self) -> &'static str {
        match self {
            ActionType::Sick => JOB_SICK,
            ActionType::Leave => JOB_LEAVE,
            ActionType::Toil => JOB_TOIL,
            ActionType::Lunch => JOB_LUNCH,
            ActionType::Smoko => JOB_SMOKO,
        }
    }

    pub fn from_job_number(job_number: &str) -> Option<Self> {
        match job_number {
            JOB_SICK => Some(ActionType::Sick),
            JOB_LEAVE => Some(ActionType::Leave),
            JOB_TOIL => Some(ActionType::Toil),
            JOB_LUNCH => Some(ActionType::Lunch),
            JOB_SMOKO => Some(ActionType::Smoko),
            _ => None,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        EXCLUSIVE_DAY_ACTIONS.contains(self)
    }

    pub fn entry_description(&self) -> String {
        match self {
            ActionType::Sick => "Sick day".to_string(),
            ActionType::Leave => "Annual leave".to_string(),
            ActionType::Toil => "TOIL day taken".to_string(),
            ActionType::Lunch => "Worked through lunch".to_string(),
            ActionType::Smoko => "Worked through smoko".to_string(),
        }
    }

    /// Whether this action records an absence (as opposed to extra time
    /// worked through a break). Absence entries never count as worked hours.
    pub fn is_absence(&self) -> bool {
        matches!(self, ActionType::Sick | ActionType::Leave | ActionType::Toil)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sick" => Ok(ActionType::Sick),
            "leave" => Ok(ActionType::Leave),
            "toil" => Ok(ActionType::Toil),
            "lunch" => Ok(ActionType::Lunch),
            "smoko" => Ok(ActionType::Smoko),
            other => Err(format!("Unknown action '{}'", other)),
        }
    }
}

// --- Users ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    Manager,
    TeamMember,
}

impl Role {
    pub fn can_decide_approvals(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::TeamMember => "team-member",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmploymentType {
    #[serde(rename = "full-time")]
    FullTime,
    #[serde(rename = "part-time")]
    PartTime,
    Casual,
}

impl EmploymentType {
    /// Classifies a full-time-equivalent fraction into an employment type.
    pub fn from_fte(fte: f64) -> Self {
        if fte >= 0.8 {
            EmploymentType::FullTime
        } else if fte >= 0.1 {
            EmploymentType::PartTime
        } else {
            EmploymentType::Casual
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub fte: f64,
    pub role: Role,
}

// --- Time Entries ---

/// A single timesheet line. Synthetic entries are created by the engine
/// itself when a day action is toggled on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub hours: f64,
    pub job_number: String,
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

// --- TOIL Ledger Records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToilRecordStatus {
    Active,
    Used,
    Expired,
}

impl fmt::Display for ToilRecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToilRecordStatus::Active => "active",
            ToilRecordStatus::Used => "used",
            ToilRecordStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// An accrual grant: TOIL hours earned on a given day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToilRecord {
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub hours: f64,
    pub month_year: MonthYear,
    /// Source time entry for day accruals; `None` for rollover grants.
    pub entry_id: Option<String>,
    pub status: ToilRecordStatus,
}

/// A usage row: TOIL hours spent, always backed by a synthetic TOIL entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToilUsage {
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub hours: f64,
    pub entry_id: String,
    pub month_year: MonthYear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Approved => "approved",
            ProcessingStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurplusAction {
    Paid,
    Banked,
}

impl fmt::Display for SurplusAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SurplusAction::Paid => "paid",
            SurplusAction::Banked => "banked",
        };
        f.write_str(s)
    }
}

impl FromStr for SurplusAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paid" => Ok(SurplusAction::Paid),
            "banked" => Ok(SurplusAction::Banked),
            other => Err(format!("Unknown surplus action '{}'", other)),
        }
    }
}

/// The month-end close-out of a user's TOIL balance, subject to approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToilProcessingRecord {
    pub id: String,
    pub user_id: String,
    pub month: MonthYear,
    pub total_hours: f64,
    pub rollover_hours: f64,
    pub surplus_hours: f64,
    pub surplus_action: Option<SurplusAction>,
    pub status: ProcessingStatus,
    pub submitted_at: DateTime<Utc>,
    pub approver_id: Option<String>,
    /// Decision timestamp, set on approval or rejection.
    pub approved_at: Option<DateTime<Utc>>,
    /// Ids of the accrual grants consumed by this close-out.
    pub original_records: Vec<String>,
}

// --- Derived Views ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToilSummary {
    pub user_id: String,
    pub month_year: MonthYear,
    pub accrued: f64,
    pub used: f64,
    pub remaining: f64,
}

/// Split of a month-end balance into rollover and surplus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub rollover_hours: f64,
    pub surplus_hours: f64,
}

/// Per-employment-type caps on how many hours may roll into the next month.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToilThresholds {
    pub full_time: f64,
    pub part_time: f64,
    pub casual: f64,
}

impl Default for ToilThresholds {
    fn default() -> Self {
        Self {
            full_time: 10.0,
            part_time: 5.0,
            casual: 2.0,
        }
    }
}

impl ToilThresholds {
    pub fn for_type(&self, employment_type: EmploymentType) -> f64 {
        match employment_type {
            EmploymentType::FullTime => self.full_time,
            EmploymentType::PartTime => self.part_time,
            EmploymentType::Casual => self.casual,
        }
    }
}

// --- Action Tracking ---

/// Tracks which synthetic entry currently realizes a toggled-on action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStateRecord {
    pub entry_id: String,
}

/// Result of a toggle request as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleResponse {
    pub success: bool,
    pub entry_id: Option<String>,
}
