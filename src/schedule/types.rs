//! Schedule and recurrence types.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::DispatchOverrides;

/// Days of the week for weekly recurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekdaySpec {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl WeekdaySpec {
    pub fn to_chrono(self) -> Weekday {
        match self {
            WeekdaySpec::Mon => Weekday::Mon,
            WeekdaySpec::Tue => Weekday::Tue,
            WeekdaySpec::Wed => Weekday::Wed,
            WeekdaySpec::Thu => Weekday::Thu,
            WeekdaySpec::Fri => Weekday::Fri,
            WeekdaySpec::Sat => Weekday::Sat,
            WeekdaySpec::Sun => Weekday::Sun,
        }
    }
}

/// Recurrence rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fire once, on the schedule's start date
    Once,
    /// Every `interval` days from the start date
    Daily {
        #[serde(default = "default_interval")]
        interval: u32,
    },
    /// Listed weekdays, in weeks at `interval` from the start date's week
    Weekly {
        days: Vec<WeekdaySpec>,
        #[serde(default = "default_interval")]
        interval: u32,
    },
    /// A day of the month, in months at `interval` from the start date's
    /// month; days past a month's end clamp to its last day
    Monthly {
        day_of_month: u32,
        #[serde(default = "default_interval")]
        interval: u32,
    },
    /// Standard 5-field cron expression
    Cron { expression: String },
    /// An explicit list of calendar dates
    Custom { dates: Vec<NaiveDate> },
}

fn default_interval() -> u32 {
    1
}

/// Daily send window on the schedule's local wall clock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScheduleWindow {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl ScheduleWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start_time <= time && time <= self.end_time
    }
}

/// When and how an automation fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub automation_id: String,
    pub recurrence: Recurrence,

    /// First day the schedule is active
    pub start_date: NaiveDate,

    /// Send window; candidates before it are pushed to its start, candidates
    /// after it move to the next eligible day
    pub window: ScheduleWindow,

    /// IANA timezone name; every candidate is computed on this wall clock
    pub timezone: String,

    /// Dates that never fire
    #[serde(default)]
    pub blackout_dates: Vec<NaiveDate>,

    #[serde(default)]
    pub skip_weekends: bool,

    /// Consult the holiday calendar collaborator
    #[serde(default)]
    pub skip_holidays: bool,

    #[serde(default)]
    pub is_paused: bool,

    /// Always a fully filtered instant or None, never a raw candidate
    #[serde(default)]
    pub next_scheduled_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub execution_count: u64,
}

impl Schedule {
    /// Parse the schedule's timezone.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid timezone: {}", self.timezone)))
    }

    /// Save-time sanity checks. Anything rejected here would otherwise
    /// surface mid-poll as a schedule error.
    pub fn validate(&self) -> Result<()> {
        self.tz()?;

        if self.window.start_time > self.window.end_time {
            return Err(Error::Validation(format!(
                "Schedule '{}': window start {} is after end {}",
                self.id, self.window.start_time, self.window.end_time
            )));
        }

        match &self.recurrence {
            Recurrence::Once => {}
            Recurrence::Daily { interval } => {
                if *interval == 0 {
                    return Err(Error::Validation(format!(
                        "Schedule '{}': interval must be at least 1",
                        self.id
                    )));
                }
            }
            Recurrence::Weekly { days, interval } => {
                if *interval == 0 {
                    return Err(Error::Validation(format!(
                        "Schedule '{}': interval must be at least 1",
                        self.id
                    )));
                }
                if days.is_empty() {
                    return Err(Error::Validation(format!(
                        "Schedule '{}': weekly recurrence needs at least one day",
                        self.id
                    )));
                }
            }
            Recurrence::Monthly {
                day_of_month,
                interval,
            } => {
                if *interval == 0 {
                    return Err(Error::Validation(format!(
                        "Schedule '{}': interval must be at least 1",
                        self.id
                    )));
                }
                if !(1..=31).contains(day_of_month) {
                    return Err(Error::Validation(format!(
                        "Schedule '{}': day_of_month {} out of range 1..=31",
                        self.id, day_of_month
                    )));
                }
            }
            Recurrence::Cron { expression } => {
                super::recurrence::parse_cron(expression)?;
            }
            Recurrence::Custom { dates } => {
                if dates.is_empty() {
                    return Err(Error::Validation(format!(
                        "Schedule '{}': custom recurrence needs at least one date",
                        self.id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Exception kinds, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    Skip,
    Reschedule,
    Modify,
}

impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Reschedule => write!(f, "reschedule"),
            Self::Modify => write!(f, "modify"),
        }
    }
}

impl std::str::FromStr for ExceptionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "reschedule" => Ok(Self::Reschedule),
            "modify" => Ok(Self::Modify),
            _ => Err(format!("Unknown exception kind: {}", s)),
        }
    }
}

/// One-off override of a schedule over a local date range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleException {
    pub id: String,
    pub schedule_id: String,
    pub kind: ExceptionKind,

    /// Inclusive local date range the exception applies to
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,

    /// Target instant for `reschedule`; taken verbatim, never re-filtered
    #[serde(default)]
    pub reschedule_to: Option<DateTime<Utc>>,

    /// Dispatch overlay for `modify`, applied to that occurrence only
    #[serde(default)]
    pub modified_config: Option<DispatchOverrides>,
}

impl ScheduleException {
    /// Whether the exception covers a local calendar date.
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}
