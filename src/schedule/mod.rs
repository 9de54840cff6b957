//! Recurring schedules: recurrence rules, occurrence computation,
//! per-occurrence exceptions, and the background runner that fires them.

mod exceptions;
mod recurrence;
mod runner;
mod types;

pub use exceptions::{resolve_occurrence, Occurrence};
pub use recurrence::{compute_next, parse_cron, preview, MAX_CANDIDATE_SCANS};
pub use runner::ScheduleRunner;
pub use types::{
    ExceptionKind, Recurrence, Schedule, ScheduleException, ScheduleWindow, WeekdaySpec,
};
