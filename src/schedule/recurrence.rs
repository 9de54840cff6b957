//! Occurrence computation.
//!
//! Candidates are generated on the schedule's local wall clock, run through
//! the window/weekend/blackout/holiday filters, and only then resolved to
//! UTC. A filtered-out candidate moves to the next one under the recurrence
//! rule; a bounded scan keeps pathological configurations from looping.

use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;
use tracing::debug;

use super::exceptions::{resolve_occurrence, Occurrence};
use super::types::{Recurrence, Schedule, ScheduleException, WeekdaySpec};
use crate::error::{Error, Result};
use crate::gateway::HolidayCalendar;

/// Hard cap on candidates examined per computation. Hitting it means the
/// schedule's filters reject everything its rule generates; that is a
/// configuration problem and is reported as one, loudly.
pub const MAX_CANDIDATE_SCANS: u32 = 366;

/// Compute the next occurrence strictly after `after`.
///
/// `Ok(None)` means the recurrence is exhausted (a `once` already fired, a
/// `custom` list ran out). The returned instant already satisfies window,
/// weekend, blackout, and holiday constraints.
pub fn compute_next(
    schedule: &Schedule,
    after: DateTime<Utc>,
    holidays: &dyn HolidayCalendar,
) -> Result<Option<DateTime<Utc>>> {
    let tz = schedule.tz()?;
    let mut cursor = after.with_timezone(&tz).naive_local();

    for _ in 0..MAX_CANDIDATE_SCANS {
        let Some(candidate) = next_raw_candidate(schedule, &tz, cursor)? else {
            return Ok(None);
        };
        cursor = candidate;

        // Window clip: an early candidate slides to the window start on the
        // same day; a late one means the day is spent.
        let mut local = candidate;
        if local.time() < schedule.window.start_time {
            local = local.date().and_time(schedule.window.start_time);
        } else if local.time() > schedule.window.end_time {
            continue;
        }

        if schedule.skip_weekends && is_weekend(local.date()) {
            continue;
        }
        if schedule.blackout_dates.contains(&local.date()) {
            continue;
        }
        if schedule.skip_holidays && holidays.is_holiday(local.date()) {
            continue;
        }

        let Some(resolved) = resolve_local(&tz, local) else {
            debug!(
                schedule_id = %schedule.id,
                candidate = %local,
                "wall time does not exist locally, skipping candidate"
            );
            continue;
        };
        let utc = resolved.with_timezone(&Utc);
        if utc > after {
            return Ok(Some(utc));
        }
    }

    Err(Error::Schedule(format!(
        "schedule '{}' found no eligible occurrence within {} candidates; \
         window, weekend, blackout, and holiday settings reject everything the rule generates",
        schedule.id, MAX_CANDIDATE_SCANS
    )))
}

/// Preview the next occurrences after `after`, with exceptions applied,
/// without mutating anything.
///
/// Skipped occurrences are omitted, rescheduled ones appear at their
/// target instant, modified ones at their original instant.
pub fn preview(
    schedule: &Schedule,
    exceptions: &[ScheduleException],
    after: DateTime<Utc>,
    count: usize,
    horizon_days: i64,
    holidays: &dyn HolidayCalendar,
) -> Result<Vec<DateTime<Utc>>> {
    let tz = schedule.tz()?;
    let horizon = after + Duration::days(horizon_days);
    let mut cursor = after;
    let mut occurrences = Vec::new();

    while occurrences.len() < count {
        let Some(candidate) = compute_next(schedule, cursor, holidays)? else {
            break;
        };
        if candidate > horizon {
            break;
        }
        cursor = candidate;

        match resolve_occurrence(exceptions, candidate, &tz) {
            Occurrence::Skip => continue,
            Occurrence::Fire { fire_at, .. } => occurrences.push(fire_at),
        }
    }

    Ok(occurrences)
}

/// Parse a 5-field cron expression into an evaluator.
///
/// The evaluator wants a seconds field; standard expressions get `0`
/// prepended.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() != 5 {
        return Err(Error::Validation(format!(
            "Cron expression '{}' must have 5 fields (minute hour day-of-month month day-of-week)",
            expression
        )));
    }
    cron::Schedule::from_str(&format!("0 {}", trimmed))
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expression, e)))
}

/// Smallest raw candidate strictly after `cursor`, on the local wall clock.
/// Candidates carry the window start time except for cron, which has its
/// own notion of time.
fn next_raw_candidate(
    schedule: &Schedule,
    tz: &Tz,
    cursor: NaiveDateTime,
) -> Result<Option<NaiveDateTime>> {
    let start_time = schedule.window.start_time;

    match &schedule.recurrence {
        Recurrence::Once => {
            let candidate = schedule.start_date.and_time(start_time);
            Ok((candidate > cursor).then_some(candidate))
        }

        Recurrence::Daily { interval } => {
            let interval = i64::from(*interval).max(1);
            let base = schedule.start_date;
            let days_from_base = (cursor.date() - base).num_days();
            let mut k = if days_from_base < 0 {
                0
            } else {
                days_from_base / interval
            };

            for _ in 0..3 {
                if let Some(date) = base.checked_add_signed(Duration::days(k * interval)) {
                    let candidate = date.and_time(start_time);
                    if candidate > cursor {
                        return Ok(Some(candidate));
                    }
                }
                k += 1;
            }
            Err(Error::Schedule(format!(
                "schedule '{}': daily recurrence failed to advance",
                schedule.id
            )))
        }

        Recurrence::Weekly { days, interval } => {
            let interval = i64::from(*interval).max(1);
            let anchor = week_monday(schedule.start_date);
            let mut date = cursor.date().max(schedule.start_date);

            let scan_days = 7 * interval + 14;
            for _ in 0..scan_days {
                let candidate = date.and_time(start_time);
                if candidate > cursor && weekday_listed(days, date) {
                    let weeks = (week_monday(date) - anchor).num_days() / 7;
                    if weeks % interval == 0 {
                        return Ok(Some(candidate));
                    }
                }
                date = date
                    .succ_opt()
                    .ok_or_else(|| Error::Schedule("date overflow in weekly recurrence".into()))?;
            }
            Err(Error::Schedule(format!(
                "schedule '{}': no weekly candidate within {} days",
                schedule.id, scan_days
            )))
        }

        Recurrence::Monthly {
            day_of_month,
            interval,
        } => {
            let interval = i64::from(*interval).max(1);
            let base_index = month_index(schedule.start_date);
            let mut index = month_index(cursor.date().max(schedule.start_date));
            let offset = index - base_index;
            if offset % interval != 0 {
                index += interval - offset % interval;
            }

            for _ in 0..4 {
                let (year, month) = from_month_index(index);
                let day = (*day_of_month).min(last_day_of_month(year, month)?);
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                    if date >= schedule.start_date {
                        let candidate = date.and_time(start_time);
                        if candidate > cursor {
                            return Ok(Some(candidate));
                        }
                    }
                }
                index += interval;
            }
            Err(Error::Schedule(format!(
                "schedule '{}': monthly recurrence failed to advance",
                schedule.id
            )))
        }

        Recurrence::Cron { expression } => {
            let evaluator = parse_cron(expression)?;
            // Fire only from the start date onward.
            let floor = schedule.start_date.and_time(NaiveTime::MIN) - Duration::seconds(1);
            let seed = resolve_local_lenient(tz, cursor.max(floor));
            Ok(evaluator.after(&seed).next().map(|dt| dt.naive_local()))
        }

        Recurrence::Custom { dates } => {
            let mut sorted = dates.clone();
            sorted.sort_unstable();
            for date in sorted {
                let candidate = date.and_time(start_time);
                if candidate > cursor {
                    return Ok(Some(candidate));
                }
            }
            Ok(None)
        }
    }
}

fn weekday_listed(days: &[WeekdaySpec], date: NaiveDate) -> bool {
    days.iter().any(|d| d.to_chrono() == date.weekday())
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

fn week_monday(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn from_month_index(index: i64) -> (i32, u32) {
    ((index.div_euclid(12)) as i32, (index.rem_euclid(12) + 1) as u32)
}

fn last_day_of_month(year: i32, month: u32) -> Result<u32> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .ok_or_else(|| Error::Schedule(format!("invalid month arithmetic: {}-{}", year, month)))
}

/// Resolve a local wall time to an instant. Ambiguous wall times (clocks
/// rolled back) take the earlier instant; nonexistent ones (clocks jumped
/// forward) resolve to None.
fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    }
}

/// Like `resolve_local`, but always produces an instant. Gap wall times
/// are read as UTC; this only seeds the cron iterator, the result still
/// goes through the strictly-after check.
fn resolve_local_lenient(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    resolve_local(tz, naive).unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{FixedHolidayCalendar, NoHolidays};
    use crate::schedule::types::ScheduleWindow;

    const TZ: &str = "America/Sao_Paulo";

    fn schedule(recurrence: Recurrence, start: (i32, u32, u32)) -> Schedule {
        Schedule {
            id: "sch-1".to_string(),
            automation_id: "auto-1".to_string(),
            recurrence,
            start_date: date(start.0, start.1, start.2),
            window: ScheduleWindow {
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            },
            timezone: TZ.to_string(),
            blackout_dates: vec![],
            skip_weekends: false,
            skip_holidays: false,
            is_paused: false,
            next_scheduled_at: None,
            last_executed_at: None,
            execution_count: 0,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(tz_name: &str, y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        let tz: Tz = tz_name.parse().unwrap();
        tz.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn local(dt: DateTime<Utc>, tz_name: &str) -> NaiveDateTime {
        let tz: Tz = tz_name.parse().unwrap();
        dt.with_timezone(&tz).naive_local()
    }

    #[test]
    fn test_weekly_first_occurrence_after_midweek_start() {
        // Start Thursday 2025-11-20 with mon/wed/fri at 09:00: the first
        // occurrence is Friday the 21st, not anything in the following week.
        let sched = schedule(
            Recurrence::Weekly {
                days: vec![WeekdaySpec::Mon, WeekdaySpec::Wed, WeekdaySpec::Fri],
                interval: 1,
            },
            (2025, 11, 20),
        );
        let after = at(TZ, 2025, 11, 20, 0, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 11, 21).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_blackout_and_weekend_skip() {
        // Christmas 2025 is Thursday. Blacked out, and the schedule skips
        // weekends, so after the Dec 24 run the next lands Friday Dec 26.
        let mut sched = schedule(Recurrence::Daily { interval: 1 }, (2025, 12, 1));
        sched.blackout_dates = vec![date(2025, 12, 25)];
        sched.skip_weekends = true;
        let after = at(TZ, 2025, 12, 24, 9, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 12, 26).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_weekend_skip_to_monday() {
        let mut sched = schedule(Recurrence::Daily { interval: 1 }, (2025, 11, 3));
        sched.skip_weekends = true;
        // Friday 2025-11-07 09:00 just fired.
        let after = at(TZ, 2025, 11, 7, 9, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 11, 10).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_interval_three() {
        let sched = schedule(Recurrence::Daily { interval: 3 }, (2025, 11, 3));
        let after = at(TZ, 2025, 11, 4, 12, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 11, 6).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_once_fires_then_exhausts() {
        let sched = schedule(Recurrence::Once, (2025, 11, 20));

        let before = at(TZ, 2025, 11, 1, 0, 0);
        let next = compute_next(&sched, before, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 11, 20).and_hms_opt(9, 0, 0).unwrap());

        let past = at(TZ, 2025, 11, 20, 9, 0);
        assert_eq!(compute_next(&sched, past, &NoHolidays).unwrap(), None);
    }

    #[test]
    fn test_monthly_clamps_to_short_month() {
        let sched = schedule(
            Recurrence::Monthly {
                day_of_month: 31,
                interval: 1,
            },
            (2026, 1, 31),
        );
        let after = at(TZ, 2026, 2, 1, 0, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2026, 2, 28).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_skips_day_before_start_date() {
        let sched = schedule(
            Recurrence::Monthly {
                day_of_month: 5,
                interval: 1,
            },
            (2025, 11, 20),
        );
        let after = at(TZ, 2025, 11, 1, 0, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 12, 5).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_interval_two_alignment() {
        let sched = schedule(
            Recurrence::Monthly {
                day_of_month: 5,
                interval: 2,
            },
            (2025, 10, 1),
        );
        // October fired; November is off-cycle, December is on.
        let after = at(TZ, 2025, 10, 5, 9, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 12, 5).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_weekly_interval_two_anchored_to_start_week() {
        let sched = schedule(
            Recurrence::Weekly {
                days: vec![WeekdaySpec::Mon],
                interval: 2,
            },
            (2025, 11, 3), // a Monday
        );
        let after = at(TZ, 2025, 11, 3, 9, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 11, 17).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_cron_respects_window_clip() {
        // Hourly cron; everything after 18:00 is spent, next day's early
        // candidates clip forward to the window start.
        let sched = schedule(
            Recurrence::Cron {
                expression: "0 * * * *".to_string(),
            },
            (2025, 11, 3),
        );
        let after = at(TZ, 2025, 11, 4, 18, 30);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 11, 5).and_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_cron_within_window_keeps_own_time() {
        let sched = schedule(
            Recurrence::Cron {
                expression: "30 14 * * *".to_string(),
            },
            (2025, 11, 3),
        );
        let after = at(TZ, 2025, 11, 4, 9, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 11, 4).and_hms_opt(14, 30, 0).unwrap());
    }

    #[test]
    fn test_cron_rejects_wrong_field_count() {
        assert!(parse_cron("* * * *").is_err());
        assert!(parse_cron("0 0 * * * *").is_err());
        assert!(parse_cron("0 9 * * 1-5").is_ok());
    }

    #[test]
    fn test_custom_dates_pick_next_listed() {
        let sched = schedule(
            Recurrence::Custom {
                dates: vec![date(2025, 12, 1), date(2025, 11, 10), date(2026, 1, 15)],
            },
            (2025, 11, 1),
        );
        let after = at(TZ, 2025, 11, 10, 9, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(local(next, TZ), date(2025, 12, 1).and_hms_opt(9, 0, 0).unwrap());

        let exhausted = at(TZ, 2026, 1, 15, 9, 0);
        assert_eq!(compute_next(&sched, exhausted, &NoHolidays).unwrap(), None);
    }

    #[test]
    fn test_holiday_calendar_consulted_only_when_enabled() {
        let christmas = date(2025, 12, 25);
        let holidays = FixedHolidayCalendar::new([christmas]);

        let mut sched = schedule(Recurrence::Daily { interval: 1 }, (2025, 12, 1));
        let after = at(TZ, 2025, 12, 24, 9, 0);

        // skip_holidays off: Christmas fires.
        let next = compute_next(&sched, after, &holidays).unwrap().unwrap();
        assert_eq!(local(next, TZ).date(), christmas);

        // skip_holidays on: pushed to the 26th.
        sched.skip_holidays = true;
        let next = compute_next(&sched, after, &holidays).unwrap().unwrap();
        assert_eq!(local(next, TZ).date(), date(2025, 12, 26));
    }

    #[test]
    fn test_output_is_strictly_after() {
        let sched = schedule(Recurrence::Daily { interval: 1 }, (2025, 11, 3));
        let occurrence = at(TZ, 2025, 11, 10, 9, 0);

        let next = compute_next(&sched, occurrence, &NoHolidays).unwrap().unwrap();
        assert!(next > occurrence);
        assert_eq!(local(next, TZ).date(), date(2025, 11, 11));
    }

    #[test]
    fn test_total_blackout_fails_loudly() {
        let mut sched = schedule(Recurrence::Daily { interval: 1 }, (2025, 11, 3));
        sched.blackout_dates = (0..400)
            .filter_map(|k| date(2025, 11, 3).checked_add_signed(Duration::days(k)))
            .collect();
        let after = at(TZ, 2025, 11, 3, 0, 0);

        let err = compute_next(&sched, after, &NoHolidays).unwrap_err();
        assert_eq!(err.code(), "SCHEDULE_ERROR");
    }

    #[test]
    fn test_dst_gap_candidate_is_skipped() {
        // US spring-forward 2026-03-08: 02:30 does not exist in New York.
        let mut sched = schedule(Recurrence::Daily { interval: 1 }, (2026, 3, 7));
        sched.timezone = "America/New_York".to_string();
        sched.window = ScheduleWindow {
            start_time: NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
        };
        let after = at("America/New_York", 2026, 3, 7, 3, 0);

        let next = compute_next(&sched, after, &NoHolidays).unwrap().unwrap();
        assert_eq!(
            local(next, "America/New_York"),
            date(2026, 3, 9).and_hms_opt(2, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_preview_applies_exceptions() {
        use crate::schedule::types::{ExceptionKind, ScheduleException};

        let sched = schedule(Recurrence::Daily { interval: 1 }, (2025, 11, 3));
        let moved_to = at(TZ, 2025, 11, 8, 15, 0);
        let exceptions = vec![
            ScheduleException {
                id: "ex-skip".to_string(),
                schedule_id: "sch-1".to_string(),
                kind: ExceptionKind::Skip,
                start_date: date(2025, 11, 4),
                end_date: date(2025, 11, 4),
                reschedule_to: None,
                modified_config: None,
            },
            ScheduleException {
                id: "ex-move".to_string(),
                schedule_id: "sch-1".to_string(),
                kind: ExceptionKind::Reschedule,
                start_date: date(2025, 11, 5),
                end_date: date(2025, 11, 5),
                reschedule_to: Some(moved_to),
                modified_config: None,
            },
        ];
        let after = at(TZ, 2025, 11, 3, 10, 0);

        let occurrences = preview(&sched, &exceptions, after, 3, 30, &NoHolidays).unwrap();
        assert_eq!(
            occurrences,
            vec![
                moved_to,                  // Nov 4 skipped, Nov 5 moved here
                at(TZ, 2025, 11, 6, 9, 0),
                at(TZ, 2025, 11, 7, 9, 0),
            ]
        );
    }
}
