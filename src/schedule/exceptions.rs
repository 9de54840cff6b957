//! Exception resolution for computed occurrences.
//!
//! Exceptions match on the occurrence's calendar date in the schedule's
//! timezone. Exactly one exception applies per occurrence: skip beats
//! reschedule beats modify, and within a kind the first covering entry in
//! listing order wins.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use super::types::{ExceptionKind, ScheduleException};
use crate::storage::DispatchOverrides;

/// Outcome of running one occurrence through the exception list.
#[derive(Debug, Clone, PartialEq)]
pub enum Occurrence {
    /// Suppressed entirely. The occurrence still advances the recurrence
    /// cursor; it just never dispatches.
    Skip,
    /// Dispatch at `fire_at`, with settings overridden for this one
    /// occurrence when `overrides` is set.
    Fire {
        fire_at: DateTime<Utc>,
        overrides: Option<DispatchOverrides>,
    },
}

/// Resolve what a computed occurrence should actually do.
///
/// A reschedule target is authoritative: it is not re-run through the
/// window/weekend/blackout filters, so an operator can deliberately move a
/// run outside the schedule's normal constraints.
pub fn resolve_occurrence(
    exceptions: &[ScheduleException],
    candidate: DateTime<Utc>,
    tz: &Tz,
) -> Occurrence {
    let local_date = candidate.with_timezone(tz).date_naive();

    for kind in [
        ExceptionKind::Skip,
        ExceptionKind::Reschedule,
        ExceptionKind::Modify,
    ] {
        let Some(exception) = exceptions
            .iter()
            .find(|e| e.kind == kind && e.covers(local_date))
        else {
            continue;
        };

        match kind {
            ExceptionKind::Skip => return Occurrence::Skip,
            ExceptionKind::Reschedule => {
                let Some(fire_at) = exception.reschedule_to else {
                    warn!(
                        exception_id = %exception.id,
                        schedule_id = %exception.schedule_id,
                        "reschedule exception has no target, firing at original time"
                    );
                    return Occurrence::Fire {
                        fire_at: candidate,
                        overrides: None,
                    };
                };
                return Occurrence::Fire {
                    fire_at,
                    overrides: None,
                };
            }
            ExceptionKind::Modify => {
                if exception.modified_config.is_none() {
                    warn!(
                        exception_id = %exception.id,
                        schedule_id = %exception.schedule_id,
                        "modify exception carries no overrides"
                    );
                }
                return Occurrence::Fire {
                    fire_at: candidate,
                    overrides: exception.modified_config.clone(),
                };
            }
        }
    }

    Occurrence::Fire {
        fire_at: candidate,
        overrides: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn tz() -> Tz {
        "America/Sao_Paulo".parse().unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn exception(id: &str, kind: ExceptionKind, from: NaiveDate, to: NaiveDate) -> ScheduleException {
        ScheduleException {
            id: id.to_string(),
            schedule_id: "sch-1".to_string(),
            kind,
            start_date: from,
            end_date: to,
            reschedule_to: None,
            modified_config: None,
        }
    }

    fn candidate_on(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        tz().with_ymd_and_hms(y, m, d, 9, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_no_exceptions_fires_unchanged() {
        let candidate = candidate_on(2025, 11, 21);
        assert_eq!(
            resolve_occurrence(&[], candidate, &tz()),
            Occurrence::Fire {
                fire_at: candidate,
                overrides: None
            }
        );
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let ex = exception("ex-1", ExceptionKind::Skip, date(2025, 11, 20), date(2025, 11, 22));
        let exceptions = vec![ex];

        for day in [20, 21, 22] {
            assert_eq!(
                resolve_occurrence(&exceptions, candidate_on(2025, 11, day), &tz()),
                Occurrence::Skip
            );
        }
        assert!(matches!(
            resolve_occurrence(&exceptions, candidate_on(2025, 11, 23), &tz()),
            Occurrence::Fire { .. }
        ));
    }

    #[test]
    fn test_skip_wins_over_reschedule_and_modify() {
        let day = date(2025, 11, 21);
        let mut reschedule = exception("ex-move", ExceptionKind::Reschedule, day, day);
        reschedule.reschedule_to = Some(candidate_on(2025, 11, 25));
        let mut modify = exception("ex-mod", ExceptionKind::Modify, day, day);
        modify.modified_config = Some(DispatchOverrides {
            rate_limit_per_hour: Some(10),
            max_concurrent: None,
        });
        let skip = exception("ex-skip", ExceptionKind::Skip, day, day);

        // Listing order puts skip last; precedence still selects it.
        let exceptions = vec![reschedule, modify, skip];
        assert_eq!(
            resolve_occurrence(&exceptions, candidate_on(2025, 11, 21), &tz()),
            Occurrence::Skip
        );
    }

    #[test]
    fn test_reschedule_target_is_used_verbatim() {
        let day = date(2025, 11, 21);
        let target = candidate_on(2025, 11, 30); // a Sunday, deliberately
        let mut ex = exception("ex-move", ExceptionKind::Reschedule, day, day);
        ex.reschedule_to = Some(target);

        assert_eq!(
            resolve_occurrence(&[ex], candidate_on(2025, 11, 21), &tz()),
            Occurrence::Fire {
                fire_at: target,
                overrides: None
            }
        );
    }

    #[test]
    fn test_reschedule_without_target_fires_original() {
        let day = date(2025, 11, 21);
        let ex = exception("ex-move", ExceptionKind::Reschedule, day, day);
        let candidate = candidate_on(2025, 11, 21);

        assert_eq!(
            resolve_occurrence(&[ex], candidate, &tz()),
            Occurrence::Fire {
                fire_at: candidate,
                overrides: None
            }
        );
    }

    #[test]
    fn test_modify_attaches_overrides_to_single_occurrence() {
        let day = date(2025, 11, 21);
        let mut ex = exception("ex-mod", ExceptionKind::Modify, day, day);
        ex.modified_config = Some(DispatchOverrides {
            rate_limit_per_hour: Some(50),
            max_concurrent: Some(2),
        });
        let candidate = candidate_on(2025, 11, 21);

        let Occurrence::Fire { fire_at, overrides } =
            resolve_occurrence(&[ex], candidate, &tz())
        else {
            panic!("expected fire");
        };
        assert_eq!(fire_at, candidate);
        assert_eq!(overrides.and_then(|o| o.rate_limit_per_hour), Some(50));

        // The next day is untouched.
        let mut ex2 = exception("ex-mod", ExceptionKind::Modify, day, day);
        ex2.modified_config = Some(DispatchOverrides {
            rate_limit_per_hour: Some(50),
            max_concurrent: Some(2),
        });
        assert_eq!(
            resolve_occurrence(&[ex2], candidate_on(2025, 11, 22), &tz()),
            Occurrence::Fire {
                fire_at: candidate_on(2025, 11, 22),
                overrides: None
            }
        );
    }

    #[test]
    fn test_first_covering_entry_within_kind_wins() {
        let day = date(2025, 11, 21);
        let mut first = exception("ex-a", ExceptionKind::Reschedule, day, day);
        first.reschedule_to = Some(candidate_on(2025, 11, 24));
        let mut second = exception("ex-b", ExceptionKind::Reschedule, day, day);
        second.reschedule_to = Some(candidate_on(2025, 11, 28));

        assert_eq!(
            resolve_occurrence(&[first, second], candidate_on(2025, 11, 21), &tz()),
            Occurrence::Fire {
                fire_at: candidate_on(2025, 11, 24),
                overrides: None
            }
        );
    }

    #[test]
    fn test_match_uses_local_date_not_utc_date() {
        // 23:00 São Paulo on Nov 21 is already Nov 22 in UTC. The exception
        // on the local date must still match.
        let candidate = tz()
            .with_ymd_and_hms(2025, 11, 21, 23, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(candidate.date_naive(), date(2025, 11, 22));

        let ex = exception("ex-1", ExceptionKind::Skip, date(2025, 11, 21), date(2025, 11, 21));
        assert_eq!(resolve_occurrence(&[ex], candidate, &tz()), Occurrence::Skip);
    }
}
