use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};

use crate::types::{Schedule, ScheduleType};

/// Fallback steps, in days, used when a stored `start_time` cannot be parsed.
const DAILY_FALLBACK_DAYS: i64 = 1;
const WEEKLY_FALLBACK_DAYS: i64 = 7;
const MONTHLY_FALLBACK_DAYS: i64 = 30;

/// Parse a `HH:MM` wall-clock time (UTC).
pub fn parse_start_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// Parse a cron expression. Classic five-field expressions are accepted and
/// get a leading seconds field of `0`.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, cron::error::Error> {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {trimmed}"))
    } else {
        cron::Schedule::from_str(trimmed)
    }
}

/// Compute the next UTC trigger time for `schedule` strictly after `reference`.
///
/// Pure: no I/O and no clock access. Returns `None` for `now` schedules
/// (fired by the caller, not by the trigger loop) and for cron expressions
/// that do not parse; validation rejects the latter before they are stored.
///
/// When `start_date` lies in the future the first occurrence is pinned to it.
pub fn compute_next_run(schedule: &Schedule, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if schedule.schedule_type == ScheduleType::Now {
        return None;
    }

    if let Some(first) = first_occurrence(schedule) {
        if first > reference {
            return match schedule.schedule_type {
                // The first cron match at or after the anchor.
                ScheduleType::Custom => next_after(schedule, first - Duration::seconds(1)),
                _ => Some(first),
            };
        }
    }

    next_after(schedule, reference)
}

/// `start_date` at `start_time` (midnight when the type has no wall-clock time).
fn first_occurrence(schedule: &Schedule) -> Option<DateTime<Utc>> {
    let date = schedule.start_date?;
    let time = if schedule.schedule_type.requires_start_time() {
        schedule.start_time.as_deref().and_then(parse_start_time)?
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)?
    };
    Some(date.and_time(time).and_utc())
}

fn next_after(schedule: &Schedule, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start_time = schedule.start_time.as_deref().and_then(parse_start_time);

    match schedule.schedule_type {
        ScheduleType::Now => None,

        ScheduleType::Interval => schedule
            .interval_minutes
            .map(|m| reference + Duration::minutes(i64::from(m))),

        ScheduleType::Hourly => {
            let top = reference
                .with_nanosecond(0)?
                .with_second(0)?
                .with_minute(0)?;
            Some(top + Duration::hours(1))
        }

        ScheduleType::Daily => {
            let Some(time) = start_time else {
                return Some(reference + Duration::days(DAILY_FALLBACK_DAYS));
            };
            let candidate = reference.date_naive().and_time(time).and_utc();
            if candidate > reference {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }

        ScheduleType::Weekly => {
            let Some(time) = start_time else {
                return Some(reference + Duration::days(WEEKLY_FALLBACK_DAYS));
            };
            // Anchor weekday comes from start_date; without one, the
            // reference's own weekday.
            let target = schedule
                .start_date
                .map(|d| d.weekday())
                .unwrap_or_else(|| reference.weekday());
            let days_ahead = (i64::from(target.num_days_from_monday())
                - i64::from(reference.weekday().num_days_from_monday()))
            .rem_euclid(7);
            let candidate = (reference.date_naive() + Duration::days(days_ahead))
                .and_time(time)
                .and_utc();
            if candidate > reference {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }

        ScheduleType::Monthly => {
            let Some(time) = start_time else {
                return Some(reference + Duration::days(MONTHLY_FALLBACK_DAYS));
            };
            let anchor_day = schedule
                .start_date
                .map(|d| d.day())
                .unwrap_or_else(|| reference.day());

            let this_month = clamped_date(reference.year(), reference.month(), anchor_day)?
                .and_time(time)
                .and_utc();
            if this_month > reference {
                return Some(this_month);
            }
            let (year, month) = if reference.month() == 12 {
                (reference.year() + 1, 1)
            } else {
                (reference.year(), reference.month() + 1)
            };
            Some(clamped_date(year, month, anchor_day)?.and_time(time).and_utc())
        }

        ScheduleType::Custom => {
            let expression = schedule.cron_expression.as_deref()?;
            parse_cron(expression).ok()?.after(&reference).next()
        }
    }
}

/// `day` of `year-month`, clamped to the month's last day (31 → 30, 29, 28).
fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last_day = first_of_next.pred_opt()?.day();
    NaiveDate::from_ymd_opt(year, month, day.min(last_day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Parameters;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn schedule(schedule_type: ScheduleType) -> Schedule {
        let created = at(2024, 1, 1, 0, 0);
        Schedule {
            id: "s-1".into(),
            identifier: "nightly".into(),
            template_ref: "tpl".into(),
            schedule_type,
            cron_expression: None,
            interval_minutes: None,
            start_time: None,
            start_date: None,
            is_active: true,
            is_global: true,
            owner_id: None,
            last_run: None,
            next_run: None,
            parameters: Parameters::new(),
            created_at: created,
            updated_at: created,
        }
    }

    fn timed(schedule_type: ScheduleType, hh_mm: &str) -> Schedule {
        Schedule {
            start_time: Some(hh_mm.into()),
            ..schedule(schedule_type)
        }
    }

    #[test]
    fn now_never_has_a_next_run() {
        assert_eq!(compute_next_run(&schedule(ScheduleType::Now), at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn interval_adds_exactly_n_minutes() {
        let s = Schedule {
            interval_minutes: Some(5),
            ..schedule(ScheduleType::Interval)
        };
        let t = at(2024, 3, 10, 13, 7) + Duration::milliseconds(250);
        assert_eq!(compute_next_run(&s, t), Some(t + Duration::minutes(5)));
    }

    #[test]
    fn hourly_goes_to_top_of_next_hour() {
        let s = schedule(ScheduleType::Hourly);
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 8, 59)),
            Some(at(2024, 1, 1, 9, 0))
        );
        // exactly on the hour still moves forward
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 9, 0)),
            Some(at(2024, 1, 1, 10, 0))
        );
        assert_eq!(
            compute_next_run(&s, at(2024, 12, 31, 23, 30)),
            Some(at(2025, 1, 1, 0, 0))
        );
    }

    #[test]
    fn daily_before_and_after_start_time() {
        let s = timed(ScheduleType::Daily, "09:00");
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 8, 0)),
            Some(at(2024, 1, 1, 9, 0))
        );
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 9, 30)),
            Some(at(2024, 1, 2, 9, 0))
        );
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 9, 0)),
            Some(at(2024, 1, 2, 9, 0))
        );
    }

    #[test]
    fn daily_with_malformed_time_falls_back_to_one_day() {
        let s = timed(ScheduleType::Daily, "9am");
        let t = at(2024, 1, 1, 8, 0);
        assert_eq!(compute_next_run(&s, t), Some(t + Duration::days(1)));
    }

    #[test]
    fn weekly_searches_for_the_anchor_weekday() {
        // 2023-12-27 is a Wednesday, 2024-01-01 a Monday.
        let s = Schedule {
            start_date: NaiveDate::from_ymd_opt(2023, 12, 27),
            ..timed(ScheduleType::Weekly, "09:00")
        };
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 10, 0)),
            Some(at(2024, 1, 3, 9, 0))
        );
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 3, 9, 0)),
            Some(at(2024, 1, 10, 9, 0))
        );
    }

    #[test]
    fn weekly_without_anchor_uses_reference_weekday() {
        let s = timed(ScheduleType::Weekly, "09:00");
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 8, 0)),
            Some(at(2024, 1, 1, 9, 0))
        );
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 10, 0)),
            Some(at(2024, 1, 8, 9, 0))
        );
    }

    #[test]
    fn monthly_rolls_over_the_year() {
        let s = timed(ScheduleType::Monthly, "00:00");
        assert_eq!(
            compute_next_run(&s, at(2024, 12, 15, 0, 0)),
            Some(at(2025, 1, 15, 0, 0))
        );
    }

    #[test]
    fn monthly_clamps_to_last_day_and_keeps_anchor() {
        let s = Schedule {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            ..timed(ScheduleType::Monthly, "00:00")
        };
        let feb = compute_next_run(&s, at(2024, 1, 31, 0, 0)).unwrap();
        assert_eq!(feb, at(2024, 2, 29, 0, 0));
        let mar = compute_next_run(&s, feb).unwrap();
        assert_eq!(mar, at(2024, 3, 31, 0, 0));
        let apr = compute_next_run(&s, mar).unwrap();
        assert_eq!(apr, at(2024, 4, 30, 0, 0));
    }

    #[test]
    fn monthly_with_malformed_time_falls_back_to_thirty_days() {
        let s = timed(ScheduleType::Monthly, "25:99");
        let t = at(2024, 1, 1, 0, 0);
        assert_eq!(compute_next_run(&s, t), Some(t + Duration::days(30)));
    }

    #[test]
    fn custom_uses_cron_and_is_strictly_after_reference() {
        let s = Schedule {
            cron_expression: Some("*/15 * * * *".into()),
            ..schedule(ScheduleType::Custom)
        };
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 10, 7)),
            Some(at(2024, 1, 1, 10, 15))
        );
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 1, 10, 15)),
            Some(at(2024, 1, 1, 10, 30))
        );
    }

    #[test]
    fn invalid_cron_yields_none() {
        let s = Schedule {
            cron_expression: Some("every tuesday".into()),
            ..schedule(ScheduleType::Custom)
        };
        assert_eq!(compute_next_run(&s, at(2024, 1, 1, 0, 0)), None);
        assert!(parse_cron("every tuesday").is_err());
        assert!(parse_cron("0 0 3 * * *").is_ok());
    }

    #[test]
    fn future_start_date_pins_first_occurrence() {
        let s = Schedule {
            start_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            ..timed(ScheduleType::Daily, "09:00")
        };
        assert_eq!(
            compute_next_run(&s, at(2024, 1, 10, 12, 0)),
            Some(at(2024, 2, 1, 9, 0))
        );

        let interval = Schedule {
            start_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            interval_minutes: Some(30),
            ..schedule(ScheduleType::Interval)
        };
        assert_eq!(
            compute_next_run(&interval, at(2024, 1, 10, 12, 0)),
            Some(at(2024, 2, 1, 0, 0))
        );
    }

    #[test]
    fn parse_start_time_accepts_hh_mm_only() {
        assert_eq!(parse_start_time("09:30"), NaiveTime::from_hms_opt(9, 30, 0));
        assert!(parse_start_time("24:00").is_none());
        assert!(parse_start_time("noon").is_none());
    }
}
