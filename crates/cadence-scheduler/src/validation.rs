use crate::error::{Result, SchedulerError};
use crate::schedule::{parse_cron, parse_start_time};
use crate::types::{Schedule, ScheduleType};

/// Shortest accepted interval. Anything below this would thrash the trigger.
pub const MIN_INTERVAL_MINUTES: u32 = 1;

/// Clear the timing fields that carry no meaning for the schedule's type.
pub fn normalize(schedule: &mut Schedule) {
    let kind = schedule.schedule_type;
    if kind != ScheduleType::Custom {
        schedule.cron_expression = None;
    }
    if kind != ScheduleType::Interval {
        schedule.interval_minutes = None;
    }
    if !kind.uses_start_time() {
        schedule.start_time = None;
    }
    if let Some(expr) = schedule.cron_expression.as_mut() {
        *expr = expr.trim().to_string();
    }
    if let Some(time) = schedule.start_time.as_mut() {
        *time = time.trim().to_string();
    }
    schedule.identifier = schedule.identifier.trim().to_string();
}

/// Check that exactly the fields required by `schedule_type` are present and
/// well-formed. Errors name the offending field.
pub fn validate(schedule: &Schedule) -> Result<()> {
    if schedule.identifier.is_empty() {
        return Err(SchedulerError::invalid("identifier", "must not be empty"));
    }
    if schedule.template_ref.trim().is_empty() {
        return Err(SchedulerError::invalid("template_ref", "must not be empty"));
    }
    if !schedule.is_global && schedule.owner_id.as_deref().map_or(true, str::is_empty) {
        return Err(SchedulerError::invalid(
            "owner_id",
            "private schedules need an owner",
        ));
    }

    match schedule.schedule_type {
        ScheduleType::Custom => {
            let expr = schedule
                .cron_expression
                .as_deref()
                .filter(|e| !e.is_empty())
                .ok_or_else(|| {
                    SchedulerError::invalid("cron_expression", "required for custom schedules")
                })?;
            parse_cron(expr).map_err(|e| {
                SchedulerError::invalid("cron_expression", format!("{expr:?} does not parse: {e}"))
            })?;
        }
        ScheduleType::Interval => match schedule.interval_minutes {
            None => {
                return Err(SchedulerError::invalid(
                    "interval_minutes",
                    "required for interval schedules",
                ))
            }
            Some(m) if m < MIN_INTERVAL_MINUTES => {
                return Err(SchedulerError::invalid(
                    "interval_minutes",
                    format!("must be at least {MIN_INTERVAL_MINUTES}"),
                ))
            }
            Some(_) => {}
        },
        ScheduleType::Now => {}
        kind => match schedule.start_time.as_deref() {
            None if kind.requires_start_time() => {
                return Err(SchedulerError::invalid(
                    "start_time",
                    format!("required for {kind} schedules"),
                ))
            }
            Some(raw) if parse_start_time(raw).is_none() => {
                return Err(SchedulerError::invalid(
                    "start_time",
                    format!("{raw:?} is not a HH:MM time"),
                ))
            }
            _ => {}
        },
    }
    Ok(())
}
