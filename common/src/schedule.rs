// Schedule parsing and calculation module
//
// Validates cron/one-shot schedule specs and computes next execution times.
// Cron expressions are evaluated in the schedule's timezone.

use crate::errors::ScheduleError;
use crate::models::ScheduleSpec;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::collections::BTreeSet;
use std::str::FromStr;

/// A validated schedule trigger
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Cron {
        /// Normalised to the seconds-first form understood by the `cron` crate
        expression: String,
        timezone: Tz,
    },
    Once {
        at: DateTime<Utc>,
    },
}

/// ScheduleTrigger defines how next execution times are derived from a spec
pub trait ScheduleTrigger {
    /// Next execution strictly after `after`, honouring end date and limit
    fn next_execution_time(
        &self,
        after: DateTime<Utc>,
        execution_count: u64,
        default_timezone: Tz,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError>;

    /// Whether a schedule that has fired `execution_count` times must stop
    fn is_complete(&self, execution_count: u64, now: DateTime<Utc>) -> bool;
}

impl ScheduleTrigger for ScheduleSpec {
    fn next_execution_time(
        &self,
        after: DateTime<Utc>,
        execution_count: u64,
        default_timezone: Tz,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        if self.is_complete(execution_count, after) {
            return Ok(None);
        }

        match (&self.cron, self.at) {
            (Some(expression), None) => {
                let timezone = parse_timezone(self.timezone.as_deref(), default_timezone)?;
                calculate_cron_next_execution(expression, timezone, self.end_date, after)
            }
            (None, Some(at)) => Ok(if execution_count == 0 && at > after {
                Some(at)
            } else {
                None
            }),
            _ => Err(ScheduleError::InvalidConfiguration(
                "exactly one of 'cron' or 'at' must be set".to_string(),
            )),
        }
    }

    fn is_complete(&self, execution_count: u64, now: DateTime<Utc>) -> bool {
        if self.at.is_some() && execution_count > 0 {
            return true;
        }
        if let Some(limit) = self.limit {
            if execution_count >= limit {
                return true;
            }
        }
        if let Some(end) = self.end_date {
            if now > end {
                return true;
            }
        }
        false
    }
}

/// Validate a spec and turn it into a [`Trigger`]
///
/// Rules: exactly one of cron/at, cron must parse, `at` must be strictly in
/// the future, timezone must be a valid IANA zone, end date in the future,
/// limit at least 1.
pub fn validate_spec(
    spec: &ScheduleSpec,
    default_timezone: Tz,
    now: DateTime<Utc>,
) -> Result<Trigger, ScheduleError> {
    let timezone = parse_timezone(spec.timezone.as_deref(), default_timezone)?;

    if let Some(end) = spec.end_date {
        if end <= now {
            return Err(ScheduleError::InvalidConfiguration(
                "'endDate' must be in the future".to_string(),
            ));
        }
    }
    if spec.limit == Some(0) {
        return Err(ScheduleError::InvalidConfiguration(
            "'limit' must be at least 1".to_string(),
        ));
    }

    match (&spec.cron, spec.at) {
        (Some(_), Some(_)) => Err(ScheduleError::InvalidConfiguration(
            "'cron' and 'at' are mutually exclusive".to_string(),
        )),
        (None, None) => Err(ScheduleError::InvalidConfiguration(
            "one of 'cron' or 'at' is required".to_string(),
        )),
        (Some(expression), None) => {
            let normalized = normalize_cron_expression(expression);
            parse_cron_expression(&normalized)?;
            Ok(Trigger::Cron {
                expression: normalized,
                timezone,
            })
        }
        (None, Some(at)) => {
            if at <= now {
                return Err(ScheduleError::InvalidConfiguration(format!(
                    "'at' must be in the future (got {})",
                    at.to_rfc3339()
                )));
            }
            Ok(Trigger::Once { at })
        }
    }
}

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Expand classic 5-field cron syntax to the seconds-first form
///
/// `0 * * * *` becomes `0 0 * * * *`. A classic day-of-week field counts
/// from 0 (Sunday, also 7) and is rewritten as day names, so `0 9 * * 1-5`
/// becomes `0 0 9 * * Mon,Tue,Wed,Thu,Fri`. 6 and 7 field expressions are kept.
pub fn normalize_cron_expression(expression: &str) -> String {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    fields[4] = translate_day_of_week(&fields[4]);
    format!("0 {}", fields.join(" "))
}

/// Numeric parts become day names; names, `*` and malformed parts pass through
fn translate_day_of_week(field: &str) -> String {
    let mut days = BTreeSet::new();
    let mut verbatim = Vec::new();
    for part in field.split(',') {
        match day_of_week_part(part) {
            Some(parsed) => days.extend(parsed),
            None => verbatim.push(part),
        }
    }
    if days.is_empty() {
        return field.to_string();
    }
    days.into_iter()
        .map(|day| WEEKDAY_NAMES[day].to_string())
        .chain(verbatim.into_iter().map(str::to_string))
        .collect::<Vec<_>>()
        .join(",")
}

fn day_of_week_part(part: &str) -> Option<Vec<usize>> {
    let numeric = |c: char| c.is_ascii_digit() || matches!(c, '-' | '/' | '*');
    if part.is_empty() || !part.chars().all(numeric) {
        return None;
    }
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, step.parse::<usize>().ok().filter(|step| *step > 0)?),
        None if part == "*" => return None,
        None => (part, 1),
    };
    let (start, end) = match range.split_once('-') {
        _ if range == "*" => (0, 6),
        Some((start, end)) => (start.parse::<usize>().ok()?, end.parse::<usize>().ok()?),
        None => {
            let day = range.parse::<usize>().ok()?;
            (day, if step > 1 { 7 } else { day })
        }
    };
    if start > end || end > 7 {
        return None;
    }
    Some((start..=end).step_by(step).map(|day| day % 7).collect())
}

/// Parse and validate a cron expression (5, 6 or 7 fields)
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let normalized = normalize_cron_expression(expression);
    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an optional IANA timezone name, falling back to `default`
pub fn parse_timezone(timezone: Option<&str>, default: Tz) -> Result<Tz, ScheduleError> {
    match timezone {
        None => Ok(default),
        Some(name) => {
            Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
        }
    }
}

/// Calculate next execution time for cron schedules
pub fn calculate_cron_next_execution(
    expression: &str,
    timezone: Tz,
    end_date: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_expression(expression)?;

    let reference_in_tz = after.with_timezone(&timezone);

    let next_utc = match schedule.after(&reference_in_tz).next() {
        Some(next) => next.with_timezone(&Utc),
        None => return Ok(None),
    };

    if let Some(end) = end_date {
        if next_utc > end {
            return Ok(None);
        }
    }

    Ok(Some(next_utc))
}

/// Get the default timezone for schedules without one
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}
