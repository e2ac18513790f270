// Fire-time calculation for all schedule types: OneShot, Interval and Cron
//
// Every calculation is pure: the same schedule and reference instant always
// produce the same answer, and the answer is strictly after the reference.

use crate::errors::ScheduleError;
use crate::models::{RepeatCount, Schedule};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// ScheduleTrigger defines how a schedule produces its fire times
pub trait ScheduleTrigger {
    /// Earliest fire time strictly after `after`, or `None` once the schedule is exhausted
    fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Fire time a newly registered trigger starts from.
    ///
    /// Anchored at the schedule's own start (or `now` for a cron schedule
    /// without one), so a start in the past yields a past fire time.
    fn first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Reject schedules that cannot be evaluated at all
    fn validate(&self) -> Result<(), ScheduleError>;
}

impl ScheduleTrigger for Schedule {
    fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::OneShot { at } => (*at > after).then_some(*at),

            Schedule::Interval {
                start,
                every,
                repeat,
            } => next_interval_fire_time(*start, *every, *repeat, after),

            Schedule::Cron {
                expression,
                timezone,
                start,
                end,
            } => {
                let mut from = after;
                if let Some(start) = start {
                    let before_start = *start - Duration::nanoseconds(1);
                    if from < before_start {
                        from = before_start;
                    }
                }

                let next = expression
                    .next_after(&from.with_timezone(timezone))?
                    .with_timezone(&Utc);

                match end {
                    Some(end) if next > *end => None,
                    _ => Some(next),
                }
            }
        }
    }

    fn first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let anchor = match self {
            Schedule::OneShot { at } => *at,
            Schedule::Interval { start, .. } => *start,
            Schedule::Cron { start, .. } => start.unwrap_or(now),
        };
        self.next_fire_time(anchor - Duration::nanoseconds(1))
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::OneShot { .. } => Ok(()),

            Schedule::Interval { every, .. } => {
                if every.is_zero() {
                    return Err(ScheduleError::InvalidConfiguration(
                        "interval must be greater than zero".to_string(),
                    ));
                }
                Duration::from_std(*every).map_err(|_| {
                    ScheduleError::InvalidConfiguration(format!(
                        "interval {:?} is out of range",
                        every
                    ))
                })?;
                Ok(())
            }

            Schedule::Cron {
                start: Some(start),
                end: Some(end),
                ..
            } if end < start => Err(ScheduleError::InvalidConfiguration(format!(
                "cron end {} is before start {}",
                end, start
            ))),

            Schedule::Cron { .. } => Ok(()),
        }
    }
}

/// `start + k * every` for the smallest `k` with a result after `after`
fn next_interval_fire_time(
    start: DateTime<Utc>,
    every: std::time::Duration,
    repeat: RepeatCount,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let every_nanos = every.as_nanos();
    if every_nanos == 0 {
        return None;
    }

    let k: u128 = if after < start {
        0
    } else {
        let elapsed = (after - start).num_nanoseconds()? as u128;
        elapsed / every_nanos + 1
    };

    if let RepeatCount::Times(n) = repeat {
        if k > n as u128 {
            return None;
        }
    }

    let offset = i64::try_from(k.checked_mul(every_nanos)?).ok()?;
    start.checked_add_signed(Duration::nanoseconds(offset))
}

/// Time zone used by cron schedules that do not name one
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

/// Resolve an IANA time zone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}
