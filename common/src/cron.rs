// Cron expression parsing and next-match search
//
// Supported layouts:
// - 5 fields: minute hour day-of-month month day-of-week (seconds fixed at 0,
//   day-of-week 0-7 with 0 and 7 = Sunday)
// - 6 fields: second minute hour day-of-month month day-of-week
// - 7 fields: the 6-field layout followed by a year (1970-2099)
//
// The 6 and 7 field layouts number days of the week 1-7 with 1 = Sunday.
// Day-of-month and day-of-week are OR-combined when both are restricted.

use crate::errors::ScheduleError;
use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A cron expression with no match within this many years never fires
pub const SEARCH_HORIZON_YEARS: u32 = 5;

const MIN_YEAR: u32 = 1970;
const MAX_YEAR: u32 = 2099;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Offsets are assumed constant over a window this long unless a change is found at its end
const PROBE_WINDOW_DAYS: i64 = 7;

/// Bit set over small field values (seconds, minutes, hours, days, months, weekdays)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn from_values(values: impl IntoIterator<Item = u32>) -> Self {
        FieldSet(values.into_iter().fold(0u64, |bits, v| bits | (1u64 << v)))
    }

    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    /// Smallest member greater than or equal to `value`
    fn next_from(self, value: u32) -> Option<u32> {
        if value >= 64 {
            return None;
        }
        let masked = self.0 & (u64::MAX << value);
        (masked != 0).then(|| masked.trailing_zeros())
    }
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    first_name_value: u32,
    allows_question_mark: bool,
}

const SECONDS: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: &[],
    first_name_value: 0,
    allows_question_mark: false,
};

const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    ..SECONDS
};

const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    max: 23,
    ..SECONDS
};

const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    first_name_value: 0,
    allows_question_mark: true,
};

const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    first_name_value: 1,
    allows_question_mark: false,
};

// Unix numbering, folded to 0-6 after parsing
const UNIX_DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: DAY_NAMES,
    first_name_value: 0,
    allows_question_mark: true,
};

// 6/7-field numbering (1 = Sunday), shifted to 0-6 after parsing
const EXTENDED_DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 1,
    max: 7,
    names: DAY_NAMES,
    first_name_value: 1,
    allows_question_mark: true,
};

const YEARS: FieldSpec = FieldSpec {
    name: "year",
    min: MIN_YEAR,
    max: MAX_YEAR,
    names: &[],
    first_name_value: 0,
    allows_question_mark: false,
};

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    /// 0 = Sunday
    days_of_week: FieldSet,
    years: Option<BTreeSet<i32>>,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

impl CronExpression {
    /// Parse and validate a cron expression
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 0 1 1 ?",
            "@monthly" => "0 0 0 1 * ?",
            "@weekly" => "0 0 0 ? * SUN",
            "@daily" | "@midnight" => "0 0 0 * * ?",
            "@hourly" => "0 0 * * * ?",
            other if other.starts_with('@') => {
                return Err(invalid(format!("unknown macro '{}'", trimmed)))
            }
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (second, rest, dow_spec) = match fields.len() {
            5 => ("0", &fields[..], &UNIX_DAYS_OF_WEEK),
            6 | 7 => (fields[0], &fields[1..], &EXTENDED_DAYS_OF_WEEK),
            n => {
                return Err(invalid(format!(
                    "expected 5, 6 or 7 fields, found {}",
                    n
                )))
            }
        };

        let seconds = FieldSet::from_values(parse_field(second, &SECONDS).map_err(invalid)?);
        let minutes = FieldSet::from_values(parse_field(rest[0], &MINUTES).map_err(invalid)?);
        let hours = FieldSet::from_values(parse_field(rest[1], &HOURS).map_err(invalid)?);
        let days_of_month =
            FieldSet::from_values(parse_field(rest[2], &DAYS_OF_MONTH).map_err(invalid)?);
        let months = FieldSet::from_values(parse_field(rest[3], &MONTHS).map_err(invalid)?);

        let weekday_values = parse_field(rest[4], dow_spec).map_err(invalid)?;
        let days_of_week = FieldSet::from_values(weekday_values.into_iter().map(|day| {
            if dow_spec.min == 1 {
                day - 1
            } else {
                day % 7
            }
        }));

        let years = match rest.get(5) {
            Some(field) => Some(
                parse_field(field, &YEARS)
                    .map_err(invalid)?
                    .into_iter()
                    .map(|year| year as i32)
                    .collect(),
            ),
            None => None,
        };

        Ok(Self {
            source: trimmed.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            years,
            day_of_month_restricted: is_restricted(rest[2]),
            day_of_week_restricted: is_restricted(rest[4]),
        })
    }

    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Earliest instant strictly after `after` whose wall-clock time in
    /// `after`'s time zone matches the expression.
    ///
    /// Daylight-saving handling follows classic cron: across a backward
    /// shift, expressions that fire every hour keep firing through the
    /// repeated wall-clock window while the others fire only on its first
    /// pass; across a forward shift, a fire that falls into the skipped
    /// window happens at the shift instant, unless the expression fires
    /// every hour anyway.
    ///
    /// Returns `None` when nothing matches within `SEARCH_HORIZON_YEARS`.
    pub fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        let tz = after.timezone();
        let horizon = after
            .naive_utc()
            .date()
            .checked_add_months(Months::new(12 * SEARCH_HORIZON_YEARS))?;

        let mut cursor = after.naive_utc();
        let mut inclusive = false;
        let mut replay_until = self.replay_window_end(&tz, cursor);

        loop {
            if cursor.date() > horizon {
                return None;
            }

            let offset = utc_offset(&tz, cursor);
            let probe_end = cursor
                .checked_add_signed(Duration::days(PROBE_WINDOW_DAYS))?
                .with_nanosecond(0)?;
            let segment_end = offset_change(&tz, cursor, probe_end, offset).unwrap_or(probe_end);
            let segment_end_local = segment_end.checked_add_signed(offset)?;

            let local = cursor.checked_add_signed(offset)?;
            let mut from = if inclusive {
                local.checked_sub_signed(Duration::seconds(1))?
            } else {
                local
            };
            if let Some(replay_end) = replay_until {
                let replay_from = replay_end.checked_sub_signed(Duration::seconds(1))?;
                if !self.fires_every_hour() && from < replay_from {
                    from = replay_from;
                }
            }

            if let Some(candidate) = self.next_local(from, segment_end_local.date()) {
                if candidate < segment_end_local {
                    let instant = candidate.checked_sub_signed(offset)?;
                    return Some(tz.from_utc_datetime(&instant));
                }
            }

            let next_offset = utc_offset(&tz, segment_end);
            if next_offset < offset {
                // wall clock moves back: [end + next_offset, end + offset) is replayed
                replay_until = Some(segment_end_local);
            } else if next_offset > offset && !self.fires_every_hour() {
                // wall clock jumps forward over [end + offset, end + next_offset)
                let gap_end = segment_end.checked_add_signed(next_offset)?;
                let in_gap = self
                    .next_local(
                        segment_end_local.checked_sub_signed(Duration::seconds(1))?,
                        gap_end.date(),
                    )
                    .is_some_and(|candidate| candidate < gap_end);
                if in_gap {
                    return Some(tz.from_utc_datetime(&segment_end));
                }
            }

            cursor = segment_end;
            inclusive = true;
        }
    }

    /// Earliest wall-clock time strictly after `after` (truncated to the
    /// second) that matches, searching no further than `limit`.
    fn next_local(&self, after: NaiveDateTime, limit: NaiveDate) -> Option<NaiveDateTime> {
        let mut t = after
            .with_nanosecond(0)?
            .checked_add_signed(Duration::seconds(1))?;

        loop {
            let date = t.date();
            if date > limit {
                return None;
            }

            if let Some(years) = &self.years {
                if !years.contains(&date.year()) {
                    let next_year = *years.range(date.year() + 1..).next()?;
                    t = NaiveDate::from_ymd_opt(next_year, 1, 1)?.and_hms_opt(0, 0, 0)?;
                    continue;
                }
            }

            if !self.months.contains(date.month()) {
                t = first_of_next_month(date)?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.day_matches(date) {
                t = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            let Some(hour) = self.hours.next_from(t.hour()) else {
                t = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            };
            if hour != t.hour() {
                t = date.and_hms_opt(hour, 0, 0)?;
            }

            let Some(minute) = self.minutes.next_from(t.minute()) else {
                t = date
                    .and_hms_opt(hour, 0, 0)?
                    .checked_add_signed(Duration::hours(1))?;
                continue;
            };
            if minute != t.minute() {
                t = date.and_hms_opt(hour, minute, 0)?;
            }

            let Some(second) = self.seconds.next_from(t.second()) else {
                t = date
                    .and_hms_opt(hour, minute, 0)?
                    .checked_add_signed(Duration::minutes(1))?;
                continue;
            };
            return date.and_hms_opt(hour, minute, second);
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let by_month = self.days_of_month.contains(date.day());
        let by_week = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        match (self.day_of_month_restricted, self.day_of_week_restricted) {
            (true, true) => by_month || by_week,
            (true, false) => by_month,
            (false, true) => by_week,
            (false, false) => true,
        }
    }

    fn fires_every_hour(&self) -> bool {
        self.hours.0 == (1u64 << 24) - 1
    }

    /// When `cursor` falls inside a wall-clock window that is being replayed
    /// after a backward offset shift, returns the local time that ends it.
    fn replay_window_end<Z: TimeZone>(&self, tz: &Z, cursor: NaiveDateTime) -> Option<NaiveDateTime> {
        let lookback = cursor.checked_sub_signed(Duration::days(1))?;
        let earlier_offset = utc_offset(tz, lookback);
        let shift = offset_change(tz, lookback, cursor, earlier_offset)?;
        if utc_offset(tz, shift) >= earlier_offset {
            return None;
        }
        let replay_end = shift.checked_add_signed(earlier_offset)?;
        let local = cursor.checked_add_signed(utc_offset(tz, cursor))?;
        (local < replay_end).then_some(replay_end)
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for CronExpression {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronExpression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        CronExpression::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

/// Offset of `tz` at the UTC instant `at`, as a signed duration
fn utc_offset<Z: TimeZone>(tz: &Z, at: NaiveDateTime) -> Duration {
    Duration::seconds(tz.offset_from_utc_datetime(&at).fix().local_minus_utc() as i64)
}

/// First instant in `(from, to]` whose offset differs from `offset`, found by
/// bisection at one-second resolution. Offset changes are assumed to happen
/// at most once in the window.
fn offset_change<Z: TimeZone>(
    tz: &Z,
    from: NaiveDateTime,
    to: NaiveDateTime,
    offset: Duration,
) -> Option<NaiveDateTime> {
    if utc_offset(tz, to) == offset {
        return None;
    }

    let base = from.with_nanosecond(0)?;
    let mut low = 0i64;
    let mut high = (to - base).num_seconds();
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if utc_offset(tz, base + Duration::seconds(mid)) == offset {
            low = mid;
        } else {
            high = mid;
        }
    }
    base.checked_add_signed(Duration::seconds(high))
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// Expand one cron field into the values it selects
fn parse_field(text: &str, spec: &FieldSpec) -> Result<Vec<u32>, String> {
    if text == "?" {
        if !spec.allows_question_mark {
            return Err(format!("'?' is not allowed in the {} field", spec.name));
        }
        return Ok((spec.min..=spec.max).collect());
    }

    let mut values = Vec::new();
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in the {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in the {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in the {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if low > high {
            return Err(format!(
                "range {}-{} is reversed in the {} field",
                low, high, spec.name
            ));
        }

        values.extend((low..=high).step_by(step.unwrap_or(1) as usize));
    }

    Ok(values)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match token.parse::<u32>() {
        Ok(value) => value,
        Err(_) => {
            let upper = token.to_ascii_uppercase();
            spec.names
                .iter()
                .position(|name| *name == upper)
                .map(|index| index as u32 + spec.first_name_value)
                .ok_or_else(|| format!("invalid {} value '{}'", spec.name, token))?
        }
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} value {} is outside {}-{}",
            spec.name, value, spec.min, spec.max
        ));
    }
    Ok(value)
}
