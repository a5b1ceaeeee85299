//! Triggers: rules computing when a job fires next.
//!
//! Every trigger obeys the same contract: `next_fire(after)` is either `None`
//! (exhausted) or strictly later than `after`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Cron evaluation scans at most one year of minutes.
pub const CRON_SCAN_LIMIT: u32 = 525_600;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// When and how often a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire exactly once at `at`.
    Once { at: DateTime<Utc> },
    /// Fire at `start + n * period`, never after `end`.
    Interval {
        #[serde(rename = "period_ms", with = "frost_resilience::millis")]
        period: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<DateTime<Utc>>,
    },
    /// Fire on every minute matching a 5-field cron expression (UTC).
    Cron { expression: CronExpr },
}

impl Trigger {
    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    /// Unbounded interval anchored at schedule time.
    pub fn every(period: Duration) -> Self {
        Self::Interval {
            period,
            start: None,
            end: None,
        }
    }

    pub fn interval(
        period: Duration,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self::Interval { period, start, end }
    }

    pub fn cron(expression: &str) -> Result<Self, SchedulerError> {
        Ok(Self::Cron {
            expression: expression.parse()?,
        })
    }

    /// Reject malformed parameters.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Self::Once { .. } | Self::Cron { .. } => Ok(()),
            Self::Interval { period, start, end } => {
                if period.is_zero() {
                    return Err(SchedulerError::InvalidTrigger(
                        "interval period must be greater than zero".to_string(),
                    ));
                }
                if TimeDelta::from_std(*period).is_err() {
                    return Err(SchedulerError::InvalidTrigger(format!(
                        "interval period out of range: {period:?}"
                    )));
                }
                if let (Some(start), Some(end)) = (start, end) {
                    if end < start {
                        return Err(SchedulerError::InvalidTrigger(format!(
                            "interval ends ({end}) before it starts ({start})"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Pin an unanchored interval to `now`.
    pub fn anchored(self, now: DateTime<Utc>) -> Self {
        match self {
            Self::Interval {
                period,
                start: None,
                end,
            } => Self::Interval {
                period,
                start: Some(now),
                end,
            },
            other => other,
        }
    }

    /// The next fire time strictly after `after`, or `None` when exhausted.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once { at } => (*at > after).then_some(*at),
            Self::Interval { period, start, end } => interval_next(*period, *start, *end, after),
            Self::Cron { expression } => expression.next_after(after),
        }
    }

    /// First fire time for a freshly scheduled job.
    ///
    /// A one-shot whose time has already passed fires immediately; every
    /// other trigger uses `next_fire(now)`.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once { at } => Some(*at),
            _ => self.next_fire(now),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once { at } => write!(f, "once at {at}"),
            Self::Interval { period, .. } => write!(f, "every {period:?}"),
            Self::Cron { expression } => write!(f, "cron '{expression}'"),
        }
    }
}

fn interval_next(
    period: Duration,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let period_ns = i128::try_from(period.as_nanos()).ok()?;
    if period_ns == 0 {
        return None;
    }
    let start = start.unwrap_or(after);

    let candidate = if start > after {
        start
    } else {
        let elapsed = after.signed_duration_since(start);
        let elapsed_ns =
            i128::from(elapsed.num_seconds()) * NANOS_PER_SEC + i128::from(elapsed.subsec_nanos());
        let offset = (elapsed_ns / period_ns + 1) * period_ns;
        let secs = i64::try_from(offset / NANOS_PER_SEC).ok()?;
        let nanos = i64::try_from(offset % NANOS_PER_SEC).ok()?;
        let delta = TimeDelta::try_seconds(secs)?.checked_add(&TimeDelta::nanoseconds(nanos))?;
        start.checked_add_signed(delta)?
    };

    match end {
        Some(end) if candidate > end => None,
        _ => Some(candidate),
    }
}

/// A parsed 5-field cron expression: minute, hour, day of month, month, day of week.
///
/// Fields accept `*`, `n`, `a-b`, `*/n`, `a-b/n`, `a/n` and comma lists.
/// Months and weekdays also accept three-letter names, and weekday `7` is
/// Sunday. When both day fields are restricted a day matches if either does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

struct FieldSpec {
    label: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    label: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    label: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    label: "day of month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    label: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    label: "day of week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
};

impl FieldSpec {
    fn value(&self, token: &str) -> Result<u32, SchedulerError> {
        let lower = token.to_ascii_lowercase();
        if let Some(index) = self.names.iter().position(|n| *n == lower) {
            // Month names start at 1, weekday names at 0.
            return Ok(index as u32 + self.min);
        }
        let value: u32 = token.parse().map_err(|_| self.error(token, "not a number"))?;
        if value < self.min || value > self.max {
            return Err(self.error(
                token,
                &format!("out of range {}-{}", self.min, self.max),
            ));
        }
        Ok(value)
    }

    fn error(&self, token: &str, reason: &str) -> SchedulerError {
        SchedulerError::InvalidTrigger(format!("{} field '{token}': {reason}", self.label))
    }

    /// Parse one field into a bitmask of allowed values.
    fn parse(&self, field: &str) -> Result<u64, SchedulerError> {
        let mut mask = 0u64;
        for part in field.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.error(part, "step is not a number"))?;
                    if step == 0 {
                        return Err(self.error(part, "step must be at least 1"));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (low, high) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (self.value(a)?, self.value(b)?);
                if a > b {
                    return Err(self.error(part, "range start is after its end"));
                }
                (a, b)
            } else {
                let a = self.value(range)?;
                // `a/n` runs from a to the end of the field.
                (a, if step.is_some() { self.max } else { a })
            };

            let step = step.unwrap_or(1) as usize;
            for value in (low..=high).step_by(step) {
                mask |= 1u64 << value;
            }
        }
        Ok(mask)
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

impl CronExpr {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `t` (truncated to the minute) matches.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        if !has(self.minutes, t.minute())
            || !has(self.hours, t.hour())
            || !has(self.months, t.month())
        {
            return false;
        }
        let dom = has(self.days, t.day());
        let dow = has(self.weekdays, t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Scan forward minute by minute, for at most [`CRON_SCAN_LIMIT`] minutes.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after.with_nanosecond(0)?.with_second(0)? + TimeDelta::minutes(1);
        for _ in 0..CRON_SCAN_LIMIT {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += TimeDelta::minutes(1);
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = SchedulerError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let source = expression.trim().to_string();
        let expanded = match source.as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(SchedulerError::InvalidTrigger(format!(
                "cron expression '{source}' needs 5 fields (minute hour day month weekday), got {}",
                fields.len()
            )));
        };

        let mut weekdays = DAY_OF_WEEK.parse(dow)?;
        if has(weekdays, 7) {
            weekdays = (weekdays & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            minutes: MINUTE.parse(minute)?,
            hours: HOUR.parse(hour)?,
            days: DAY_OF_MONTH.parse(dom)?,
            months: MONTH.parse(month)?,
            weekdays,
            dom_restricted: !dom.starts_with('*'),
            dow_restricted: !dow.starts_with('*'),
            source,
        })
    }
}

impl TryFrom<String> for CronExpr {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CronExpr> for String {
    fn from(expr: CronExpr) -> Self {
        expr.source
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
