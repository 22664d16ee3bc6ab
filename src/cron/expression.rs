//! Five-field cron expressions.
//!
//! ```text
//! ┌───────────── minute        0-59
//! │ ┌─────────── hour          0-23
//! │ │ ┌───────── day of month  1-31
//! │ │ │ ┌─────── month         1-12
//! │ │ │ │ ┌───── day of week   0-7 (0 and 7 are Sunday)
//! * * * * *
//! ```
//!
//! Each field accepts `*`, a literal, a range `a-b`, a comma separated list
//! of those, and a `/n` step on `*` or a range. A stepped literal `a/n` is
//! read as `a-max/n`.
//!
//! Day-of-month and day-of-week are combined with AND: when both are
//! restricted, a candidate must satisfy both. This differs from the POSIX
//! rule (OR when both are restricted) and is kept as-is.
//!
//! All matching is done in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

use crate::error::CronError;

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366;

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
};

/// A parsed cron expression: one sorted value set per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

impl CronExpression {
    /// Parse and validate an expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                found: fields.len(),
            });
        }

        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        // 7 is an alias for Sunday.
        for day in days_of_week.iter_mut() {
            if *day == 7 {
                *day = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
        })
    }

    /// The normalized source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the minute containing `at` matches every field.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.day_matches(at)
            && self.hours.binary_search(&at.hour()).is_ok()
            && self.minutes.binary_search(&at.minute()).is_ok()
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        self.months.binary_search(&at.month()).is_ok()
            && self.days_of_month.binary_search(&at.day()).is_ok()
            && self
                .days_of_week
                .binary_search(&at.weekday().num_days_from_sunday())
                .is_ok()
    }

    /// The earliest matching minute strictly after `after`.
    ///
    /// The search starts at the next whole minute and gives up after one
    /// year of candidates.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let start = after
            .duration_trunc(Duration::minutes(1))
            .map_err(|e| CronError::InvalidJob {
                reason: format!("cannot truncate {after}: {e}"),
            })?
            + Duration::minutes(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);

        let mut candidate = start;
        while candidate <= horizon {
            if !self.day_matches(candidate) {
                // Nothing else today can match; jump to the next midnight.
                let into_day = Duration::minutes(
                    i64::from(candidate.hour()) * 60 + i64::from(candidate.minute()),
                );
                candidate = candidate - into_day + Duration::days(1);
                continue;
            }
            if self.hours.binary_search(&candidate.hour()).is_err() {
                candidate = candidate - Duration::minutes(i64::from(candidate.minute()))
                    + Duration::hours(1);
                continue;
            }
            if self.minutes.binary_search(&candidate.minute()).is_ok() {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }

        Err(CronError::NoNextRun {
            expr: self.source.clone(),
        })
    }

    /// Iterate over upcoming matches after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>) -> Upcoming<'_> {
        Upcoming {
            expr: self,
            cursor: Some(after),
        }
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Iterator over successive matches of an expression.
pub struct Upcoming<'a> {
    expr: &'a CronExpression,
    cursor: Option<DateTime<Utc>>,
}

impl Iterator for Upcoming<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let after = self.cursor?;
        match self.expr.next_after(after) {
            Ok(next) => {
                self.cursor = Some(next);
                Some(next)
            }
            Err(_) => {
                self.cursor = None;
                None
            }
        }
    }
}

/// Validate an expression without keeping the parsed form.
pub fn validate(expr: &str) -> Result<(), CronError> {
    CronExpression::parse(expr).map(|_| ())
}

/// Compute the next run of `expr` strictly after `after`.
///
/// `timezone` is accepted for interface compatibility but not applied;
/// every computation happens in UTC.
pub fn next_run(
    expr: &str,
    after: DateTime<Utc>,
    timezone: Option<&str>,
) -> Result<DateTime<Utc>, CronError> {
    if let Some(tz) = timezone
        && !tz.eq_ignore_ascii_case("utc")
    {
        tracing::debug!(timezone = tz, "Cron timezone ignored, computing in UTC");
    }
    CronExpression::parse(expr)?.next_after(after)
}

fn parse_field(raw: &str, spec: FieldSpec) -> Result<Vec<u32>, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
        reason,
    };

    let mut values = Vec::new();
    for part in raw.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list element".to_string()));
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: i64 = step
                    .parse()
                    .map_err(|_| invalid(format!("step '{step}' is not a number")))?;
                if step <= 0 || step > i64::from(spec.max) {
                    return Err(invalid(format!(
                        "step must be between 1 and {}, got {step}",
                        spec.max
                    )));
                }
                (base, Some(step as usize))
            }
            None => (part, None),
        };

        let (start, end) = if base == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = base.split_once('-') {
            let lo = parse_value(lo, spec).map_err(invalid)?;
            let hi = parse_value(hi, spec).map_err(invalid)?;
            if lo > hi {
                return Err(invalid(format!("range {lo}-{hi} is reversed")));
            }
            (lo, hi)
        } else {
            let value = parse_value(base, spec).map_err(invalid)?;
            match step {
                Some(_) => (value, spec.max),
                None => (value, value),
            }
        };

        values.extend((start..=end).step_by(step.unwrap_or(1)));
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(invalid("matches no values".to_string()));
    }
    Ok(values)
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{value} is outside {}-{}",
            spec.min, spec.max
        ));
    }
    Ok(value)
}
