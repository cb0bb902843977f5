// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Schedule parsing: 5-field cron expressions, `@hourly`-style descriptors,
//! and `@every <duration>` intervals.
//!
//! The `cron` crate expects a seconds field, so 5-field expressions get a
//! literal `0` prepended. `@every` is parsed by hand because the crate has no
//! interval form.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// A parsed schedule.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Fixed interval, from `@every 5m`.
    Every(Duration),
    /// Cron expression or descriptor.
    Cron(Box<Schedule>),
}

impl ScheduleSpec {
    /// The next fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                Some(after + interval)
            }
            ScheduleSpec::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Parses a schedule string.
pub fn parse_schedule(expr: &str) -> Result<ScheduleSpec, String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("schedule is empty".into());
    }

    if let Some(rest) = expr.strip_prefix("@every") {
        let interval = parse_duration(rest.trim())?;
        if interval.is_zero() {
            return Err("@every interval must be positive".into());
        }
        return Ok(ScheduleSpec::Every(interval));
    }

    let normalized = if expr.starts_with('@') {
        // Descriptors like @hourly are understood by the cron crate as-is.
        expr.to_string()
    } else {
        match expr.split_whitespace().count() {
            5 => format!("0 {expr}"),
            6 | 7 => expr.to_string(),
            n => return Err(format!("expected 5 cron fields, got {n}")),
        }
    };

    Schedule::from_str(&normalized)
        .map(|s| ScheduleSpec::Cron(Box::new(s)))
        .map_err(|e| format!("invalid schedule: {e}"))
}

/// Parses durations of the form `90s`, `5m`, `1h30m`, `2d`.
fn parse_duration(text: &str) -> Result<Duration, String> {
    if text.is_empty() {
        return Err("@every requires a duration, e.g. @every 5m".into());
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("invalid duration {text:?}"));
        }
        let value: u64 = digits.parse().map_err(|_| format!("invalid duration {text:?}"))?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return Err(format!("unknown duration unit {c:?} in {text:?}")),
        };
        total += Duration::from_secs(value * unit);
    }
    if !digits.is_empty() {
        return Err(format!("duration {text:?} is missing a unit (s, m, h, d)"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_parses() {
        let spec = parse_schedule("30 9 * * 1-5").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0).unwrap(); // Monday
        let next = spec.next_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 3, 9, 30, 0).unwrap());
    }

    #[test]
    fn descriptors_parse() {
        let spec = parse_schedule("@hourly").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 8, 3, 8, 15, 0).unwrap();
        assert_eq!(
            spec.next_after(after).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 3, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn every_intervals_parse() {
        let spec = parse_schedule("@every 1h30m").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0).unwrap();
        assert_eq!(
            spec.next_after(after).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 3, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("bad").is_err());
        assert!(parse_schedule("* * *").is_err());
        assert!(parse_schedule("@every").is_err());
        assert!(parse_schedule("@every 5x").is_err());
        assert!(parse_schedule("@every 5").is_err());
    }
}
