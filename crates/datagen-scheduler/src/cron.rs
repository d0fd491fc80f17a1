//! Five-field cron evaluation on top of the `cron` crate.
//!
//! The `cron` crate expects a seconds column and numbers weekdays from 1
//! (Sunday). Expressions here use classic crontab syntax, so each one is
//! rewritten before parsing: a `0` seconds field is prepended and the
//! day-of-week field is expanded into weekday names. When both day fields
//! are restricted a time matches if either one does, which is evaluated as
//! the earliest of two separate schedules.
//!
//! Schedules are matched against local wall-clock time. A wall-clock fire
//! that repeats when clocks go back runs at its first occurrence only; one
//! that falls inside a spring-forward gap runs at the first instant after
//! the gap.

use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{Result, SchedulerError};

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
/// Longest spring-forward gap searched past a nonexistent local time.
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// A parsed crontab expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedules: Vec<cron::Schedule>,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(
                expression,
                &format!(
                    "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                    fields.len()
                ),
            ));
        };

        let dow = expand_weekdays(dow).map_err(|reason| invalid(expression, &reason))?;
        let dom = if dom == "?" { "*" } else { dom };

        let variants: Vec<(&str, &str)> = if dom != "*" && dow != "*" {
            vec![(dom, "*"), ("*", dow.as_str())]
        } else {
            vec![(dom, dow.as_str())]
        };

        let schedules = variants
            .into_iter()
            .map(|(d, w)| {
                cron::Schedule::from_str(&format!("0 {minute} {hour} {d} {month} {w}"))
                    .map_err(|e| invalid(expression, &e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source: fields.join(" "),
            schedules,
        })
    }

    /// The expression with whitespace normalised.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // wall-clock time of `after`, carried in a UTC value
        let wall = Utc.from_utc_datetime(&after.with_timezone(&tz).naive_local());
        self.schedules
            .iter()
            .filter_map(|s| {
                s.after(&wall)
                    .filter_map(|t| resolve_local(tz, t.naive_utc()))
                    .find(|t| *t > after)
            })
            .min()
    }

    /// Up to `count` consecutive fire times after `after`.
    pub fn upcoming(&self, tz: Tz, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(tz, cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

/// Instant of wall-clock `local` in `tz`.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        LocalResult::None => (1..=MAX_GAP_MINUTES)
            .find_map(|m| tz.from_local_datetime(&(local + Duration::minutes(m))).earliest())
            .map(|t| t.with_timezone(&Utc)),
    }
}

fn invalid(expression: &str, reason: &str) -> SchedulerError {
    SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

/// Rewrite a crontab day-of-week field as a list of weekday names, or `*`
/// when every day is selected.
fn expand_weekdays(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }
    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step: {step}"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (weekday(a)?, weekday(b)?)
        } else {
            let day = weekday(range)?;
            // `N/step` runs from N to the end of the week.
            (day, if step.is_some() { 6.max(day) } else { day })
        };
        if start > end {
            return Err(format!("bad day-of-week range: {range}"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }
    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = days
        .iter()
        .zip(WEEKDAY_NAMES)
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
    Ok(names.join(","))
}

/// 0..=7 (both ends are Sunday) or a three-letter English name.
fn weekday(token: &str) -> std::result::Result<usize, String> {
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week out of range: {n}"))
        };
    }
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| format!("unknown day-of-week: {token}"))
}

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// Whether `expression` parses and fires at least once in the future.
pub fn validate(expression: &str) -> bool {
    CronExpr::parse(expression)
        .map(|expr| expr.next_after(Tz::UTC, Utc::now()).is_some())
        .unwrap_or(false)
}

/// Next fire time of `expression` in `tz` strictly after `after`.
pub fn next_fire_time(expression: &str, tz: Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronExpr::parse(expression)?
        .next_after(tz, after)
        .ok_or_else(|| invalid(expression, "schedule never fires"))
}

/// The next `count` fire times from now.
pub fn next_fire_times(expression: &str, tz: Tz, count: usize) -> Result<Vec<DateTime<Utc>>> {
    Ok(CronExpr::parse(expression)?.upcoming(tz, Utc::now(), count))
}

/// A canned schedule offered to users.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CronPreset {
    pub expression: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

const PRESETS: &[CronPreset] = &[
    CronPreset { expression: "* * * * *", name: "Every minute", description: "Runs every minute" },
    CronPreset { expression: "*/5 * * * *", name: "Every 5 minutes", description: "Runs every 5 minutes" },
    CronPreset { expression: "*/15 * * * *", name: "Every 15 minutes", description: "Runs every 15 minutes" },
    CronPreset { expression: "*/30 * * * *", name: "Every 30 minutes", description: "Runs every 30 minutes" },
    CronPreset { expression: "0 * * * *", name: "Hourly", description: "Runs at the top of every hour" },
    CronPreset { expression: "0 */2 * * *", name: "Every 2 hours", description: "Runs every 2 hours" },
    CronPreset { expression: "0 */6 * * *", name: "Every 6 hours", description: "Runs every 6 hours" },
    CronPreset { expression: "0 0 * * *", name: "Daily at midnight", description: "Runs every day at 00:00" },
    CronPreset { expression: "0 8 * * *", name: "Daily at 08:00", description: "Runs every day at 08:00" },
    CronPreset { expression: "0 12 * * *", name: "Daily at noon", description: "Runs every day at 12:00" },
    CronPreset { expression: "0 18 * * *", name: "Daily at 18:00", description: "Runs every day at 18:00" },
    CronPreset { expression: "0 0 * * 0", name: "Weekly on Sunday", description: "Runs every Sunday at 00:00" },
    CronPreset { expression: "0 0 * * 1", name: "Weekly on Monday", description: "Runs every Monday at 00:00" },
    CronPreset { expression: "0 0 * * 1-5", name: "Weekdays", description: "Runs Monday to Friday at 00:00" },
    CronPreset { expression: "0 0 1 * *", name: "Monthly", description: "Runs on the 1st of every month at 00:00" },
    CronPreset { expression: "0 0 1 1 *", name: "Yearly", description: "Runs every January 1st at 00:00" },
];

pub fn presets() -> &'static [CronPreset] {
    PRESETS
}

/// Human-readable text for `expression`; echoes the expression when no
/// canned description matches.
pub fn describe(expression: &str) -> String {
    let normalized = expression.split_whitespace().collect::<Vec<_>>().join(" ");
    PRESETS
        .iter()
        .find(|p| p.expression == normalized)
        .map(|p| p.description.to_string())
        .unwrap_or_else(|| format!("Cron: {normalized}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn daily_midnight_in_task_timezone() {
        let tz = parse_timezone("Asia/Shanghai").unwrap();
        // 23:59:59 in Shanghai
        let before = utc(2026, 3, 10, 15, 59, 59);
        assert_eq!(
            next_fire_time("0 0 * * *", tz, before).unwrap(),
            utc(2026, 3, 10, 16, 0, 0)
        );
        // exactly midnight rolls to the following day
        let at = utc(2026, 3, 10, 16, 0, 0);
        assert_eq!(
            next_fire_time("0 0 * * *", tz, at).unwrap(),
            utc(2026, 3, 11, 16, 0, 0)
        );
        let after = utc(2026, 3, 10, 16, 0, 1);
        assert_eq!(
            next_fire_time("0 0 * * *", tz, after).unwrap(),
            utc(2026, 3, 11, 16, 0, 0)
        );
    }

    #[test]
    fn every_five_minutes_steps() {
        let start = utc(2026, 3, 10, 9, 2, 30);
        let times = CronExpr::parse("*/5 * * * *")
            .unwrap()
            .upcoming(Tz::UTC, start, 3);
        assert_eq!(
            times,
            vec![
                utc(2026, 3, 10, 9, 5, 0),
                utc(2026, 3, 10, 9, 10, 0),
                utc(2026, 3, 10, 9, 15, 0)
            ]
        );
    }

    #[test]
    fn weekday_numbers_follow_crontab() {
        // 2026-03-08 is a Sunday
        let sunday_noon = utc(2026, 3, 8, 12, 0, 0);
        assert_eq!(
            next_fire_time("0 0 * * 1", Tz::UTC, sunday_noon).unwrap(),
            utc(2026, 3, 9, 0, 0, 0)
        );
        for sunday in ["0 0 * * 0", "0 0 * * 7", "0 0 * * sun"] {
            assert_eq!(
                next_fire_time(sunday, Tz::UTC, sunday_noon).unwrap(),
                utc(2026, 3, 15, 0, 0, 0),
                "{sunday}"
            );
        }
        let friday_noon = utc(2026, 3, 13, 12, 0, 0);
        assert_eq!(
            next_fire_time("0 0 * * 1-5", Tz::UTC, friday_noon).unwrap(),
            utc(2026, 3, 16, 0, 0, 0)
        );
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // the 13th or any Friday; 2026-03-06 is the first Friday of March
        let start = utc(2026, 3, 1, 0, 0, 0);
        assert_eq!(
            next_fire_time("0 0 13 * 5", Tz::UTC, start).unwrap(),
            utc(2026, 3, 6, 0, 0, 0)
        );
    }

    #[test]
    fn spring_forward_gap_fires_after_the_gap() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2026-03-08: 02:00 EST jumps to 03:00 EDT
        let midnight = utc(2026, 3, 8, 5, 0, 0);
        let fire = next_fire_time("30 2 * * *", tz, midnight).unwrap();
        assert_eq!(fire, utc(2026, 3, 8, 7, 0, 0));
        assert_eq!(
            next_fire_time("30 2 * * *", tz, fire).unwrap(),
            utc(2026, 3, 9, 6, 30, 0)
        );
    }

    #[test]
    fn repeated_hour_fires_once() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2026-11-01: 02:00 EDT falls back to 01:00 EST
        let midnight = utc(2026, 11, 1, 4, 0, 0);
        let first = next_fire_time("30 1 * * *", tz, midnight).unwrap();
        assert_eq!(first, utc(2026, 11, 1, 5, 30, 0));
        assert_eq!(
            next_fire_time("30 1 * * *", tz, first).unwrap(),
            utc(2026, 11, 2, 6, 30, 0)
        );
        // 01:30 EST repeats a wall time that already fired as 01:30 EDT
        let second_pass = utc(2026, 11, 1, 6, 15, 0);
        assert_eq!(
            next_fire_time("*/30 * * * *", tz, second_pass).unwrap(),
            utc(2026, 11, 1, 7, 0, 0)
        );
    }

    #[test]
    fn expand_weekdays_handles_ranges_and_steps() {
        assert_eq!(expand_weekdays("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(expand_weekdays("5-7").unwrap(), "Sun,Fri,Sat");
        assert_eq!(expand_weekdays("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(expand_weekdays("0-6").unwrap(), "*");
        assert!(expand_weekdays("8").is_err());
        assert!(expand_weekdays("5-1").is_err());
    }

    #[test]
    fn validate_rejects_bad_expressions() {
        assert!(validate("*/5 * * * *"));
        assert!(validate("0 9 * * mon-fri"));
        assert!(!validate("* * * *"));
        assert!(!validate("0 0 0 * * *"));
        assert!(!validate("61 * * * *"));
        assert!(!validate("0 25 * * *"));
        assert!(!validate("not a cron"));
        assert!(!validate(""));
    }

    #[test]
    fn invalid_cron_error_code() {
        let err = CronExpr::parse("* *").unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON");
    }

    #[test]
    fn timezone_must_be_iana() {
        assert!(parse_timezone("Europe/Berlin").is_ok());
        assert!(matches!(
            parse_timezone("Nowhere/Land"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn describe_uses_presets_then_echoes() {
        assert_eq!(describe("0  0 * * *"), "Runs every day at 00:00");
        assert_eq!(describe("0 0 * * 0"), "Runs every Sunday at 00:00");
        assert_eq!(describe("7 3 * * 2"), "Cron: 7 3 * * 2");
        assert!(presets().iter().all(|p| validate(p.expression)));
    }

    #[test]
    fn next_fire_times_are_in_the_future() {
        let now = Utc::now();
        let times = next_fire_times("* * * * *", Tz::UTC, 5).unwrap();
        assert_eq!(times.len(), 5);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert!(times[0] > now);
    }
}
