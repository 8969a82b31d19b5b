//! Five-field crontab predicates built from a row's crontab columns.
//!
//! Column semantics follow classic crontab: `*` or an empty column means
//! "any", day-of-week counts 0-6 from Sunday (7 is also Sunday). Expressions
//! are evaluated in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use super::task_config::TaskConfigError;

#[derive(Debug, Clone)]
pub struct Crontab {
    minute: String,
    hour: String,
    day_of_week: String,
    day_of_month: String,
    month_of_year: String,
    schedule: CronSchedule,
}

impl Crontab {
    pub fn new(
        minute: Option<&str>,
        hour: Option<&str>,
        day_of_week: Option<&str>,
        day_of_month: Option<&str>,
        month_of_year: Option<&str>,
    ) -> Result<Self, TaskConfigError> {
        let field = |v: Option<&str>| {
            v.map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or("*")
                .to_string()
        };
        let (minute, hour, day_of_week, day_of_month, month_of_year) = (
            field(minute),
            field(hour),
            field(day_of_week),
            field(day_of_month),
            field(month_of_year),
        );

        // The cron crate wants a leading seconds field and named weekdays.
        let dow = translate_day_of_week(&day_of_week).map_err(|reason| {
            TaskConfigError::InvalidCrontab {
                expr: day_of_week.clone(),
                reason,
            }
        })?;
        let expr = format!("0 {minute} {hour} {day_of_month} {month_of_year} {dow}");
        let schedule =
            CronSchedule::from_str(&expr).map_err(|e| TaskConfigError::InvalidCrontab {
                expr: format!("{minute} {hour} {day_of_month} {month_of_year} {day_of_week}"),
                reason: e.to_string(),
            })?;

        Ok(Self {
            minute,
            hour,
            day_of_week,
            day_of_month,
            month_of_year,
            schedule,
        })
    }

    /// Parse a conventional `min hour dom month dow` expression.
    pub fn parse(expr: &str) -> Result<Self, TaskConfigError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = parts[..] else {
            return Err(TaskConfigError::InvalidCrontab {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", parts.len()),
            });
        };
        Self::new(Some(minute), Some(hour), Some(dow), Some(dom), Some(month))
    }

    /// The first firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn minute(&self) -> &str {
        &self.minute
    }

    pub fn hour(&self) -> &str {
        &self.hour
    }

    pub fn day_of_week(&self) -> &str {
        &self.day_of_week
    }

    pub fn day_of_month(&self) -> &str {
        &self.day_of_month
    }

    pub fn month_of_year(&self) -> &str {
        &self.month_of_year
    }
}

impl PartialEq for Crontab {
    fn eq(&self, other: &Self) -> bool {
        self.minute == other.minute
            && self.hour == other.hour
            && self.day_of_week == other.day_of_week
            && self.day_of_month == other.day_of_month
            && self.month_of_year == other.month_of_year
    }
}

impl std::fmt::Display for Crontab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month_of_year, self.day_of_week
        )
    }
}

impl serde::Serialize for Crontab {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Rewrite numeric weekdays (0-7, Sunday first) as names; step values and
/// names already present pass through untouched.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let name = |token: &str| -> Result<String, String> {
        match token.parse::<usize>() {
            Ok(n) if n < WEEKDAYS.len() => Ok(WEEKDAYS[n].to_string()),
            Ok(n) => Err(format!("day of week {n} out of range 0-7")),
            Err(_) => Ok(token.to_string()),
        }
    };

    field
        .split(',')
        .map(|part| {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (part, None),
            };
            let base = match base.split_once('-') {
                Some((start, end)) => format!("{}-{}", name(start)?, name(end)?),
                None => name(base)?,
            };
            Ok(match step {
                Some(step) => format!("{base}/{step}"),
                None => base,
            })
        })
        .collect::<Result<Vec<_>, String>>()
        .map(|parts| parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_defaults_to_any() {
        let tab = Crontab::new(Some("30"), None, None, Some(""), None).unwrap();
        assert_eq!(tab.to_string(), "30 * * * *");
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(
            tab.next_after(start),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_numeric_weekdays_are_sunday_based() {
        // 2024-01-01 is a Monday.
        let tab = Crontab::parse("0 9 * * 0").unwrap();
        let next = tab
            .next_after(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 9);

        let weekdays = Crontab::parse("0 9 * * 1-5").unwrap();
        let next = weekdays
            .next_after(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap())
            .unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_translate_day_of_week() {
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
        assert_eq!(translate_day_of_week("0,6").unwrap(), "SUN,SAT");
        assert_eq!(translate_day_of_week("1-5/2").unwrap(), "MON-FRI/2");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "*/2");
        assert!(translate_day_of_week("9").is_err());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(Crontab::parse("61 * * * *").is_err());
        assert!(Crontab::parse("* * *").is_err());
    }

    #[test]
    fn test_equality_ignores_compiled_form() {
        assert_eq!(
            Crontab::parse("*/5 * * * *").unwrap(),
            Crontab::new(Some("*/5"), None, None, None, None).unwrap()
        );
    }
}
