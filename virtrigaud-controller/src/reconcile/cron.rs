//! Restricted five-field cron parser for snapshot schedules.
//!
//! Supports `*`, `*/N`, comma-separated values and single values per
//! field (minute, hour, day-of-month, month, day-of-week; Sunday = 0).
//! Ranges and names are not supported; admission already rejects
//! expressions with the wrong field count.

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

/// Furthest back `last_fire` scans: one week of minutes.
const SCAN_LIMIT_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    Values(Vec<u32>),
}

impl Field {
    fn parse(text: &str, min: u32, max: u32) -> Result<Self, String> {
        if text == "*" {
            return Ok(Field::Any);
        }
        if let Some(step) = text.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("bad step in {:?}", text))?;
            if step == 0 || step > max {
                return Err(format!("step out of range in {:?}", text));
            }
            return Ok(Field::Step(step));
        }
        let mut values = Vec::new();
        for part in text.split(',') {
            let value: u32 = part
                .parse()
                .map_err(|_| format!("bad value in {:?}", text))?;
            if value < min || value > max {
                return Err(format!("value {} out of range {}..={}", value, min, max));
            }
            values.push(value);
        }
        Ok(Field::Values(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(step) => value % step == 0,
            Field::Values(values) => values.contains(&value),
        }
    }
}

/// Parsed schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(format!(
                "expected five fields, got {} in {:?}",
                fields.len(),
                expression
            ));
        };
        Ok(Self {
            minute: Field::parse(minute, 0, 59)?,
            hour: Field::parse(hour, 0, 23)?,
            day_of_month: Field::parse(dom, 1, 31)?,
            month: Field::parse(month, 1, 12)?,
            day_of_week: Field::parse(dow, 0, 6)?,
        })
    }

    /// Whether the schedule fires at the given minute.
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }

    /// The most recent firing minute at or before `now`, within the scan
    /// window. Schedule-derived snapshots are deduplicated against this
    /// bucket timestamp.
    pub fn last_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = now.duration_trunc(Duration::minutes(1)).ok()?;
        for _ in 0..SCAN_LIMIT_MINUTES {
            if self.matches(&t) {
                return Some(t);
            }
            t -= Duration::minutes(1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_accepts_supported_forms() {
        assert!(CronSchedule::parse("* * * * *").is_ok());
        assert!(CronSchedule::parse("*/15 * * * *").is_ok());
        assert!(CronSchedule::parse("0 2 * * 0").is_ok());
        assert!(CronSchedule::parse("0,30 9,17 * * *").is_ok());

        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
    }

    #[test]
    fn test_matches() {
        let nightly = CronSchedule::parse("0 2 * * *").unwrap();
        let at_2am = Utc.with_ymd_and_hms(2025, 6, 3, 2, 0, 0).unwrap();
        let at_3am = Utc.with_ymd_and_hms(2025, 6, 3, 3, 0, 0).unwrap();
        assert!(nightly.matches(&at_2am));
        assert!(!nightly.matches(&at_3am));

        let sundays = CronSchedule::parse("0 2 * * 0").unwrap();
        let sunday = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2025, 6, 2, 2, 0, 0).unwrap();
        assert!(sundays.matches(&sunday));
        assert!(!sundays.matches(&monday));
    }

    #[test]
    fn test_last_fire_buckets() {
        let quarter_hourly = CronSchedule::parse("*/15 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 3, 10, 37, 42).unwrap();
        let fire = quarter_hourly.last_fire(now).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 6, 3, 10, 30, 0).unwrap());

        // Two instants in the same bucket agree.
        let later = Utc.with_ymd_and_hms(2025, 6, 3, 10, 44, 59).unwrap();
        assert_eq!(quarter_hourly.last_fire(later).unwrap(), fire);
    }
}
