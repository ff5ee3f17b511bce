//! Business hours evaluation
//!
//! Hours are stored per weekday in the business's own timezone. A call is
//! "in hours" when its local time falls in `[open, close)` for that weekday.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::models::{BusinessProfile, DayHours, WeeklyHours};

#[derive(Error, Debug, PartialEq)]
pub enum HoursError {
    #[error("Unknown weekday: {0}")]
    UnknownDay(String),
    #[error("Invalid time range: {0}")]
    InvalidRange(String),
}

const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Is the business open at `at`?
///
/// No configured hours means always open. An unknown timezone falls back to UTC.
pub fn is_open(business: &BusinessProfile, at: DateTime<Utc>) -> bool {
    let Some(hours) = &business.hours else {
        return true;
    };

    let tz: Tz = business.timezone.parse().unwrap_or_else(|_| {
        tracing::warn!(
            "Unknown timezone '{}' for business {}, using UTC",
            business.timezone,
            business.id
        );
        Tz::UTC
    });
    let local = at.with_timezone(&tz);
    let weekday = local.weekday().num_days_from_monday() as usize;

    match hours.days[weekday] {
        Some(day) => day.contains(local.time()),
        None => false,
    }
}

impl DayHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.open <= self.close {
            time >= self.open && time < self.close
        } else {
            // Overnight range such as 22:00-02:00
            time >= self.open || time < self.close
        }
    }
}

/// Parse `mon=09:00-17:00,tue=09:00-17:00,sat=closed`.
///
/// Days left out are closed. `mon-fri=09:00-17:00` sets a run of days.
pub fn parse_weekly_hours(spec: &str) -> Result<WeeklyHours, HoursError> {
    let mut hours = WeeklyHours::default();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (days, range) = entry
            .split_once('=')
            .ok_or_else(|| HoursError::InvalidRange(entry.to_string()))?;

        let day_hours = if range.trim().eq_ignore_ascii_case("closed") {
            None
        } else {
            Some(parse_range(range.trim())?)
        };

        for day in expand_days(days.trim())? {
            hours.days[day] = day_hours;
        }
    }

    Ok(hours)
}

fn parse_range(range: &str) -> Result<DayHours, HoursError> {
    let (open, close) = range
        .split_once('-')
        .ok_or_else(|| HoursError::InvalidRange(range.to_string()))?;
    let parse = |s: &str| {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|_| HoursError::InvalidRange(range.to_string()))
    };
    Ok(DayHours {
        open: parse(open)?,
        close: parse(close)?,
    })
}

fn day_index(name: &str) -> Result<usize, HoursError> {
    let lower = name.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|d| lower.starts_with(d))
        .ok_or(HoursError::UnknownDay(name.to_string()))
}

fn expand_days(days: &str) -> Result<Vec<usize>, HoursError> {
    match days.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (day_index(start)?, day_index(end)?);
            if start <= end {
                Ok((start..=end).collect())
            } else {
                Ok((start..7).chain(0..=end).collect())
            }
        }
        None => Ok(vec![day_index(days)?]),
    }
}

/// Short human description used in the model prompt.
pub fn describe(business: &BusinessProfile) -> String {
    let Some(hours) = &business.hours else {
        return "Open 24 hours, every day".to_string();
    };

    let days: Vec<String> = DAY_NAMES
        .iter()
        .zip(hours.days.iter())
        .map(|(name, day)| match day {
            Some(d) => format!("{} {}-{}", name, d.open.format("%H:%M"), d.close.format("%H:%M")),
            None => format!("{} closed", name),
        })
        .collect();

    format!("{} ({})", days.join(", "), business.timezone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn business(hours: Option<WeeklyHours>, timezone: &str) -> BusinessProfile {
        BusinessProfile {
            id: 1,
            name: "Acme Plumbing".to_string(),
            phone_number: "+15550001111".to_string(),
            personality: "friendly".to_string(),
            timezone: timezone.to_string(),
            hours,
            forwarding_number: None,
            greeting: None,
            voicemail_prompt: None,
            auto_response_enabled: false,
        }
    }

    #[test]
    fn test_parse_weekday_run() {
        let hours = parse_weekly_hours("mon-fri=09:00-17:00").unwrap();
        for day in 0..5 {
            assert!(hours.days[day].is_some());
        }
        assert!(hours.days[5].is_none());
        assert!(hours.days[6].is_none());
    }

    #[test]
    fn test_parse_closed_and_errors() {
        let hours = parse_weekly_hours("mon-sun=08:00-20:00, sun=closed").unwrap();
        assert!(hours.days[6].is_none());
        assert!(hours.days[0].is_some());

        assert_eq!(
            parse_weekly_hours("funday=09:00-17:00"),
            Err(HoursError::UnknownDay("funday".to_string()))
        );
        assert!(parse_weekly_hours("mon=9am").is_err());
    }

    #[test]
    fn test_open_respects_timezone() {
        let hours = parse_weekly_hours("mon-fri=09:00-17:00").unwrap();
        let b = business(Some(hours), "America/New_York");

        // Wednesday 2024-01-10 15:00 UTC = 10:00 in New York
        let during = Utc.with_ymd_and_hms(2024, 1, 10, 15, 0, 0).unwrap();
        assert!(is_open(&b, during));

        // Wednesday 2024-01-10 23:00 UTC = 18:00 in New York
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 23, 0, 0).unwrap();
        assert!(!is_open(&b, after));

        // Saturday
        let weekend = Utc.with_ymd_and_hms(2024, 1, 13, 15, 0, 0).unwrap();
        assert!(!is_open(&b, weekend));
    }

    #[test]
    fn test_no_hours_is_always_open() {
        let b = business(None, "UTC");
        assert!(is_open(&b, Utc::now()));
    }

    #[test]
    fn test_overnight_range() {
        let day = DayHours {
            open: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            close: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        };
        assert!(day.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(day.contains(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(!day.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }
}
