//! Exclusion calendars.
//!
//! A calendar is bound to triggers by name (a weak reference, the store never cascades
//! calendar removal into triggers). Triggers skip any fire time a bound calendar excludes.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A named exclusion calendar, optionally layered on a base calendar.
///
/// A time is included only if both this calendar's rule and every base calendar
/// include it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
  pub description: Option<String>,
  pub rule: CalendarRule,
  pub base: Option<Box<Calendar>>,
}

/// The exclusion rule of a [`Calendar`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalendarRule {
  /// Excludes whole UTC dates.
  Holiday { excluded_dates: BTreeSet<NaiveDate> },
  /// Excludes whole UTC weekdays.
  Weekly { excluded_days: Vec<Weekday> },
  /// Excludes the UTC time-of-day range `[range_start, range_end]` on every day.
  /// With `invert` set, only that range is included instead.
  Daily {
    range_start: NaiveTime,
    range_end: NaiveTime,
    invert: bool,
  },
}

impl Calendar {
  pub fn new(rule: CalendarRule) -> Self {
    Self {
      description: None,
      rule,
      base: None,
    }
  }

  pub fn holidays(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
    Self::new(CalendarRule::Holiday {
      excluded_dates: dates.into_iter().collect(),
    })
  }

  pub fn weekly(excluded_days: Vec<Weekday>) -> Self {
    Self::new(CalendarRule::Weekly { excluded_days })
  }

  pub fn daily(range_start: NaiveTime, range_end: NaiveTime) -> Self {
    Self::new(CalendarRule::Daily {
      range_start,
      range_end,
      invert: false,
    })
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn with_base(mut self, base: Calendar) -> Self {
    self.base = Some(Box::new(base));
    self
  }

  /// Whether a trigger may fire at `time`.
  pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
    if let Some(base) = &self.base {
      if !base.is_time_included(time) {
        return false;
      }
    }
    match &self.rule {
      CalendarRule::Holiday { excluded_dates } => !excluded_dates.contains(&time.date_naive()),
      CalendarRule::Weekly { excluded_days } => !excluded_days.contains(&time.weekday()),
      CalendarRule::Daily {
        range_start,
        range_end,
        invert,
      } => {
        let t = time.time();
        let in_range = if range_start <= range_end {
          t >= *range_start && t <= *range_end
        } else {
          // Range wraps midnight.
          t >= *range_start || t <= *range_end
        };
        in_range == *invert
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
  }

  #[test]
  fn holiday_excludes_whole_date() {
    let cal = Calendar::holidays([NaiveDate::from_ymd_opt(2025, 12, 25).unwrap()]);
    assert!(!cal.is_time_included(at(2025, 12, 25, 9, 0)));
    assert!(cal.is_time_included(at(2025, 12, 26, 0, 0)));
  }

  #[test]
  fn weekly_excludes_weekend() {
    let cal = Calendar::weekly(vec![Weekday::Sat, Weekday::Sun]);
    // 2025-06-07 is a Saturday.
    assert!(!cal.is_time_included(at(2025, 6, 7, 12, 0)));
    assert!(cal.is_time_included(at(2025, 6, 9, 12, 0)));
  }

  #[test]
  fn daily_range_wrapping_midnight() {
    let cal = Calendar::daily(
      NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
      NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
    );
    assert!(!cal.is_time_included(at(2025, 1, 1, 23, 30)));
    assert!(!cal.is_time_included(at(2025, 1, 1, 3, 0)));
    assert!(cal.is_time_included(at(2025, 1, 1, 12, 0)));
  }

  #[test]
  fn base_calendar_is_consulted() {
    let cal = Calendar::daily(
      NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
      NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
    )
    .with_base(Calendar::weekly(vec![Weekday::Sun]));
    // 2025-06-08 is a Sunday.
    assert!(!cal.is_time_included(at(2025, 6, 8, 12, 0)));
    assert!(cal.is_time_included(at(2025, 6, 9, 12, 0)));
  }
}
