use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, NaiveTime, Utc, Weekday};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Repeat count meaning "repeat until the end time, forever if there is none".
pub const REPEAT_INDEFINITELY: i32 = -1;

/// Unit for [`TriggerSchedule::CalendarInterval`] and [`TriggerSchedule::DailyTimeInterval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalUnit {
  Second,
  Minute,
  Hour,
  Day,
  Week,
  Month,
  Year,
}

impl IntervalUnit {
  /// Length of one unit when it has a fixed length in UTC.
  fn fixed_millis(self) -> Option<i64> {
    match self {
      IntervalUnit::Second => Some(1_000),
      IntervalUnit::Minute => Some(60_000),
      IntervalUnit::Hour => Some(3_600_000),
      IntervalUnit::Day => Some(86_400_000),
      IntervalUnit::Week => Some(604_800_000),
      IntervalUnit::Month | IntervalUnit::Year => None,
    }
  }

  fn months(self) -> u32 {
    match self {
      IntervalUnit::Year => 12,
      _ => 1,
    }
  }
}

/// The per-variant schedule parameters of a trigger.
///
/// All arithmetic is in UTC. The store never interprets these itself, it only asks
/// the trigger for its next fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriggerSchedule {
  /// Fire at `start_time`, then `repeat_count` more times every `repeat_interval`.
  Simple {
    repeat_count: i32,
    repeat_interval: StdDuration,
    times_triggered: i32,
  },
  /// Fire on a cron expression (seconds-resolution, `cron` crate syntax).
  Cron { expression: String },
  /// Fire every `interval` calendar units after `start_time`.
  CalendarInterval {
    interval: u32,
    unit: IntervalUnit,
    times_triggered: i32,
  },
  /// Fire every `interval` units inside a daily time-of-day window on selected weekdays.
  DailyTimeInterval {
    interval: u32,
    unit: IntervalUnit,
    days_of_week: Vec<Weekday>,
    start_time_of_day: NaiveTime,
    end_time_of_day: NaiveTime,
    repeat_count: i32,
    times_triggered: i32,
  },
}

impl TriggerSchedule {
  /// Fires exactly once, at the trigger's start time.
  pub fn once() -> Self {
    Self::simple(StdDuration::ZERO, 0)
  }

  pub fn simple(repeat_interval: StdDuration, repeat_count: i32) -> Self {
    TriggerSchedule::Simple {
      repeat_count,
      repeat_interval,
      times_triggered: 0,
    }
  }

  pub fn repeat_forever(repeat_interval: StdDuration) -> Self {
    Self::simple(repeat_interval, REPEAT_INDEFINITELY)
  }

  pub fn cron(expression: impl Into<String>) -> Self {
    TriggerSchedule::Cron {
      expression: expression.into(),
    }
  }

  pub fn calendar_interval(interval: u32, unit: IntervalUnit) -> Self {
    TriggerSchedule::CalendarInterval {
      interval,
      unit,
      times_triggered: 0,
    }
  }

  /// Daily window on every day of the week, repeating indefinitely.
  pub fn daily_time_interval(
    interval: u32,
    unit: IntervalUnit,
    start_time_of_day: NaiveTime,
    end_time_of_day: NaiveTime,
  ) -> Self {
    TriggerSchedule::DailyTimeInterval {
      interval,
      unit,
      days_of_week: vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
      ],
      start_time_of_day,
      end_time_of_day,
      repeat_count: REPEAT_INDEFINITELY,
      times_triggered: 0,
    }
  }

  /// Checks the parameters, returning a description of the first problem found.
  pub fn validate(&self) -> Result<(), String> {
    match self {
      TriggerSchedule::Simple {
        repeat_count,
        repeat_interval,
        ..
      } => {
        if *repeat_count < REPEAT_INDEFINITELY {
          return Err(format!("Repeat count must be >= 0 or -1, was {}", repeat_count));
        }
        if *repeat_count != 0 && repeat_interval.is_zero() {
          return Err("Repeat interval must be > 0 for a repeating trigger".to_string());
        }
        Ok(())
      }
      TriggerSchedule::Cron { expression } => CronSchedule::from_str(expression)
        .map(|_| ())
        .map_err(|e| format!("Invalid cron expression '{}': {}", expression, e)),
      TriggerSchedule::CalendarInterval { interval, .. } => {
        if *interval == 0 {
          return Err("Repeat interval must be >= 1".to_string());
        }
        Ok(())
      }
      TriggerSchedule::DailyTimeInterval {
        interval,
        unit,
        days_of_week,
        start_time_of_day,
        end_time_of_day,
        repeat_count,
        ..
      } => {
        if *interval == 0 {
          return Err("Repeat interval must be >= 1".to_string());
        }
        if !matches!(
          unit,
          IntervalUnit::Second | IntervalUnit::Minute | IntervalUnit::Hour
        ) {
          return Err(format!("Invalid repeat unit {:?}, must be Second, Minute or Hour", unit));
        }
        if days_of_week.is_empty() {
          return Err("Days of week must not be empty".to_string());
        }
        if start_time_of_day >= end_time_of_day {
          return Err("Start time of day must be before end time of day".to_string());
        }
        if *repeat_count < REPEAT_INDEFINITELY {
          return Err(format!("Repeat count must be >= 0 or -1, was {}", repeat_count));
        }
        Ok(())
      }
    }
  }

  pub(crate) fn increment_times_triggered(&mut self) {
    match self {
      TriggerSchedule::Simple { times_triggered, .. }
      | TriggerSchedule::CalendarInterval { times_triggered, .. }
      | TriggerSchedule::DailyTimeInterval { times_triggered, .. } => *times_triggered += 1,
      TriggerSchedule::Cron { .. } => {}
    }
  }

  /// Calculates the first fire time strictly after `after` (or after now when `None`),
  /// bounded by the trigger's `start` and `end`.
  pub(crate) fn fire_time_after(
    &self,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
  ) -> Option<DateTime<Utc>> {
    let after = after.unwrap_or_else(Utc::now);
    match self {
      TriggerSchedule::Simple {
        repeat_count,
        repeat_interval,
        times_triggered,
      } => simple_fire_time_after(
        start,
        end,
        after,
        *repeat_count,
        *repeat_interval,
        *times_triggered,
      ),
      TriggerSchedule::Cron { expression } => cron_fire_time_after(expression, start, end, after),
      TriggerSchedule::CalendarInterval { interval, unit, .. } => {
        calendar_interval_fire_time_after(start, end, after, *interval, *unit)
      }
      TriggerSchedule::DailyTimeInterval {
        interval,
        unit,
        days_of_week,
        start_time_of_day,
        end_time_of_day,
        repeat_count,
        times_triggered,
      } => {
        if *repeat_count != REPEAT_INDEFINITELY && *times_triggered > *repeat_count {
          return None;
        }
        daily_fire_time_after(
          start,
          end,
          after,
          *interval,
          *unit,
          days_of_week,
          *start_time_of_day,
          *end_time_of_day,
        )
      }
    }
  }
}

fn simple_fire_time_after(
  start: DateTime<Utc>,
  end: Option<DateTime<Utc>>,
  after: DateTime<Utc>,
  repeat_count: i32,
  repeat_interval: StdDuration,
  times_triggered: i32,
) -> Option<DateTime<Utc>> {
  if repeat_count != REPEAT_INDEFINITELY && times_triggered > repeat_count {
    return None;
  }
  if repeat_count == 0 && after >= start {
    return None;
  }
  if let Some(end) = end {
    if end <= after {
      return None;
    }
  }
  if after < start {
    return Some(start);
  }

  let interval_ms = i64::try_from(repeat_interval.as_millis()).ok()?;
  if interval_ms <= 0 {
    return None;
  }
  let elapsed_ms = (after - start).num_milliseconds();
  let times_executed = elapsed_ms / interval_ms + 1;
  if repeat_count != REPEAT_INDEFINITELY && times_executed > i64::from(repeat_count) {
    return None;
  }

  let time = start.checked_add_signed(ChronoDuration::milliseconds(
    times_executed.checked_mul(interval_ms)?,
  ))?;
  match end {
    Some(end) if end <= time => None,
    _ => Some(time),
  }
}

fn cron_fire_time_after(
  expression: &str,
  start: DateTime<Utc>,
  end: Option<DateTime<Utc>>,
  after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
  let schedule = match CronSchedule::from_str(expression) {
    Ok(schedule) => schedule,
    Err(e) => {
      warn!("Failed to parse cron expression '{}': {}", expression, e);
      return None;
    }
  };
  let after = if start > after {
    start - ChronoDuration::milliseconds(1)
  } else {
    after
  };
  if let Some(end) = end {
    if after >= end {
      return None;
    }
  }
  let candidate = schedule.after(&after).find(|t| *t >= start)?;
  match end {
    Some(end) if candidate > end => None,
    _ => Some(candidate),
  }
}

fn calendar_interval_fire_time_after(
  start: DateTime<Utc>,
  end: Option<DateTime<Utc>>,
  after: DateTime<Utc>,
  interval: u32,
  unit: IntervalUnit,
) -> Option<DateTime<Utc>> {
  if let Some(end) = end {
    if after >= end {
      return None;
    }
  }
  if after < start {
    return Some(start);
  }

  let time = match unit.fixed_millis() {
    Some(unit_ms) => {
      let jump_ms = unit_ms.checked_mul(i64::from(interval))?;
      let jumps = (after - start).num_milliseconds() / jump_ms + 1;
      start.checked_add_signed(ChronoDuration::milliseconds(jumps.checked_mul(jump_ms)?))?
    }
    None => {
      let step = interval.checked_mul(unit.months())?;
      let elapsed_months = (after.year() - start.year()) * 12 + after.month() as i32
        - start.month() as i32;
      // Start one step early; month lengths make the estimate inexact.
      let mut jumps = (elapsed_months.max(0) as u32 / step).saturating_sub(1);
      loop {
        let candidate = start.checked_add_months(Months::new(jumps.checked_mul(step)?))?;
        if candidate > after {
          break candidate;
        }
        jumps += 1;
      }
    }
  };

  match end {
    Some(end) if time > end => None,
    _ => Some(time),
  }
}

#[allow(clippy::too_many_arguments)]
fn daily_fire_time_after(
  start: DateTime<Utc>,
  end: Option<DateTime<Utc>>,
  after: DateTime<Utc>,
  interval: u32,
  unit: IntervalUnit,
  days_of_week: &[Weekday],
  start_time_of_day: NaiveTime,
  end_time_of_day: NaiveTime,
) -> Option<DateTime<Utc>> {
  let interval_ms = unit.fixed_millis()?.checked_mul(i64::from(interval))?;
  // The start time itself is eligible.
  let after = after.max(start - ChronoDuration::milliseconds(1));
  let mut day = after.date_naive();

  // One full week always contains a selected weekday.
  for _ in 0..8 {
    if days_of_week.contains(&day.weekday()) {
      let window_start = day.and_time(start_time_of_day).and_utc();
      let window_end = day.and_time(end_time_of_day).and_utc();
      let candidate = if after < window_start {
        window_start
      } else {
        let jumps = (after - window_start).num_milliseconds() / interval_ms + 1;
        window_start + ChronoDuration::milliseconds(jumps * interval_ms)
      };
      if candidate <= window_end {
        return match end {
          Some(end) if candidate > end => None,
          _ => Some(candidate),
        };
      }
    }
    day = day.succ_opt()?;
  }
  None
}

/// Number of simple-schedule fires that fall in `(start, end]`.
pub(crate) fn num_times_fired_between(
  repeat_interval: StdDuration,
  start: DateTime<Utc>,
  end: DateTime<Utc>,
) -> i32 {
  let interval_ms = repeat_interval.as_millis() as i64;
  if interval_ms < 1 {
    return 0;
  }
  let elapsed = (end - start).num_milliseconds();
  i32::try_from(elapsed / interval_ms).unwrap_or(i32::MAX)
}
