//! The flat persisted shape of a trigger.
//!
//! Every schedule kind shares one document layout; `kind` is the discriminant and the
//! per-kind parameters are optional columns. [`TriggerRecord::encode`] and
//! [`TriggerRecord::decode`] are the only places that map between the two shapes.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

use super::{MisfireInstruction, Trigger, TriggerSchedule, TriggerState};
use crate::error::{JobStoreError, Result};
use crate::job::{JobDataMap, JobKey, TriggerKey};
use crate::trigger::schedule::IntervalUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
  Simple,
  Cron,
  CalendarInterval,
  DailyTimeInterval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
  pub key: TriggerKey,
  pub job_key: JobKey,
  pub state: TriggerState,
  pub kind: TriggerKind,
  pub description: Option<String>,
  pub calendar_name: Option<String>,
  pub priority: i32,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  pub next_fire_time: Option<DateTime<Utc>>,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub misfire_instruction: MisfireInstruction,
  pub job_data: JobDataMap,
  pub fire_instance_id: Option<String>,

  // Per-kind columns
  pub repeat_count: Option<i32>,
  pub repeat_interval_ms: Option<u64>,
  pub times_triggered: Option<i32>,
  pub cron_expression: Option<String>,
  pub interval: Option<u32>,
  pub interval_unit: Option<IntervalUnit>,
  pub days_of_week: Option<Vec<Weekday>>,
  pub start_time_of_day: Option<NaiveTime>,
  pub end_time_of_day: Option<NaiveTime>,
}

impl TriggerRecord {
  pub fn encode(trigger: &Trigger, state: TriggerState) -> Self {
    let mut record = TriggerRecord {
      key: trigger.key.clone(),
      job_key: trigger.job_key.clone(),
      state,
      kind: TriggerKind::Simple,
      description: trigger.description.clone(),
      calendar_name: trigger.calendar_name.clone(),
      priority: trigger.priority,
      start_time: trigger.start_time,
      end_time: trigger.end_time,
      next_fire_time: trigger.next_fire_time,
      previous_fire_time: trigger.previous_fire_time,
      misfire_instruction: trigger.misfire_instruction,
      job_data: trigger.job_data.clone(),
      fire_instance_id: trigger.fire_instance_id.clone(),
      repeat_count: None,
      repeat_interval_ms: None,
      times_triggered: None,
      cron_expression: None,
      interval: None,
      interval_unit: None,
      days_of_week: None,
      start_time_of_day: None,
      end_time_of_day: None,
    };

    match &trigger.schedule {
      TriggerSchedule::Simple {
        repeat_count,
        repeat_interval,
        times_triggered,
      } => {
        record.kind = TriggerKind::Simple;
        record.repeat_count = Some(*repeat_count);
        record.repeat_interval_ms = Some(repeat_interval.as_millis() as u64);
        record.times_triggered = Some(*times_triggered);
      }
      TriggerSchedule::Cron { expression } => {
        record.kind = TriggerKind::Cron;
        record.cron_expression = Some(expression.clone());
      }
      TriggerSchedule::CalendarInterval {
        interval,
        unit,
        times_triggered,
      } => {
        record.kind = TriggerKind::CalendarInterval;
        record.interval = Some(*interval);
        record.interval_unit = Some(*unit);
        record.times_triggered = Some(*times_triggered);
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
        record.kind = TriggerKind::DailyTimeInterval;
        record.interval = Some(*interval);
        record.interval_unit = Some(*unit);
        record.days_of_week = Some(days_of_week.clone());
        record.start_time_of_day = Some(*start_time_of_day);
        record.end_time_of_day = Some(*end_time_of_day);
        record.repeat_count = Some(*repeat_count);
        record.times_triggered = Some(*times_triggered);
      }
    }
    record
  }

  /// Rebuilds the trigger. A record missing a column its kind requires is corrupt.
  pub fn decode(&self) -> Result<Trigger> {
    let schedule = match self.kind {
      TriggerKind::Simple => TriggerSchedule::Simple {
        repeat_count: self.require(self.repeat_count, "repeat_count")?,
        repeat_interval: StdDuration::from_millis(
          self.require(self.repeat_interval_ms, "repeat_interval_ms")?,
        ),
        times_triggered: self.times_triggered.unwrap_or(0),
      },
      TriggerKind::Cron => TriggerSchedule::Cron {
        expression: self.require(self.cron_expression.clone(), "cron_expression")?,
      },
      TriggerKind::CalendarInterval => TriggerSchedule::CalendarInterval {
        interval: self.require(self.interval, "interval")?,
        unit: self.require(self.interval_unit, "interval_unit")?,
        times_triggered: self.times_triggered.unwrap_or(0),
      },
      TriggerKind::DailyTimeInterval => TriggerSchedule::DailyTimeInterval {
        interval: self.require(self.interval, "interval")?,
        unit: self.require(self.interval_unit, "interval_unit")?,
        days_of_week: self.require(self.days_of_week.clone(), "days_of_week")?,
        start_time_of_day: self.require(self.start_time_of_day, "start_time_of_day")?,
        end_time_of_day: self.require(self.end_time_of_day, "end_time_of_day")?,
        repeat_count: self.require(self.repeat_count, "repeat_count")?,
        times_triggered: self.times_triggered.unwrap_or(0),
      },
    };

    Ok(Trigger {
      key: self.key.clone(),
      job_key: self.job_key.clone(),
      description: self.description.clone(),
      calendar_name: self.calendar_name.clone(),
      job_data: self.job_data.clone(),
      priority: self.priority,
      start_time: self.start_time,
      end_time: self.end_time,
      next_fire_time: self.next_fire_time,
      previous_fire_time: self.previous_fire_time,
      misfire_instruction: self.misfire_instruction,
      schedule,
      fire_instance_id: self.fire_instance_id.clone(),
    })
  }

  fn require<T>(&self, value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| {
      JobStoreError::persistence(format!(
        "Corrupt trigger record {} ({:?}): missing {}",
        self.key, self.kind, column
      ))
    })
  }
}
