//! Triggers: when a job fires, and the persisted state machine that governs firing.

pub mod record;
pub mod schedule;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

use crate::calendar::Calendar;
use crate::error::{JobStoreError, Result};
use crate::job::{JobDataMap, JobDetail, JobKey, TriggerKey};

pub use record::{TriggerKind, TriggerRecord};
pub use schedule::{IntervalUnit, TriggerSchedule, REPEAT_INDEFINITELY};

/// Priority assigned to triggers that do not set one. Higher fires first on ties.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Years past the current one after which calendar skipping gives up.
const GIVE_UP_YEARS: i32 = 100;

// --- States ---

/// Persisted trigger state.
///
/// `Complete` and `Error` are terminal for the trigger instance; a deleted trigger has
/// no record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerState {
  Waiting,
  Acquired,
  Executing,
  Complete,
  Paused,
  Blocked,
  PausedBlocked,
  Error,
}

impl TriggerState {
  /// Maps the internal state onto the coarser public status.
  pub fn status(self) -> TriggerStatus {
    match self {
      TriggerState::Complete => TriggerStatus::Complete,
      TriggerState::Paused | TriggerState::PausedBlocked => TriggerStatus::Paused,
      TriggerState::Error => TriggerStatus::Error,
      TriggerState::Blocked => TriggerStatus::Blocked,
      TriggerState::Waiting | TriggerState::Acquired | TriggerState::Executing => {
        TriggerStatus::Normal
      }
    }
  }
}

/// Public view of a trigger's state, as returned by `JobStore::get_trigger_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerStatus {
  /// No such trigger.
  None,
  Normal,
  Paused,
  Complete,
  Error,
  Blocked,
}

// --- Instructions ---

/// What to do when a trigger's fire time passed by more than the misfire threshold.
///
/// `FireNow` means "fire once, now" for every schedule kind. The `Reschedule*`
/// variants are only valid for [`TriggerSchedule::Simple`]; `DoNothing` is only valid
/// for the calendar-driven kinds (cron, calendar interval, daily time interval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MisfireInstruction {
  /// Never treat the trigger as misfired; fire all missed times as soon as possible.
  IgnoreMisfirePolicy,
  /// Let the schedule kind pick a sensible instruction.
  Smart,
  FireNow,
  RescheduleNowWithExistingRepeatCount,
  RescheduleNowWithRemainingRepeatCount,
  RescheduleNextWithRemainingCount,
  RescheduleNextWithExistingCount,
  /// Skip the missed fires and wait for the next scheduled time after now.
  DoNothing,
}

impl MisfireInstruction {
  fn is_valid_for(self, schedule: &TriggerSchedule) -> bool {
    match self {
      MisfireInstruction::IgnoreMisfirePolicy
      | MisfireInstruction::Smart
      | MisfireInstruction::FireNow => true,
      MisfireInstruction::RescheduleNowWithExistingRepeatCount
      | MisfireInstruction::RescheduleNowWithRemainingRepeatCount
      | MisfireInstruction::RescheduleNextWithRemainingCount
      | MisfireInstruction::RescheduleNextWithExistingCount => {
        matches!(schedule, TriggerSchedule::Simple { .. })
      }
      MisfireInstruction::DoNothing => !matches!(schedule, TriggerSchedule::Simple { .. }),
    }
  }
}

/// The scheduler's verdict after a job execution, applied by `JobStore::triggered_job_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletedExecutionInstruction {
  NoInstruction,
  /// The job is re-executed immediately by the scheduler; the store only releases the fire.
  ReExecuteJob,
  SetTriggerComplete,
  DeleteTrigger,
  SetAllJobTriggersComplete,
  SetTriggerError,
  SetAllJobTriggersError,
}

// --- Trigger ---

/// A schedule bound to exactly one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
  pub key: TriggerKey,
  pub job_key: JobKey,
  pub description: Option<String>,
  /// Name of the exclusion calendar to honor, if any.
  pub calendar_name: Option<String>,
  /// Data merged over the job's data for executions fired by this trigger.
  pub job_data: JobDataMap,
  pub priority: i32,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  pub next_fire_time: Option<DateTime<Utc>>,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub misfire_instruction: MisfireInstruction,
  pub schedule: TriggerSchedule,
  /// Set by the store when the trigger is acquired for firing.
  pub fire_instance_id: Option<String>,
}

impl Trigger {
  pub fn builder(key: TriggerKey, job_key: JobKey) -> TriggerBuilder {
    TriggerBuilder::new(key, job_key)
  }

  /// The next time this trigger would fire strictly after `after` (or after now),
  /// ignoring calendars.
  pub fn fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    self
      .schedule
      .fire_time_after(self.start_time, self.end_time, after)
  }

  pub fn may_fire_again(&self) -> bool {
    self.next_fire_time.is_some()
  }

  /// Computes and sets the first fire time, skipping times `calendar` excludes.
  pub fn compute_first_fire_time(&mut self, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
    let first = self.fire_time_after(Some(self.start_time - ChronoDuration::milliseconds(1)));
    self.next_fire_time = self.skip_excluded(first, calendar);
    self.next_fire_time
  }

  /// Advances the trigger past its current fire time.
  pub fn triggered(&mut self, calendar: Option<&Calendar>) {
    self.schedule.increment_times_triggered();
    self.previous_fire_time = self.next_fire_time;
    let next = self.fire_time_after(self.next_fire_time);
    self.next_fire_time = self.skip_excluded(next, calendar);
  }

  /// Applies the misfire instruction, moving `next_fire_time` (and possibly the
  /// repeat bookkeeping) according to the schedule kind.
  pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>) {
    if self.misfire_instruction == MisfireInstruction::IgnoreMisfirePolicy {
      return;
    }
    if matches!(self.schedule, TriggerSchedule::Simple { .. }) {
      self.update_simple_after_misfire(calendar);
      return;
    }

    let instruction = match self.misfire_instruction {
      MisfireInstruction::Smart => MisfireInstruction::FireNow,
      other => other,
    };
    match instruction {
      MisfireInstruction::DoNothing => {
        let next = self.fire_time_after(Some(Utc::now()));
        self.next_fire_time = self.skip_excluded(next, calendar);
      }
      MisfireInstruction::FireNow => self.next_fire_time = Some(Utc::now()),
      _ => {}
    }
  }

  fn update_simple_after_misfire(&mut self, calendar: Option<&Calendar>) {
    let (repeat_count, repeat_interval) = match &self.schedule {
      TriggerSchedule::Simple {
        repeat_count,
        repeat_interval,
        ..
      } => (*repeat_count, *repeat_interval),
      _ => return,
    };

    let instruction = match self.misfire_instruction {
      MisfireInstruction::Smart if repeat_count == 0 => MisfireInstruction::FireNow,
      MisfireInstruction::Smart if repeat_count == REPEAT_INDEFINITELY => {
        MisfireInstruction::RescheduleNextWithRemainingCount
      }
      MisfireInstruction::Smart => MisfireInstruction::RescheduleNowWithExistingRepeatCount,
      MisfireInstruction::FireNow if repeat_count != 0 => {
        MisfireInstruction::RescheduleNowWithRemainingRepeatCount
      }
      other => other,
    };

    let now = Utc::now();
    match instruction {
      MisfireInstruction::FireNow => self.next_fire_time = Some(now),
      MisfireInstruction::RescheduleNextWithExistingCount => {
        let next = self.fire_time_after(Some(now));
        self.next_fire_time = self.skip_excluded(next, calendar);
      }
      MisfireInstruction::RescheduleNextWithRemainingCount => {
        let next = self.fire_time_after(Some(now));
        let next = self.skip_excluded(next, calendar);
        if let (Some(new_time), Some(old_time)) = (next, self.next_fire_time) {
          let missed = schedule::num_times_fired_between(repeat_interval, old_time, new_time);
          if let TriggerSchedule::Simple {
            times_triggered, ..
          } = &mut self.schedule
          {
            *times_triggered += missed;
          }
        }
        self.next_fire_time = next;
      }
      MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
        if let TriggerSchedule::Simple {
          repeat_count,
          times_triggered,
          ..
        } = &mut self.schedule
        {
          if *repeat_count != 0 && *repeat_count != REPEAT_INDEFINITELY {
            *repeat_count -= *times_triggered;
            *times_triggered = 0;
          }
        }
        self.reschedule_now(now);
      }
      MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
        let missed = self
          .next_fire_time
          .map(|old| schedule::num_times_fired_between(repeat_interval, old, now))
          .unwrap_or(0);
        if let TriggerSchedule::Simple {
          repeat_count,
          times_triggered,
          ..
        } = &mut self.schedule
        {
          if *repeat_count != 0 && *repeat_count != REPEAT_INDEFINITELY {
            *repeat_count = (*repeat_count - (*times_triggered + missed)).max(0);
            *times_triggered = 0;
          }
        }
        self.reschedule_now(now);
      }
      _ => {}
    }
  }

  fn reschedule_now(&mut self, now: DateTime<Utc>) {
    match self.end_time {
      Some(end) if end < now => self.next_fire_time = None,
      _ => {
        self.start_time = now;
        self.next_fire_time = Some(now);
      }
    }
  }

  /// Recomputes `next_fire_time` after the bound calendar changed.
  ///
  /// Candidates the calendar excludes are skipped; while skipping, candidates already
  /// older than `misfire_threshold` are skipped too.
  pub fn update_with_new_calendar(&mut self, calendar: &Calendar, misfire_threshold: StdDuration) {
    let mut next = self.fire_time_after(self.previous_fire_time);
    let now = Utc::now();
    let threshold = ChronoDuration::from_std(misfire_threshold).unwrap_or(ChronoDuration::MAX);
    let give_up = give_up_year();

    while let Some(time) = next {
      if calendar.is_time_included(time) {
        break;
      }
      next = self.fire_time_after(Some(time));
      match next {
        Some(t) if t.year() > give_up => next = None,
        Some(t) if t < now && now - t >= threshold => next = self.fire_time_after(Some(t)),
        _ => {}
      }
    }
    self.next_fire_time = next;
  }

  fn skip_excluded(
    &self,
    mut candidate: Option<DateTime<Utc>>,
    calendar: Option<&Calendar>,
  ) -> Option<DateTime<Utc>> {
    let Some(calendar) = calendar else {
      return candidate;
    };
    let give_up = give_up_year();
    while let Some(time) = candidate {
      if calendar.is_time_included(time) {
        break;
      }
      if time.year() > give_up {
        return None;
      }
      candidate = self.fire_time_after(Some(time));
    }
    candidate
  }
}

fn give_up_year() -> i32 {
  Utc::now().year() + GIVE_UP_YEARS
}

// --- Builder ---

/// Builder for [`Trigger`]. `build` validates the schedule and computes the first fire time.
#[derive(Debug, Clone)]
pub struct TriggerBuilder {
  key: TriggerKey,
  job_key: JobKey,
  description: Option<String>,
  calendar_name: Option<String>,
  job_data: JobDataMap,
  priority: i32,
  start_time: Option<DateTime<Utc>>,
  end_time: Option<DateTime<Utc>>,
  misfire_instruction: MisfireInstruction,
  schedule: TriggerSchedule,
}

impl TriggerBuilder {
  pub fn new(key: TriggerKey, job_key: JobKey) -> Self {
    Self {
      key,
      job_key,
      description: None,
      calendar_name: None,
      job_data: JobDataMap::new(),
      priority: DEFAULT_PRIORITY,
      start_time: None,
      end_time: None,
      misfire_instruction: MisfireInstruction::Smart,
      schedule: TriggerSchedule::once(),
    }
  }

  pub fn with_schedule(mut self, schedule: TriggerSchedule) -> Self {
    self.schedule = schedule;
    self
  }

  /// First eligible fire time. Defaults to the time `build` is called.
  pub fn start_at(mut self, start_time: DateTime<Utc>) -> Self {
    self.start_time = Some(start_time);
    self
  }

  pub fn end_at(mut self, end_time: DateTime<Utc>) -> Self {
    self.end_time = Some(end_time);
    self
  }

  pub fn priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn calendar(mut self, calendar_name: impl Into<String>) -> Self {
    self.calendar_name = Some(calendar_name.into());
    self
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn job_data(mut self, job_data: JobDataMap) -> Self {
    self.job_data = job_data;
    self
  }

  pub fn misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
    self.misfire_instruction = instruction;
    self
  }

  pub fn build(self) -> Result<Trigger> {
    self
      .schedule
      .validate()
      .map_err(|msg| JobStoreError::InvalidArgument(format!("Trigger {}: {}", self.key, msg)))?;
    if !self.misfire_instruction.is_valid_for(&self.schedule) {
      return Err(JobStoreError::InvalidArgument(format!(
        "Trigger {}: misfire instruction {:?} is not valid for this schedule",
        self.key, self.misfire_instruction
      )));
    }
    let start_time = self.start_time.unwrap_or_else(Utc::now);
    if let Some(end) = self.end_time {
      if end < start_time {
        return Err(JobStoreError::InvalidArgument(format!(
          "Trigger {}: end time cannot be before start time",
          self.key
        )));
      }
    }

    let mut trigger = Trigger {
      key: self.key,
      job_key: self.job_key,
      description: self.description,
      calendar_name: self.calendar_name,
      job_data: self.job_data,
      priority: self.priority,
      start_time,
      end_time: self.end_time,
      next_fire_time: None,
      previous_fire_time: None,
      misfire_instruction: self.misfire_instruction,
      schedule: self.schedule,
      fire_instance_id: None,
    };
    trigger.compute_first_fire_time(None);
    Ok(trigger)
  }
}

// --- Fire Bundle ---

/// Everything the scheduler needs to run one firing, returned by `JobStore::triggers_fired`.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
  pub job: JobDetail,
  /// The trigger after it advanced past this firing.
  pub trigger: Trigger,
  pub calendar: Option<Calendar>,
  /// True when the trigger is a recovery trigger re-running a failed instance's job.
  pub recovering: bool,
  pub fire_time: DateTime<Utc>,
  pub scheduled_fire_time: Option<DateTime<Utc>>,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub next_fire_time: Option<DateTime<Utc>>,
}
