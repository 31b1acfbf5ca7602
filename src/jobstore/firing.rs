//! Acquire, fire, release and complete: the operations the scheduler's fire loop drives.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, trace, warn};

use super::{JobStore, RECOVERING_JOBS_GROUP};
use crate::error::{JobStoreError, Result};
use crate::job::JobDetail;
use crate::lock::LockType;
use crate::metrics::StoreMetrics;
use crate::repository::FiredTriggerRecord;
use crate::signal::SchedulingSignal;
use crate::trigger::{CompletedExecutionInstruction, Trigger, TriggerFiredBundle, TriggerState};

/// Empty acquisitions are retried this many times inside one call.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

impl JobStore {
  pub(crate) fn next_fire_instance_id(&self) -> String {
    let n = self.fire_counter.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", self.config.instance_id, n)
  }

  /// Acquires up to `max_count` Waiting triggers due by `no_later_than + time_window`.
  ///
  /// Each acquired trigger is moved to Acquired and gets a fire instance id plus an
  /// Acquired fired record owned by this instance. At most one trigger per
  /// non-concurrent job is taken per call. After the first acquisition the batch is
  /// closed at `max(first fire time, now) + time_window`.
  pub async fn acquire_next_triggers(
    &self,
    no_later_than: DateTime<Utc>,
    max_count: usize,
    time_window: ChronoDuration,
  ) -> Result<Vec<Trigger>> {
    if time_window < ChronoDuration::zero() {
      return Err(JobStoreError::InvalidArgument(
        "time_window cannot be negative".to_string(),
      ));
    }
    if max_count == 0 {
      return Ok(Vec::new());
    }

    let acquired = self
      .in_lock(LockType::TriggerAccess, || {
        self.acquire_next_triggers_tx(no_later_than, max_count, time_window)
      })
      .await?;
    StoreMetrics::add(&self.metrics.triggers_acquired, acquired.len());
    Ok(acquired)
  }

  async fn acquire_next_triggers_tx(
    &self,
    no_later_than: DateTime<Utc>,
    max_count: usize,
    time_window: ChronoDuration,
  ) -> Result<Vec<Trigger>> {
    let mut acquired: Vec<Trigger> = Vec::new();
    let mut non_concurrent_jobs = HashSet::new();

    for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
      let keys = self
        .repos
        .triggers
        .find_to_acquire(no_later_than + time_window, self.misfire_time(), max_count)
        .await?;
      if keys.is_empty() {
        return Ok(acquired);
      }

      let mut batch_end = no_later_than;
      for key in keys {
        let Some((mut trigger, _)) = self.load_trigger(&key).await? else {
          continue;
        };

        let job = match self.repos.jobs.get(&trigger.job_key).await {
          Ok(Some(job)) => job,
          Ok(None) => {
            error!(trigger_key = %key, job_key = %trigger.job_key, "Trigger references a missing job, setting trigger state to ERROR.");
            self.repos.triggers.set_state(&key, TriggerState::Error).await?;
            continue;
          }
          Err(e) => {
            error!(trigger_key = %key, error = %e, "Error retrieving job, setting trigger state to ERROR.");
            if let Err(e) = self.repos.triggers.set_state(&key, TriggerState::Error).await {
              error!(trigger_key = %key, error = %e, "Unable to set trigger state to ERROR.");
            }
            continue;
          }
        };

        if job.concurrent_execution_disallowed && !non_concurrent_jobs.insert(job.key.clone()) {
          continue;
        }

        let Some(next_fire_time) = trigger.next_fire_time else {
          warn!(trigger_key = %key, "Trigger returned no next fire time and yet still exists in the store!");
          continue;
        };
        if next_fire_time > batch_end {
          break;
        }

        if !self
          .repos
          .triggers
          .compare_and_set_state(&key, &[TriggerState::Waiting], TriggerState::Acquired)
          .await?
        {
          continue;
        }

        let fire_instance_id = self.next_fire_instance_id();
        self
          .repos
          .triggers
          .set_fire_instance_id(&key, Some(&fire_instance_id))
          .await?;
        self
          .repos
          .fired_triggers
          .insert(&FiredTriggerRecord {
            fire_instance_id: fire_instance_id.clone(),
            instance_id: self.config.instance_id.clone(),
            trigger_key: key.clone(),
            job_key: trigger.job_key.clone(),
            state: TriggerState::Acquired,
            fired_at: Utc::now(),
            scheduled_at: Some(next_fire_time),
            priority: trigger.priority,
            concurrent_execution_disallowed: false,
            requests_recovery: false,
          })
          .await?;
        trigger.fire_instance_id = Some(fire_instance_id);

        if acquired.is_empty() {
          batch_end = next_fire_time.max(Utc::now()) + time_window;
        }
        debug!(trigger_key = %key, %next_fire_time, "Acquired trigger");
        acquired.push(trigger);
      }

      if !acquired.is_empty() {
        break;
      }
      trace!(attempt, "No trigger acquired, retrying");
    }
    Ok(acquired)
  }

  /// Hands an acquired trigger back without firing it.
  pub async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let stored_id = self
          .repos
          .triggers
          .get(&trigger.key)
          .await?
          .and_then(|r| r.fire_instance_id);
        self
          .repos
          .triggers
          .compare_and_set_state(
            &trigger.key,
            &[TriggerState::Acquired, TriggerState::Blocked],
            TriggerState::Waiting,
          )
          .await?;
        if let Some(id) = trigger.fire_instance_id.as_ref().or(stored_id.as_ref()) {
          self.repos.fired_triggers.delete(id).await?;
        }
        debug!(trigger_key = %trigger.key, "Released acquired trigger");
        Ok(())
      })
      .await?;
    StoreMetrics::incr(&self.metrics.triggers_released);
    Ok(())
  }

  /// Fires acquired triggers.
  ///
  /// Each item resolves independently: `Ok(None)` when the trigger is no longer
  /// Acquired or its job or calendar is gone, `Err` when that item failed.
  pub async fn triggers_fired(
    &self,
    triggers: &[Trigger],
  ) -> Result<Vec<Result<Option<TriggerFiredBundle>>>> {
    let results = self
      .in_lock(LockType::TriggerAccess, || async move {
        let mut results = Vec::with_capacity(triggers.len());
        for trigger in triggers {
          let result = self.trigger_fired_tx(trigger).await;
          if let Err(e) = &result {
            warn!(trigger_key = %trigger.key, error = %e, "Failed to fire trigger");
          }
          results.push(result);
        }
        Ok(results)
      })
      .await?;

    let fired = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
    StoreMetrics::add(&self.metrics.triggers_fired, fired);
    Ok(results)
  }

  async fn trigger_fired_tx(&self, requested: &Trigger) -> Result<Option<TriggerFiredBundle>> {
    let Some(record) = self.repos.triggers.get(&requested.key).await? else {
      debug!(trigger_key = %requested.key, "Trigger no longer exists, not firing");
      return Ok(None);
    };
    if record.state != TriggerState::Acquired {
      debug!(trigger_key = %requested.key, state = ?record.state, "Trigger is no longer acquired, not firing");
      return Ok(None);
    }

    let job = match self.repos.jobs.get(&record.job_key).await {
      Ok(Some(job)) => job,
      Ok(None) => {
        warn!(trigger_key = %requested.key, job_key = %record.job_key, "Job no longer exists, not firing");
        return Ok(None);
      }
      Err(e) => {
        error!(trigger_key = %requested.key, error = %e, "Error retrieving job, setting trigger state to ERROR.");
        if let Err(e) = self.repos.triggers.set_state(&requested.key, TriggerState::Error).await {
          error!(trigger_key = %requested.key, error = %e, "Unable to set trigger state to ERROR.");
        }
        return Err(e.into());
      }
    };

    let calendar = match &record.calendar_name {
      Some(name) => match self.repos.calendars.get(name).await? {
        Some(calendar) => Some(calendar),
        None => {
          warn!(trigger_key = %requested.key, calendar = %name, "Calendar no longer exists, not firing");
          return Ok(None);
        }
      },
      None => None,
    };

    let mut trigger = record.decode()?;
    if trigger.fire_instance_id.is_none() {
      trigger.fire_instance_id = requested.fire_instance_id.clone();
    }
    let fire_instance_id = trigger.fire_instance_id.clone().ok_or_else(|| {
      JobStoreError::persistence(format!(
        "Acquired trigger {} has no fire instance id",
        trigger.key
      ))
    })?;

    let now = Utc::now();
    let executing = FiredTriggerRecord {
      fire_instance_id,
      instance_id: self.config.instance_id.clone(),
      trigger_key: trigger.key.clone(),
      job_key: job.key.clone(),
      state: TriggerState::Executing,
      fired_at: now,
      scheduled_at: trigger.next_fire_time,
      priority: trigger.priority,
      concurrent_execution_disallowed: job.concurrent_execution_disallowed,
      requests_recovery: job.requests_recovery,
    };
    if !self.repos.fired_triggers.update(&executing).await? {
      self.repos.fired_triggers.insert(&executing).await?;
    }

    let previous_fire_time = trigger.previous_fire_time;
    trigger.triggered(calendar.as_ref());

    let mut state = TriggerState::Waiting;
    let mut force = true;
    if job.concurrent_execution_disallowed {
      state = TriggerState::Blocked;
      force = false;
      let triggers = &self.repos.triggers;
      triggers
        .transition_for_job(&job.key, &[TriggerState::Waiting], TriggerState::Blocked)
        .await?;
      triggers
        .transition_for_job(&job.key, &[TriggerState::Acquired], TriggerState::Blocked)
        .await?;
      triggers
        .transition_for_job(&job.key, &[TriggerState::Paused], TriggerState::PausedBlocked)
        .await?;
    }
    if trigger.next_fire_time.is_none() {
      state = TriggerState::Complete;
      force = true;
    }
    self
      .store_trigger_tx(&trigger, Some(&job), true, state, force, false)
      .await?;

    debug!(trigger_key = %trigger.key, job_key = %job.key, next_state = ?state, "Trigger fired");
    Ok(Some(TriggerFiredBundle {
      recovering: trigger.key.group == RECOVERING_JOBS_GROUP,
      fire_time: now,
      scheduled_fire_time: trigger.previous_fire_time,
      previous_fire_time,
      next_fire_time: trigger.next_fire_time,
      job,
      trigger,
      calendar,
    }))
  }

  /// Records the end of an execution and applies the scheduler's verdict.
  ///
  /// A non-concurrent job's blocked triggers are released, dirty job data is written
  /// back when the job persists it, and the fired record is removed.
  pub async fn triggered_job_complete(
    &self,
    trigger: &Trigger,
    job: &JobDetail,
    instruction: CompletedExecutionInstruction,
  ) -> Result<()> {
    let mut signals = SchedulingSignal::new();
    let sig = &mut signals;
    self
      .in_lock(LockType::TriggerAccess, move || async move {
        self
          .triggered_job_complete_tx(sig, trigger, job, instruction)
          .await
      })
      .await?;
    StoreMetrics::incr(&self.metrics.jobs_completed);
    signals.dispatch(self.signaler.as_ref());
    Ok(())
  }

  async fn triggered_job_complete_tx(
    &self,
    signals: &mut SchedulingSignal,
    trigger: &Trigger,
    job: &JobDetail,
    instruction: CompletedExecutionInstruction,
  ) -> Result<()> {
    let stored = self.repos.triggers.get(&trigger.key).await?;
    let triggers = &self.repos.triggers;

    match instruction {
      CompletedExecutionInstruction::DeleteTrigger => {
        if trigger.next_fire_time.is_none() {
          // Only delete if the stored copy has not been rescheduled meanwhile.
          if stored.as_ref().is_some_and(|r| r.next_fire_time.is_none()) {
            self.remove_trigger_tx(&trigger.key).await?;
          }
        } else {
          self.remove_trigger_tx(&trigger.key).await?;
          signals.raise(None);
        }
      }
      CompletedExecutionInstruction::SetTriggerComplete => {
        triggers.set_state(&trigger.key, TriggerState::Complete).await?;
        signals.raise(None);
      }
      CompletedExecutionInstruction::SetTriggerError => {
        info!(trigger_key = %trigger.key, "Trigger set to ERROR state.");
        triggers.set_state(&trigger.key, TriggerState::Error).await?;
        signals.raise(None);
      }
      CompletedExecutionInstruction::SetAllJobTriggersComplete => {
        triggers
          .transition_for_job(&job.key, &[], TriggerState::Complete)
          .await?;
        signals.raise(None);
      }
      CompletedExecutionInstruction::SetAllJobTriggersError => {
        info!(job_key = %job.key, "All triggers of job set to ERROR state.");
        triggers
          .transition_for_job(&job.key, &[], TriggerState::Error)
          .await?;
        signals.raise(None);
      }
      CompletedExecutionInstruction::NoInstruction | CompletedExecutionInstruction::ReExecuteJob => {}
    }

    if job.concurrent_execution_disallowed {
      triggers
        .transition_for_job(&job.key, &[TriggerState::Blocked], TriggerState::Waiting)
        .await?;
      triggers
        .transition_for_job(&job.key, &[TriggerState::PausedBlocked], TriggerState::Paused)
        .await?;
      signals.raise(None);
    }

    if job.persist_job_data_after_execution && job.job_data.is_dirty() {
      self.repos.jobs.update_job_data(&job.key, &job.job_data).await?;
      debug!(job_key = %job.key, "Persisted job data after execution");
    }

    let stored_id = stored.and_then(|r| r.fire_instance_id);
    if let Some(id) = trigger.fire_instance_id.as_ref().or(stored_id.as_ref()) {
      self.repos.fired_triggers.delete(id).await?;
    }
    debug!(trigger_key = %trigger.key, ?instruction, "Job execution completed");
    Ok(())
  }
}
