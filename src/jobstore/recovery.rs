//! Misfire recovery, startup recovery and cluster check-in/recovery.

use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use super::{
  to_chrono, JobStore, FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME, FAILED_JOB_ORIGINAL_TRIGGER_GROUP,
  FAILED_JOB_ORIGINAL_TRIGGER_NAME, FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME,
  RECOVERING_JOBS_GROUP,
};
use crate::error::{JobStoreError, Result};
use crate::job::{JobDataMap, TriggerKey};
use crate::lock::LockType;
use crate::metrics::StoreMetrics;
use crate::repository::{FiredTriggerRecord, SchedulerStateRecord};
use crate::trigger::{MisfireInstruction, Trigger, TriggerSchedule, TriggerState};

/// Cluster bookkeeping of this instance.
#[derive(Debug)]
pub(crate) struct ClusterState {
  pub(crate) first_check_in: bool,
  pub(crate) last_checkin: DateTime<Utc>,
}

impl ClusterState {
  pub(crate) fn new() -> Self {
    Self {
      first_check_in: true,
      last_checkin: Utc::now(),
    }
  }
}

/// Outcome of one misfire recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoverMisfiredJobsResult {
  /// The pass stopped at the batch limit; more misfired triggers remain.
  pub has_more_misfired_triggers: bool,
  pub processed_misfired_trigger_count: usize,
  /// Earliest next fire time among the updated triggers.
  pub earliest_new_time: Option<DateTime<Utc>>,
}

impl RecoverMisfiredJobsResult {
  pub const NO_OP: Self = Self {
    has_more_misfired_triggers: false,
    processed_misfired_trigger_count: 0,
    earliest_new_time: None,
  };
}

impl JobStore {
  // --- Misfires ---

  /// Applies the misfire instruction of `trigger` and stores it with
  /// `new_state_if_not_complete`, or Complete when it will never fire again.
  pub(crate) async fn do_update_of_misfired_trigger(
    &self,
    mut trigger: Trigger,
    new_state_if_not_complete: TriggerState,
    force_state: bool,
    recovering: bool,
  ) -> Result<Trigger> {
    let calendar = match &trigger.calendar_name {
      Some(name) => self.repos.calendars.get(name).await?,
      None => None,
    };

    self.signaler.notify_trigger_listeners_misfired(&trigger);
    trigger.update_after_misfire(calendar.as_ref());
    StoreMetrics::incr(&self.metrics.misfires_handled);

    if trigger.next_fire_time.is_none() {
      self
        .store_trigger_tx(&trigger, None, true, TriggerState::Complete, true, recovering)
        .await?;
      self.signaler.notify_scheduler_listeners_finalized(&trigger);
    } else {
      self
        .store_trigger_tx(
          &trigger,
          None,
          true,
          new_state_if_not_complete,
          force_state,
          false,
        )
        .await?;
    }
    debug!(trigger_key = %trigger.key, next_fire_time = ?trigger.next_fire_time, "Handled misfire");
    Ok(trigger)
  }

  pub(crate) async fn recover_misfired_jobs_tx(
    &self,
    recovering: bool,
  ) -> Result<RecoverMisfiredJobsResult> {
    let max = self.config.max_misfires_to_handle_at_a_time;
    let limit = if recovering { None } else { Some(max + 1) };
    let mut keys = self
      .repos
      .triggers
      .find_misfired(self.misfire_time(), limit)
      .await?;

    let has_more = !recovering && keys.len() > max;
    if has_more {
      keys.truncate(max);
      info!(
        count = keys.len(),
        "Handling the first triggers that missed their scheduled fire-time. More misfired triggers remain to be processed."
      );
    } else if !keys.is_empty() {
      info!(count = keys.len(), "Handling trigger(s) that missed their scheduled fire-time.");
    } else {
      debug!("Found 0 triggers that missed their scheduled fire-time.");
      return Ok(RecoverMisfiredJobsResult::NO_OP);
    }

    let mut earliest: Option<DateTime<Utc>> = None;
    for key in &keys {
      let Some((trigger, _)) = self.load_trigger(key).await? else {
        continue;
      };
      let updated = self
        .do_update_of_misfired_trigger(trigger, TriggerState::Waiting, false, recovering)
        .await?;
      if let Some(next) = updated.next_fire_time {
        earliest = Some(earliest.map_or(next, |e| e.min(next)));
      }
    }

    Ok(RecoverMisfiredJobsResult {
      has_more_misfired_triggers: has_more,
      processed_misfired_trigger_count: keys.len(),
      earliest_new_time: earliest,
    })
  }

  /// Runs one misfire recovery pass, as the background misfire handler does.
  ///
  /// With the double-check option, misfires are counted without the lock first and the
  /// lock is only taken when there is something to do. Signaling the scheduler is left
  /// to the caller.
  pub async fn recover_misfires(&self) -> Result<RecoverMisfiredJobsResult> {
    if self.config.double_check_lock_misfire_handler {
      let count = self.repos.triggers.count_misfired(self.misfire_time()).await?;
      if count == 0 {
        debug!("Found 0 triggers that missed their scheduled fire-time.");
        return Ok(RecoverMisfiredJobsResult::NO_OP);
      }
    }
    self
      .in_lock(LockType::TriggerAccess, || self.recover_misfired_jobs_tx(false))
      .await
  }

  // --- Startup Recovery ---

  /// Repairs state left behind by an unclean stop of a non-clustered store.
  pub(crate) async fn recover_jobs(&self) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let triggers = &self.repos.triggers;
        let freed = triggers
          .transition_all(
            &[TriggerState::Acquired, TriggerState::Blocked],
            TriggerState::Waiting,
          )
          .await?
          + triggers
            .transition_all(&[TriggerState::PausedBlocked], TriggerState::Paused)
            .await?;
        info!(freed, "Freed triggers from 'acquired' / 'blocked' state.");

        self.recover_misfired_jobs_tx(true).await?;

        let recoverable: Vec<FiredTriggerRecord> = self
          .repos
          .fired_triggers
          .for_instance(&self.config.instance_id)
          .await?
          .into_iter()
          .filter(|r| r.requests_recovery)
          .collect();
        info!(
          count = recoverable.len(),
          "Recovering jobs that were in-progress at the time of the last shut-down."
        );
        let mut seq = Utc::now().timestamp_millis();
        for record in &recoverable {
          if self.repos.jobs.exists(&record.job_key).await? {
            self
              .schedule_recovery_trigger(record, &self.config.instance_id, seq)
              .await?;
            seq += 1;
          }
        }
        info!("Recovery complete.");

        let complete = triggers.keys_in_state(TriggerState::Complete).await?;
        for key in &complete {
          self.remove_trigger_tx(key).await?;
        }
        info!(count = complete.len(), "Removed 'complete' triggers.");

        let stale = self.repos.fired_triggers.delete_all().await?;
        info!(count = stale, "Removed stale fired job entries.");
        Ok(())
      })
      .await
  }

  /// Stores a one-shot trigger in the recovery group that re-runs the job of `record`
  /// at its originally scheduled time.
  async fn schedule_recovery_trigger(
    &self,
    record: &FiredTriggerRecord,
    failed_instance_id: &str,
    seq: i64,
  ) -> Result<()> {
    let mut job_data = self
      .repos
      .triggers
      .get(&record.trigger_key)
      .await?
      .map(|r| r.job_data)
      .unwrap_or_else(JobDataMap::new);
    let scheduled_at = record.scheduled_at.unwrap_or(record.fired_at);
    job_data.put(FAILED_JOB_ORIGINAL_TRIGGER_NAME, record.trigger_key.name.clone());
    job_data.put(FAILED_JOB_ORIGINAL_TRIGGER_GROUP, record.trigger_key.group.clone());
    job_data.put(
      FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME,
      record.fired_at.timestamp_millis().to_string(),
    );
    job_data.put(
      FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME,
      scheduled_at.timestamp_millis().to_string(),
    );

    let key = TriggerKey::new(
      format!("recover_{}_{}", failed_instance_id, seq),
      RECOVERING_JOBS_GROUP,
    );
    let trigger = Trigger::builder(key, record.job_key.clone())
      .with_schedule(TriggerSchedule::once())
      .start_at(scheduled_at)
      .priority(record.priority)
      .misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy)
      .job_data(job_data)
      .build()?;

    self
      .store_trigger_tx(&trigger, None, false, TriggerState::Waiting, true, true)
      .await?;
    StoreMetrics::incr(&self.metrics.recovery_triggers_scheduled);
    debug!(trigger_key = %trigger.key, job_key = %record.job_key, "Scheduled recovery trigger");
    Ok(())
  }

  // --- Cluster ---

  pub(crate) fn last_checkin(&self) -> DateTime<Utc> {
    self.cluster.lock().last_checkin
  }

  /// Runs one cluster check-in pass now, as the cluster manager does periodically.
  /// Returns true when failed instances were recovered.
  pub async fn cluster_check_in(&self) -> Result<bool> {
    if !self.config.clustered {
      return Err(JobStoreError::InvalidArgument(
        "cluster check-in requires a clustered job store".to_string(),
      ));
    }
    self.do_checkin().await
  }

  /// Checks in; when failed members are found (or on the first check-in) re-checks
  /// under the state lock and recovers them under the trigger lock.
  pub(crate) async fn do_checkin(&self) -> Result<bool> {
    let first = self.cluster.lock().first_check_in;

    let mut failed = Vec::new();
    if !first {
      failed = self.cluster_check_in_tx(false).await?;
    }

    let mut recovered = false;
    if first || !failed.is_empty() {
      recovered = self
        .in_lock(LockType::StateAccess, || async move {
          let failed = if first {
            self.cluster_check_in_tx(true).await?
          } else {
            self.find_failed_instances(false).await?
          };
          if failed.is_empty() {
            return Ok(false);
          }
          self
            .in_lock(LockType::TriggerAccess, || self.cluster_recover(&failed))
            .await?;
          Ok(true)
        })
        .await?;
    }

    self.cluster.lock().first_check_in = false;
    StoreMetrics::incr(&self.metrics.cluster_checkins);
    Ok(recovered)
  }

  async fn cluster_check_in_tx(&self, first: bool) -> Result<Vec<SchedulerStateRecord>> {
    let failed = self.find_failed_instances(first).await?;

    let now = Utc::now();
    self.cluster.lock().last_checkin = now;
    self
      .repos
      .schedulers
      .upsert(&SchedulerStateRecord {
        instance_id: self.config.instance_id.clone(),
        last_checkin: now,
        checkin_interval_ms: self.config.cluster_checkin_interval.as_millis() as u64,
      })
      .await?;
    Ok(failed)
  }

  /// Members whose check-in is overdue. On the first check-in this includes this
  /// instance's own previous incarnation and owners of orphaned fired records.
  async fn find_failed_instances(&self, first: bool) -> Result<Vec<SchedulerStateRecord>> {
    let states = self.repos.schedulers.all().await?;
    let now = Utc::now();
    let grace = to_chrono(self.config.cluster_checkin_misfire_threshold);

    let mut failed = Vec::new();
    let mut found_self = false;
    for record in &states {
      if record.instance_id == self.config.instance_id {
        found_self = true;
        if first {
          failed.push(record.clone());
        }
      } else {
        let interval = ChronoDuration::milliseconds(record.checkin_interval_ms as i64);
        if record.last_checkin + interval + grace < now {
          failed.push(record.clone());
        }
      }
    }

    if first {
      let known: HashSet<&str> = states.iter().map(|s| s.instance_id.as_str()).collect();
      for instance_id in self.repos.fired_triggers.instance_ids().await? {
        if known.contains(instance_id.as_str()) {
          continue;
        }
        warn!(instance_id = %instance_id, "Found orphaned fired triggers for instance");
        failed.push(SchedulerStateRecord {
          instance_id,
          last_checkin: DateTime::<Utc>::default(),
          checkin_interval_ms: 0,
        });
      }
    }

    if !found_self && !first {
      warn!(
        instance_id = %self.config.instance_id,
        "This scheduler instance is still active but was recovered by another instance in the cluster. This may cause inconsistent behavior."
      );
    }
    Ok(failed)
  }

  /// Releases or re-schedules the in-flight work of each failed instance.
  async fn cluster_recover(&self, failed: &[SchedulerStateRecord]) -> Result<()> {
    if failed.is_empty() {
      return Ok(());
    }
    info!(count = failed.len(), "ClusterManager: detected failed or restarted instances.");

    let triggers = &self.repos.triggers;
    let mut seq = Utc::now().timestamp_millis();
    for instance in failed {
      info!(instance_id = %instance.instance_id, "ClusterManager: Scanning for instance's failed in-progress jobs.");
      let fired = self
        .repos
        .fired_triggers
        .for_instance(&instance.instance_id)
        .await?;

      let mut acquired_count = 0;
      let mut recovered_count = 0;
      let mut other_count = 0;
      let mut touched: HashSet<TriggerKey> = HashSet::new();

      for record in &fired {
        touched.insert(record.trigger_key.clone());

        match record.state {
          TriggerState::Blocked => {
            triggers
              .transition_for_job(&record.job_key, &[TriggerState::Blocked], TriggerState::Waiting)
              .await?;
          }
          TriggerState::PausedBlocked => {
            triggers
              .transition_for_job(
                &record.job_key,
                &[TriggerState::PausedBlocked],
                TriggerState::Paused,
              )
              .await?;
          }
          _ => {}
        }

        if record.state == TriggerState::Acquired {
          triggers
            .compare_and_set_state(
              &record.trigger_key,
              &[TriggerState::Acquired],
              TriggerState::Waiting,
            )
            .await?;
          acquired_count += 1;
        } else if record.requests_recovery {
          if self.repos.jobs.exists(&record.job_key).await? {
            self
              .schedule_recovery_trigger(record, &instance.instance_id, seq)
              .await?;
            seq += 1;
            recovered_count += 1;
          } else {
            warn!(job_key = %record.job_key, "ClusterManager: failed job no longer exists, cannot schedule recovery.");
            other_count += 1;
          }
        } else {
          other_count += 1;
        }

        if record.concurrent_execution_disallowed {
          triggers
            .transition_for_job(&record.job_key, &[TriggerState::Blocked], TriggerState::Waiting)
            .await?;
          triggers
            .transition_for_job(
              &record.job_key,
              &[TriggerState::PausedBlocked],
              TriggerState::Paused,
            )
            .await?;
        }
      }

      self
        .repos
        .fired_triggers
        .delete_for_instance(&instance.instance_id)
        .await?;

      let mut complete_count = 0;
      for key in &touched {
        if triggers.get_state(key).await? == Some(TriggerState::Complete)
          && self.repos.fired_triggers.for_trigger(key).await?.is_empty()
          && self.remove_trigger_tx(key).await?
        {
          complete_count += 1;
        }
      }

      log_recovery_count(acquired_count, "Freed acquired trigger(s).");
      log_recovery_count(complete_count, "Deleted complete trigger(s).");
      log_recovery_count(recovered_count, "Scheduled recoverable job(s) for recovery.");
      log_recovery_count(other_count, "Cleaned-up other failed job(s).");

      if instance.instance_id != self.config.instance_id {
        self.repos.schedulers.delete(&instance.instance_id).await?;
      }
      StoreMetrics::incr(&self.metrics.instances_recovered);
    }
    Ok(())
  }
}

fn log_recovery_count(count: usize, message: &str) {
  if count > 0 {
    info!(count, "ClusterManager: ......{}", message);
  } else {
    debug!(count, "ClusterManager: ......{}", message);
  }
}
