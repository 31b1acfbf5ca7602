//! Pausing and resuming triggers, groups and jobs.

use std::collections::BTreeSet;

use tracing::debug;

use super::{JobStore, ALL_GROUPS_PAUSED};
use crate::error::Result;
use crate::job::{JobKey, TriggerKey};
use crate::lock::LockType;
use crate::matcher::GroupMatcher;
use crate::signal::SchedulingSignal;
use crate::trigger::TriggerState;

impl JobStore {
  // --- Pause ---

  pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || self.pause_trigger_tx(key))
      .await
  }

  /// Pauses every trigger in the matching groups and marks those groups paused, so
  /// triggers added to them later start Paused. An `Equals` matcher marks its group
  /// even if it holds no trigger yet. Returns the paused group names.
  pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
    self
      .in_lock(LockType::TriggerAccess, || self.pause_triggers_tx(matcher))
      .await
  }

  pub async fn pause_job(&self, key: &JobKey) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || self.pause_job_tx(key))
      .await
  }

  /// Pauses every trigger of the matching jobs. Returns the matched job groups.
  pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let mut groups = BTreeSet::new();
        for key in self.repos.jobs.keys(matcher).await? {
          self.pause_job_tx(&key).await?;
          groups.insert(key.group);
        }
        Ok(groups.into_iter().collect())
      })
      .await
  }

  /// Pauses every group, and every group created until the next `resume_all`.
  pub async fn pause_all(&self) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        for group in self.repos.triggers.group_names().await? {
          self.pause_triggers_tx(&GroupMatcher::equals(group)).await?;
        }
        self.repos.paused_groups.add(ALL_GROUPS_PAUSED).await?;
        debug!("Paused all trigger groups");
        Ok(())
      })
      .await
  }

  async fn pause_trigger_tx(&self, key: &TriggerKey) -> Result<()> {
    let Some(record) = self.repos.triggers.get(key).await? else {
      return Ok(());
    };
    let paused = match record.state {
      TriggerState::Waiting => TriggerState::Paused,
      TriggerState::Acquired => {
        let non_concurrent = self
          .repos
          .jobs
          .get(&record.job_key)
          .await?
          .is_some_and(|job| job.concurrent_execution_disallowed);
        if non_concurrent {
          TriggerState::PausedBlocked
        } else {
          TriggerState::Paused
        }
      }
      TriggerState::Blocked => TriggerState::PausedBlocked,
      _ => return Ok(()),
    };
    if self
      .repos
      .triggers
      .compare_and_set_state(key, &[record.state], paused)
      .await?
    {
      debug!(trigger_key = %key, from = ?record.state, to = ?paused, "Paused trigger");
    }
    Ok(())
  }

  async fn pause_triggers_tx(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
    let groups: Vec<String> = match matcher.exact_group() {
      Some(group) => vec![group.to_string()],
      None => self
        .repos
        .triggers
        .group_names()
        .await?
        .into_iter()
        .filter(|g| matcher.is_match(g))
        .collect(),
    };
    for key in self.repos.triggers.keys(matcher).await? {
      self.pause_trigger_tx(&key).await?;
    }
    for group in &groups {
      self.repos.paused_groups.add(group).await?;
    }
    debug!(?groups, "Paused trigger groups");
    Ok(groups)
  }

  async fn pause_job_tx(&self, key: &JobKey) -> Result<()> {
    for record in self.repos.triggers.for_job(key).await? {
      self.pause_trigger_tx(&record.key).await?;
    }
    Ok(())
  }

  // --- Resume ---

  /// Resumes a Paused or PausedBlocked trigger. It returns to Waiting (or Blocked while
  /// its non-concurrent job executes); if it missed its fire time meanwhile, its misfire
  /// instruction is applied first. A fire time counts as missed once it is older than
  /// the misfire threshold, the same rule the misfire handler uses.
  pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
    let mut signals = SchedulingSignal::new();
    let sig = &mut signals;
    self
      .in_lock(LockType::TriggerAccess, move || async move {
        self.resume_trigger_tx(sig, key).await
      })
      .await?;
    signals.dispatch(self.signaler.as_ref());
    Ok(())
  }

  /// Clears the paused markers of the matching groups and resumes their triggers.
  /// Returns the groups of the resumed triggers.
  pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
    let mut signals = SchedulingSignal::new();
    let sig = &mut signals;
    let groups = self
      .in_lock(LockType::TriggerAccess, move || async move {
        self.resume_triggers_tx(sig, matcher).await
      })
      .await?;
    signals.dispatch(self.signaler.as_ref());
    Ok(groups)
  }

  pub async fn resume_job(&self, key: &JobKey) -> Result<()> {
    let mut signals = SchedulingSignal::new();
    let sig = &mut signals;
    self
      .in_lock(LockType::TriggerAccess, move || async move {
        self.resume_job_tx(sig, key).await
      })
      .await?;
    signals.dispatch(self.signaler.as_ref());
    Ok(())
  }

  /// Resumes every trigger of the matching jobs. Returns the matched job groups.
  pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
    let mut signals = SchedulingSignal::new();
    let sig = &mut signals;
    let groups = self
      .in_lock(LockType::TriggerAccess, move || async move {
        let mut groups = BTreeSet::new();
        for key in self.repos.jobs.keys(matcher).await? {
          self.resume_job_tx(sig, &key).await?;
          groups.insert(key.group);
        }
        Ok(groups.into_iter().collect())
      })
      .await?;
    signals.dispatch(self.signaler.as_ref());
    Ok(groups)
  }

  /// Resumes every group and removes all paused markers.
  pub async fn resume_all(&self) -> Result<()> {
    let mut signals = SchedulingSignal::new();
    let sig = &mut signals;
    self
      .in_lock(LockType::TriggerAccess, move || async move {
        for group in self.repos.triggers.group_names().await? {
          self
            .resume_triggers_tx(sig, &GroupMatcher::equals(group))
            .await?;
        }
        self.repos.paused_groups.delete_all().await?;
        debug!("Resumed all trigger groups");
        Ok(())
      })
      .await?;
    signals.dispatch(self.signaler.as_ref());
    Ok(())
  }

  async fn resume_trigger_tx(&self, signals: &mut SchedulingSignal, key: &TriggerKey) -> Result<()> {
    let Some((trigger, state)) = self.load_trigger(key).await? else {
      return Ok(());
    };
    if !matches!(state, TriggerState::Paused | TriggerState::PausedBlocked) {
      return Ok(());
    }
    let Some(next_fire_time) = trigger.next_fire_time else {
      return Ok(());
    };

    let resumed = self
      .check_blocked_state(&trigger.job_key, TriggerState::Waiting)
      .await?;

    if next_fire_time <= self.misfire_time() {
      let updated = self
        .do_update_of_misfired_trigger(trigger, resumed, true, false)
        .await?;
      if let Some(next) = updated.next_fire_time {
        signals.raise(Some(next));
      }
      debug!(trigger_key = %key, "Resumed misfired trigger");
    } else if self
      .repos
      .triggers
      .compare_and_set_state(key, &[state], resumed)
      .await?
    {
      debug!(trigger_key = %key, to = ?resumed, "Resumed trigger");
    }
    Ok(())
  }

  async fn resume_triggers_tx(
    &self,
    signals: &mut SchedulingSignal,
    matcher: &GroupMatcher,
  ) -> Result<Vec<String>> {
    self.repos.paused_groups.remove_matching(matcher).await?;
    let mut groups = BTreeSet::new();
    for key in self.repos.triggers.keys(matcher).await? {
      self.resume_trigger_tx(signals, &key).await?;
      groups.insert(key.group);
    }
    Ok(groups.into_iter().collect())
  }

  async fn resume_job_tx(&self, signals: &mut SchedulingSignal, key: &JobKey) -> Result<()> {
    for record in self.repos.triggers.for_job(key).await? {
      self.resume_trigger_tx(signals, &record.key).await?;
    }
    Ok(())
  }
}
