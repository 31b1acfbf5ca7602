//! In-process document store.
//!
//! Honors the same contract a real document-store backend must: atomic single-document
//! insert with a duplicate-key signal, compare-and-set state updates, and sorted,
//! limited finds. Clones share the same collections, so several job stores built from
//! clones of one `MemoryDocumentStore` behave like processes sharing one database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
  CalendarRepository, FiredTriggerRecord, FiredTriggerRepository, JobRepository, LockRecord,
  LockRepository, PausedTriggerGroupRepository, Repositories, SchedulerRepository,
  SchedulerStateRecord, StoreResult, TriggerRepository,
};
use crate::calendar::Calendar;
use crate::error::StoreError;
use crate::job::{JobDataMap, JobDetail, JobKey, TriggerKey};
use crate::lock::LockType;
use crate::matcher::GroupMatcher;
use crate::trigger::{MisfireInstruction, TriggerRecord, TriggerState};

/// Documents are keyed by `(instance name, natural key)`.
type Scoped<K> = (String, K);

#[derive(Default)]
struct Collections {
  jobs: BTreeMap<Scoped<JobKey>, JobDetail>,
  triggers: BTreeMap<Scoped<TriggerKey>, TriggerRecord>,
  fired_triggers: BTreeMap<Scoped<String>, FiredTriggerRecord>,
  schedulers: BTreeMap<Scoped<String>, SchedulerStateRecord>,
  locks: BTreeMap<Scoped<LockType>, LockRecord>,
  paused_groups: BTreeSet<Scoped<String>>,
  calendars: BTreeMap<Scoped<String>, Calendar>,
}

/// Shared in-memory backing for any number of instance names.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
  collections: Arc<Mutex<Collections>>,
  unavailable: Arc<AtomicBool>,
}

impl MemoryDocumentStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Repositories scoped to `instance_name`.
  pub fn repositories(&self, instance_name: impl Into<String>) -> Repositories {
    let scoped = Arc::new(MemoryRepository {
      instance_name: instance_name.into(),
      store: self.clone(),
    });
    Repositories {
      jobs: scoped.clone(),
      triggers: scoped.clone(),
      fired_triggers: scoped.clone(),
      schedulers: scoped.clone(),
      locks: scoped.clone(),
      paused_groups: scoped.clone(),
      calendars: scoped,
    }
  }

  /// While set, every operation fails with a backend error (simulated outage).
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }
}

struct MemoryRepository {
  instance_name: String,
  store: MemoryDocumentStore,
}

impl MemoryRepository {
  fn with<R>(&self, f: impl FnOnce(&mut Collections) -> R) -> StoreResult<R> {
    if self.store.unavailable.load(Ordering::SeqCst) {
      return Err(StoreError::Backend("document store unavailable".to_string()));
    }
    let mut collections = self.store.collections.lock();
    Ok(f(&mut collections))
  }

  fn scope<K>(&self, key: K) -> Scoped<K> {
    (self.instance_name.clone(), key)
  }

  fn owns<K>(&self, scoped: &Scoped<K>) -> bool {
    scoped.0 == self.instance_name
  }
}

fn sorted_unique(values: impl Iterator<Item = String>) -> Vec<String> {
  values.collect::<BTreeSet<_>>().into_iter().collect()
}

/// Acquisition order: next fire time ascending, then priority descending.
fn acquisition_order(mut candidates: Vec<&TriggerRecord>) -> Vec<TriggerKey> {
  candidates.sort_by(|a, b| {
    a.next_fire_time
      .cmp(&b.next_fire_time)
      .then_with(|| b.priority.cmp(&a.priority))
  });
  candidates.into_iter().map(|r| r.key.clone()).collect()
}

// --- Jobs ---

#[async_trait]
impl JobRepository for MemoryRepository {
  async fn insert(&self, job: &JobDetail) -> StoreResult<()> {
    let key = self.scope(job.key.clone());
    self.with(|c| {
      if c.jobs.contains_key(&key) {
        return Err(StoreError::DuplicateKey {
          collection: "jobs",
          key: job.key.to_string(),
        });
      }
      let mut stored = job.clone();
      stored.job_data.clear_dirty_flag();
      c.jobs.insert(key, stored);
      Ok(())
    })?
  }

  async fn upsert(&self, job: &JobDetail) -> StoreResult<()> {
    let key = self.scope(job.key.clone());
    let mut stored = job.clone();
    stored.job_data.clear_dirty_flag();
    self.with(|c| {
      c.jobs.insert(key, stored);
    })
  }

  async fn get(&self, key: &JobKey) -> StoreResult<Option<JobDetail>> {
    let key = self.scope(key.clone());
    self.with(|c| c.jobs.get(&key).cloned())
  }

  async fn exists(&self, key: &JobKey) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| c.jobs.contains_key(&key))
  }

  async fn delete(&self, key: &JobKey) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| c.jobs.remove(&key).is_some())
  }

  async fn update_job_data(&self, key: &JobKey, data: &JobDataMap) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| match c.jobs.get_mut(&key) {
      Some(job) => {
        job.job_data = data.clone();
        job.job_data.clear_dirty_flag();
        true
      }
      None => false,
    })
  }

  async fn keys(&self, matcher: &GroupMatcher) -> StoreResult<Vec<JobKey>> {
    self.with(|c| {
      c.jobs
        .keys()
        .filter(|k| self.owns(k) && matcher.is_match(&k.1.group))
        .map(|k| k.1.clone())
        .collect()
    })
  }

  async fn group_names(&self) -> StoreResult<Vec<String>> {
    self.with(|c| {
      sorted_unique(
        c.jobs
          .keys()
          .filter(|k| self.owns(k))
          .map(|k| k.1.group.clone()),
      )
    })
  }

  async fn count(&self) -> StoreResult<usize> {
    self.with(|c| c.jobs.keys().filter(|k| self.owns(k)).count())
  }

  async fn delete_all(&self) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.jobs.len();
      c.jobs.retain(|k, _| !self.owns(k));
      before - c.jobs.len()
    })
  }
}

// --- Triggers ---

#[async_trait]
impl TriggerRepository for MemoryRepository {
  async fn insert(&self, record: &TriggerRecord) -> StoreResult<()> {
    let key = self.scope(record.key.clone());
    self.with(|c| {
      if c.triggers.contains_key(&key) {
        return Err(StoreError::DuplicateKey {
          collection: "triggers",
          key: record.key.to_string(),
        });
      }
      let mut stored = record.clone();
      stored.job_data.clear_dirty_flag();
      c.triggers.insert(key, stored);
      Ok(())
    })?
  }

  async fn upsert(&self, record: &TriggerRecord) -> StoreResult<()> {
    let key = self.scope(record.key.clone());
    let mut stored = record.clone();
    stored.job_data.clear_dirty_flag();
    self.with(|c| {
      c.triggers.insert(key, stored);
    })
  }

  async fn get(&self, key: &TriggerKey) -> StoreResult<Option<TriggerRecord>> {
    let key = self.scope(key.clone());
    self.with(|c| c.triggers.get(&key).cloned())
  }

  async fn exists(&self, key: &TriggerKey) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| c.triggers.contains_key(&key))
  }

  async fn delete(&self, key: &TriggerKey) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| c.triggers.remove(&key).is_some())
  }

  async fn get_state(&self, key: &TriggerKey) -> StoreResult<Option<TriggerState>> {
    let key = self.scope(key.clone());
    self.with(|c| c.triggers.get(&key).map(|r| r.state))
  }

  async fn set_state(&self, key: &TriggerKey, to: TriggerState) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| match c.triggers.get_mut(&key) {
      Some(record) => {
        record.state = to;
        true
      }
      None => false,
    })
  }

  async fn compare_and_set_state(
    &self,
    key: &TriggerKey,
    from: &[TriggerState],
    to: TriggerState,
  ) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| match c.triggers.get_mut(&key) {
      Some(record) if from.contains(&record.state) => {
        record.state = to;
        true
      }
      _ => false,
    })
  }

  async fn transition_for_job(
    &self,
    job_key: &JobKey,
    from: &[TriggerState],
    to: TriggerState,
  ) -> StoreResult<usize> {
    self.with(|c| {
      let mut changed = 0;
      for (k, record) in c.triggers.iter_mut() {
        if self.owns(k)
          && &record.job_key == job_key
          && (from.is_empty() || from.contains(&record.state))
        {
          record.state = to;
          changed += 1;
        }
      }
      changed
    })
  }

  async fn transition_all(&self, from: &[TriggerState], to: TriggerState) -> StoreResult<usize> {
    self.with(|c| {
      let mut changed = 0;
      for (k, record) in c.triggers.iter_mut() {
        if self.owns(k) && from.contains(&record.state) {
          record.state = to;
          changed += 1;
        }
      }
      changed
    })
  }

  async fn set_fire_instance_id(
    &self,
    key: &TriggerKey,
    fire_instance_id: Option<&str>,
  ) -> StoreResult<bool> {
    let key = self.scope(key.clone());
    self.with(|c| match c.triggers.get_mut(&key) {
      Some(record) => {
        record.fire_instance_id = fire_instance_id.map(str::to_string);
        true
      }
      None => false,
    })
  }

  async fn for_job(&self, job_key: &JobKey) -> StoreResult<Vec<TriggerRecord>> {
    self.with(|c| {
      c.triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && &r.job_key == job_key)
        .map(|(_, r)| r.clone())
        .collect()
    })
  }

  async fn keys(&self, matcher: &GroupMatcher) -> StoreResult<Vec<TriggerKey>> {
    self.with(|c| {
      c.triggers
        .keys()
        .filter(|k| self.owns(k) && matcher.is_match(&k.1.group))
        .map(|k| k.1.clone())
        .collect()
    })
  }

  async fn keys_in_state(&self, state: TriggerState) -> StoreResult<Vec<TriggerKey>> {
    self.with(|c| {
      c.triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && r.state == state)
        .map(|(k, _)| k.1.clone())
        .collect()
    })
  }

  async fn keys_for_calendar(&self, calendar_name: &str) -> StoreResult<Vec<TriggerKey>> {
    self.with(|c| {
      c.triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && r.calendar_name.as_deref() == Some(calendar_name))
        .map(|(k, _)| k.1.clone())
        .collect()
    })
  }

  async fn group_names(&self) -> StoreResult<Vec<String>> {
    self.with(|c| {
      sorted_unique(
        c.triggers
          .keys()
          .filter(|k| self.owns(k))
          .map(|k| k.1.group.clone()),
      )
    })
  }

  async fn count(&self) -> StoreResult<usize> {
    self.with(|c| c.triggers.keys().filter(|k| self.owns(k)).count())
  }

  async fn find_to_acquire(
    &self,
    no_later_than: DateTime<Utc>,
    no_earlier_than: DateTime<Utc>,
    max_count: usize,
  ) -> StoreResult<Vec<TriggerKey>> {
    self.with(|c| {
      let candidates = c
        .triggers
        .iter()
        .filter(|(k, r)| {
          self.owns(k)
            && r.state == TriggerState::Waiting
            && r.next_fire_time.is_some_and(|nft| {
              nft <= no_later_than
                && (r.misfire_instruction == MisfireInstruction::IgnoreMisfirePolicy
                  || nft >= no_earlier_than)
            })
        })
        .map(|(_, r)| r)
        .collect();
      let mut keys = acquisition_order(candidates);
      keys.truncate(max_count);
      keys
    })
  }

  async fn count_misfired(&self, misfire_time: DateTime<Utc>) -> StoreResult<usize> {
    self.with(|c| {
      c.triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && is_misfired(r, misfire_time))
        .count()
    })
  }

  async fn find_misfired(
    &self,
    misfire_time: DateTime<Utc>,
    limit: Option<usize>,
  ) -> StoreResult<Vec<TriggerKey>> {
    self.with(|c| {
      let candidates = c
        .triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && is_misfired(r, misfire_time))
        .map(|(_, r)| r)
        .collect();
      let mut keys = acquisition_order(candidates);
      if let Some(limit) = limit {
        keys.truncate(limit);
      }
      keys
    })
  }

  async fn delete_all(&self) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.triggers.len();
      c.triggers.retain(|k, _| !self.owns(k));
      before - c.triggers.len()
    })
  }
}

fn is_misfired(record: &TriggerRecord, misfire_time: DateTime<Utc>) -> bool {
  record.state == TriggerState::Waiting
    && record.misfire_instruction != MisfireInstruction::IgnoreMisfirePolicy
    && record.next_fire_time.is_some_and(|nft| nft < misfire_time)
}

// --- Fired Triggers ---

#[async_trait]
impl FiredTriggerRepository for MemoryRepository {
  async fn insert(&self, record: &FiredTriggerRecord) -> StoreResult<()> {
    let key = self.scope(record.fire_instance_id.clone());
    self.with(|c| {
      if c.fired_triggers.contains_key(&key) {
        return Err(StoreError::DuplicateKey {
          collection: "fired_triggers",
          key: record.fire_instance_id.clone(),
        });
      }
      c.fired_triggers.insert(key, record.clone());
      Ok(())
    })?
  }

  async fn update(&self, record: &FiredTriggerRecord) -> StoreResult<bool> {
    let key = self.scope(record.fire_instance_id.clone());
    self.with(|c| match c.fired_triggers.get_mut(&key) {
      Some(existing) => {
        *existing = record.clone();
        true
      }
      None => false,
    })
  }

  async fn delete(&self, fire_instance_id: &str) -> StoreResult<bool> {
    let key = self.scope(fire_instance_id.to_string());
    self.with(|c| c.fired_triggers.remove(&key).is_some())
  }

  async fn for_trigger(&self, key: &TriggerKey) -> StoreResult<Vec<FiredTriggerRecord>> {
    self.with(|c| {
      c.fired_triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && &r.trigger_key == key)
        .map(|(_, r)| r.clone())
        .collect()
    })
  }

  async fn for_job(&self, job_key: &JobKey) -> StoreResult<Vec<FiredTriggerRecord>> {
    self.with(|c| {
      c.fired_triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && &r.job_key == job_key)
        .map(|(_, r)| r.clone())
        .collect()
    })
  }

  async fn for_instance(&self, instance_id: &str) -> StoreResult<Vec<FiredTriggerRecord>> {
    self.with(|c| {
      c.fired_triggers
        .iter()
        .filter(|(k, r)| self.owns(k) && r.instance_id == instance_id)
        .map(|(_, r)| r.clone())
        .collect()
    })
  }

  async fn delete_for_instance(&self, instance_id: &str) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.fired_triggers.len();
      c.fired_triggers
        .retain(|k, r| !(self.owns(k) && r.instance_id == instance_id));
      before - c.fired_triggers.len()
    })
  }

  async fn instance_ids(&self) -> StoreResult<Vec<String>> {
    self.with(|c| {
      sorted_unique(
        c.fired_triggers
          .iter()
          .filter(|(k, _)| self.owns(k))
          .map(|(_, r)| r.instance_id.clone()),
      )
    })
  }

  async fn delete_all(&self) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.fired_triggers.len();
      c.fired_triggers.retain(|k, _| !self.owns(k));
      before - c.fired_triggers.len()
    })
  }
}

// --- Scheduler Liveness ---

#[async_trait]
impl SchedulerRepository for MemoryRepository {
  async fn upsert(&self, record: &SchedulerStateRecord) -> StoreResult<()> {
    let key = self.scope(record.instance_id.clone());
    self.with(|c| {
      c.schedulers.insert(key, record.clone());
    })
  }

  async fn all(&self) -> StoreResult<Vec<SchedulerStateRecord>> {
    self.with(|c| {
      c.schedulers
        .iter()
        .filter(|(k, _)| self.owns(k))
        .map(|(_, r)| r.clone())
        .collect()
    })
  }

  async fn delete(&self, instance_id: &str) -> StoreResult<bool> {
    let key = self.scope(instance_id.to_string());
    self.with(|c| c.schedulers.remove(&key).is_some())
  }
}

// --- Locks ---

#[async_trait]
impl LockRepository for MemoryRepository {
  async fn try_insert(&self, record: &LockRecord) -> StoreResult<bool> {
    let key = self.scope(record.lock_type);
    self.with(|c| {
      if c.locks.contains_key(&key) {
        false
      } else {
        c.locks.insert(key, record.clone());
        true
      }
    })
  }

  async fn delete(&self, lock_type: LockType, token: &str) -> StoreResult<bool> {
    let key = self.scope(lock_type);
    self.with(|c| match c.locks.get(&key) {
      Some(record) if record.token == token => c.locks.remove(&key).is_some(),
      _ => false,
    })
  }

  async fn delete_expired(&self, acquired_before: DateTime<Utc>) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.locks.len();
      c.locks
        .retain(|k, r| !(self.owns(k) && r.acquired_at < acquired_before));
      before - c.locks.len()
    })
  }

  async fn get(&self, lock_type: LockType) -> StoreResult<Option<LockRecord>> {
    let key = self.scope(lock_type);
    self.with(|c| c.locks.get(&key).cloned())
  }
}

// --- Paused Trigger Groups ---

#[async_trait]
impl PausedTriggerGroupRepository for MemoryRepository {
  async fn add(&self, group: &str) -> StoreResult<bool> {
    let key = self.scope(group.to_string());
    self.with(|c| c.paused_groups.insert(key))
  }

  async fn remove_matching(&self, matcher: &GroupMatcher) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.paused_groups.len();
      c.paused_groups
        .retain(|k| !(self.owns(k) && matcher.is_match(&k.1)));
      before - c.paused_groups.len()
    })
  }

  async fn contains(&self, group: &str) -> StoreResult<bool> {
    let key = self.scope(group.to_string());
    self.with(|c| c.paused_groups.contains(&key))
  }

  async fn groups(&self) -> StoreResult<Vec<String>> {
    self.with(|c| {
      c.paused_groups
        .iter()
        .filter(|k| self.owns(k))
        .map(|k| k.1.clone())
        .collect()
    })
  }

  async fn delete_all(&self) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.paused_groups.len();
      c.paused_groups.retain(|k| !self.owns(k));
      before - c.paused_groups.len()
    })
  }
}

// --- Calendars ---

#[async_trait]
impl CalendarRepository for MemoryRepository {
  async fn insert(&self, name: &str, calendar: &Calendar) -> StoreResult<()> {
    let key = self.scope(name.to_string());
    self.with(|c| {
      if c.calendars.contains_key(&key) {
        return Err(StoreError::DuplicateKey {
          collection: "calendars",
          key: name.to_string(),
        });
      }
      c.calendars.insert(key, calendar.clone());
      Ok(())
    })?
  }

  async fn upsert(&self, name: &str, calendar: &Calendar) -> StoreResult<()> {
    let key = self.scope(name.to_string());
    self.with(|c| {
      c.calendars.insert(key, calendar.clone());
    })
  }

  async fn get(&self, name: &str) -> StoreResult<Option<Calendar>> {
    let key = self.scope(name.to_string());
    self.with(|c| c.calendars.get(&key).cloned())
  }

  async fn exists(&self, name: &str) -> StoreResult<bool> {
    let key = self.scope(name.to_string());
    self.with(|c| c.calendars.contains_key(&key))
  }

  async fn delete(&self, name: &str) -> StoreResult<bool> {
    let key = self.scope(name.to_string());
    self.with(|c| c.calendars.remove(&key).is_some())
  }

  async fn names(&self) -> StoreResult<Vec<String>> {
    self.with(|c| {
      c.calendars
        .keys()
        .filter(|k| self.owns(k))
        .map(|k| k.1.clone())
        .collect()
    })
  }

  async fn count(&self) -> StoreResult<usize> {
    self.with(|c| c.calendars.keys().filter(|k| self.owns(k)).count())
  }

  async fn delete_all(&self) -> StoreResult<usize> {
    self.with(|c| {
      let before = c.calendars.len();
      c.calendars.retain(|k, _| !self.owns(k));
      before - c.calendars.len()
    })
  }
}
