//! Typed façades over the seven record collections.
//!
//! Repositories hold no business logic. Every implementation scopes its documents by
//! the instance name it was created for and enforces `(instance name, natural key)`
//! uniqueness. Filters the engine needs are expressed as dedicated methods so a
//! document-store backend can map each one onto a single indexed query.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::error::StoreError;
use crate::job::{JobDataMap, JobDetail, JobKey, TriggerKey};
use crate::lock::LockType;
use crate::matcher::GroupMatcher;
use crate::trigger::{TriggerRecord, TriggerState};

pub use memory::MemoryDocumentStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// --- Records ---

/// One in-flight firing, from acquisition until completion or recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
  pub fire_instance_id: String,
  /// The scheduler instance that acquired the trigger.
  pub instance_id: String,
  pub trigger_key: TriggerKey,
  pub job_key: JobKey,
  /// `Acquired` until the trigger fires, then `Executing`.
  pub state: TriggerState,
  pub fired_at: DateTime<Utc>,
  pub scheduled_at: Option<DateTime<Utc>>,
  pub priority: i32,
  pub concurrent_execution_disallowed: bool,
  pub requests_recovery: bool,
}

/// Liveness row of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
  pub instance_id: String,
  pub last_checkin: DateTime<Utc>,
  pub checkin_interval_ms: u64,
}

/// A held lease on one [`LockType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
  pub lock_type: LockType,
  pub token: String,
  pub holder: String,
  pub acquired_at: DateTime<Utc>,
}

// --- Repository Traits ---

#[async_trait]
pub trait JobRepository: Send + Sync {
  /// Fails with [`StoreError::DuplicateKey`] if the job exists.
  async fn insert(&self, job: &JobDetail) -> StoreResult<()>;
  async fn upsert(&self, job: &JobDetail) -> StoreResult<()>;
  async fn get(&self, key: &JobKey) -> StoreResult<Option<JobDetail>>;
  async fn exists(&self, key: &JobKey) -> StoreResult<bool>;
  async fn delete(&self, key: &JobKey) -> StoreResult<bool>;
  async fn update_job_data(&self, key: &JobKey, data: &JobDataMap) -> StoreResult<bool>;
  async fn keys(&self, matcher: &GroupMatcher) -> StoreResult<Vec<JobKey>>;
  async fn group_names(&self) -> StoreResult<Vec<String>>;
  async fn count(&self) -> StoreResult<usize>;
  async fn delete_all(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait TriggerRepository: Send + Sync {
  async fn insert(&self, record: &TriggerRecord) -> StoreResult<()>;
  async fn upsert(&self, record: &TriggerRecord) -> StoreResult<()>;
  async fn get(&self, key: &TriggerKey) -> StoreResult<Option<TriggerRecord>>;
  async fn exists(&self, key: &TriggerKey) -> StoreResult<bool>;
  async fn delete(&self, key: &TriggerKey) -> StoreResult<bool>;
  async fn get_state(&self, key: &TriggerKey) -> StoreResult<Option<TriggerState>>;

  /// Sets the state unconditionally.
  async fn set_state(&self, key: &TriggerKey, to: TriggerState) -> StoreResult<bool>;
  /// Compare-and-set: changes the state only if it is currently one of `from`.
  async fn compare_and_set_state(
    &self,
    key: &TriggerKey,
    from: &[TriggerState],
    to: TriggerState,
  ) -> StoreResult<bool>;
  /// Changes every trigger of `job_key` whose state is in `from` (any state when empty).
  async fn transition_for_job(
    &self,
    job_key: &JobKey,
    from: &[TriggerState],
    to: TriggerState,
  ) -> StoreResult<usize>;
  /// Changes every trigger whose state is in `from`.
  async fn transition_all(&self, from: &[TriggerState], to: TriggerState) -> StoreResult<usize>;
  async fn set_fire_instance_id(
    &self,
    key: &TriggerKey,
    fire_instance_id: Option<&str>,
  ) -> StoreResult<bool>;

  async fn for_job(&self, job_key: &JobKey) -> StoreResult<Vec<TriggerRecord>>;
  async fn keys(&self, matcher: &GroupMatcher) -> StoreResult<Vec<TriggerKey>>;
  async fn keys_in_state(&self, state: TriggerState) -> StoreResult<Vec<TriggerKey>>;
  async fn keys_for_calendar(&self, calendar_name: &str) -> StoreResult<Vec<TriggerKey>>;
  async fn group_names(&self) -> StoreResult<Vec<String>>;
  async fn count(&self) -> StoreResult<usize>;

  /// Waiting triggers with `next_fire_time <= no_later_than` and, unless they ignore
  /// misfires, `next_fire_time >= no_earlier_than`. Ordered by next fire time
  /// ascending, then priority descending.
  async fn find_to_acquire(
    &self,
    no_later_than: DateTime<Utc>,
    no_earlier_than: DateTime<Utc>,
    max_count: usize,
  ) -> StoreResult<Vec<TriggerKey>>;
  /// Number of Waiting, misfire-aware triggers with `next_fire_time < misfire_time`.
  async fn count_misfired(&self, misfire_time: DateTime<Utc>) -> StoreResult<usize>;
  /// The triggers counted by `count_misfired`, in acquisition order, at most `limit`.
  async fn find_misfired(
    &self,
    misfire_time: DateTime<Utc>,
    limit: Option<usize>,
  ) -> StoreResult<Vec<TriggerKey>>;
  async fn delete_all(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait FiredTriggerRepository: Send + Sync {
  async fn insert(&self, record: &FiredTriggerRecord) -> StoreResult<()>;
  /// Replaces the record with the same fire instance id; false if there is none.
  async fn update(&self, record: &FiredTriggerRecord) -> StoreResult<bool>;
  async fn delete(&self, fire_instance_id: &str) -> StoreResult<bool>;
  async fn for_trigger(&self, key: &TriggerKey) -> StoreResult<Vec<FiredTriggerRecord>>;
  async fn for_job(&self, job_key: &JobKey) -> StoreResult<Vec<FiredTriggerRecord>>;
  async fn for_instance(&self, instance_id: &str) -> StoreResult<Vec<FiredTriggerRecord>>;
  async fn delete_for_instance(&self, instance_id: &str) -> StoreResult<usize>;
  /// Distinct owning instance ids across all records.
  async fn instance_ids(&self) -> StoreResult<Vec<String>>;
  async fn delete_all(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait SchedulerRepository: Send + Sync {
  async fn upsert(&self, record: &SchedulerStateRecord) -> StoreResult<()>;
  async fn all(&self) -> StoreResult<Vec<SchedulerStateRecord>>;
  async fn delete(&self, instance_id: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait LockRepository: Send + Sync {
  /// Atomic insert. `Ok(false)` when a lease on the same lock type already exists.
  async fn try_insert(&self, record: &LockRecord) -> StoreResult<bool>;
  /// Deletes the lease only if it still carries `token`.
  async fn delete(&self, lock_type: LockType, token: &str) -> StoreResult<bool>;
  /// Deletes leases acquired before `acquired_before`.
  async fn delete_expired(&self, acquired_before: DateTime<Utc>) -> StoreResult<usize>;
  async fn get(&self, lock_type: LockType) -> StoreResult<Option<LockRecord>>;
}

#[async_trait]
pub trait PausedTriggerGroupRepository: Send + Sync {
  /// Idempotent; returns false if the marker already existed.
  async fn add(&self, group: &str) -> StoreResult<bool>;
  async fn remove_matching(&self, matcher: &GroupMatcher) -> StoreResult<usize>;
  async fn contains(&self, group: &str) -> StoreResult<bool>;
  async fn groups(&self) -> StoreResult<Vec<String>>;
  async fn delete_all(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait CalendarRepository: Send + Sync {
  async fn insert(&self, name: &str, calendar: &Calendar) -> StoreResult<()>;
  async fn upsert(&self, name: &str, calendar: &Calendar) -> StoreResult<()>;
  async fn get(&self, name: &str) -> StoreResult<Option<Calendar>>;
  async fn exists(&self, name: &str) -> StoreResult<bool>;
  async fn delete(&self, name: &str) -> StoreResult<bool>;
  async fn names(&self) -> StoreResult<Vec<String>>;
  async fn count(&self) -> StoreResult<usize>;
  async fn delete_all(&self) -> StoreResult<usize>;
}

// --- Bundle ---

/// All repositories of one instance name.
#[derive(Clone)]
pub struct Repositories {
  pub jobs: Arc<dyn JobRepository>,
  pub triggers: Arc<dyn TriggerRepository>,
  pub fired_triggers: Arc<dyn FiredTriggerRepository>,
  pub schedulers: Arc<dyn SchedulerRepository>,
  pub locks: Arc<dyn LockRepository>,
  pub paused_groups: Arc<dyn PausedTriggerGroupRepository>,
  pub calendars: Arc<dyn CalendarRepository>,
}
