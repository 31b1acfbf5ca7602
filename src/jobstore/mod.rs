//! The persistent, cluster-aware job store.
//!
//! [`JobStore`] is a cheap-to-clone handle. Every mutating operation runs inside the
//! `TriggerAccess` lock (cluster check-in additionally takes `StateAccess` first);
//! read-only queries go straight to the repositories.

mod firing;
mod pause;
mod recovery;

use std::fmt;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::try_join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::cluster::ClusterManager;
use crate::error::{ConfigError, JobStoreError, Result, ShutdownError, StoreError};
use crate::job::{JobDetail, JobKey, TriggerKey};
use crate::lock::{self, LockManager, LockRetryPolicy, LockType, StoreLockManager};
use crate::matcher::GroupMatcher;
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::misfire::MisfireHandler;
use crate::repository::{MemoryDocumentStore, Repositories};
use crate::signal::{NoopSignaler, SchedulerSignaler};
use crate::trigger::{Trigger, TriggerRecord, TriggerState, TriggerStatus};

pub use recovery::RecoverMisfiredJobsResult;

/// Paused-group marker meaning "every group, including ones created later".
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";
/// Group of the one-shot triggers that re-run jobs of failed instances.
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";
/// Default instance id of a non-clustered store. It stays the same across restarts, so
/// startup recovery finds the fired records of the previous run.
pub const NON_CLUSTERED_INSTANCE_ID: &str = "NON_CLUSTERED";

// Job data keys carried by recovery triggers.
pub const FAILED_JOB_ORIGINAL_TRIGGER_NAME: &str = "QRTZ_FAILED_JOB_ORIG_TRIGGER_NAME";
pub const FAILED_JOB_ORIGINAL_TRIGGER_GROUP: &str = "QRTZ_FAILED_JOB_ORIG_TRIGGER_GROUP";
pub const FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME: &str =
  "QRTZ_FAILED_JOB_ORIG_TRIGGER_FIRETIME_IN_MILLISECONDS_AS_STRING";
pub const FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME: &str =
  "QRTZ_FAILED_JOB_ORIG_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS_AS_STRING";

// --- Configuration ---

/// Validated settings of one job store instance. See [`JobStoreBuilder`] for defaults.
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
  /// Logical cluster identity shared by all cooperating processes.
  pub instance_name: String,
  /// Identity of this process within the cluster.
  pub instance_id: String,
  pub misfire_threshold: Duration,
  pub max_misfires_to_handle_at_a_time: usize,
  /// Minimum pause of a background loop after a failed pass.
  pub db_retry_interval: Duration,
  pub clustered: bool,
  pub cluster_checkin_interval: Duration,
  /// Grace period added to a member's check-in interval before it counts as failed.
  pub cluster_checkin_misfire_threshold: Duration,
  /// Count misfires without the lock before taking it.
  pub double_check_lock_misfire_handler: bool,
  /// Abort the background loops' in-progress pass on shutdown instead of letting it finish.
  pub make_threads_daemon: bool,
  pub lock_retry: LockRetryPolicy,
  pub lock_lease_ttl: Duration,
}

impl Default for JobStoreConfig {
  fn default() -> Self {
    Self {
      instance_name: "TurnkeeperScheduler".to_string(),
      instance_id: NON_CLUSTERED_INSTANCE_ID.to_string(),
      misfire_threshold: Duration::from_secs(60),
      max_misfires_to_handle_at_a_time: 20,
      db_retry_interval: Duration::from_secs(15),
      clustered: false,
      cluster_checkin_interval: Duration::from_millis(7_500),
      cluster_checkin_misfire_threshold: Duration::from_millis(7_500),
      double_check_lock_misfire_handler: true,
      make_threads_daemon: false,
      lock_retry: LockRetryPolicy::default(),
      lock_lease_ttl: lock::store::DEFAULT_LEASE_TTL,
    }
  }
}

/// Builder for [`JobStore`].
///
/// # Example
///
/// ```no_run
/// use turnkeeper_jobstore::{JobStore, MemoryDocumentStore};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = JobStore::builder()
///     .instance_name("billing")
///     .clustered(true)
///     .cluster_checkin_interval(Duration::from_secs(5))
///     .memory_store(&MemoryDocumentStore::new())
///     .build()?;
/// store.scheduler_started().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct JobStoreBuilder {
  config: JobStoreConfig,
  repositories: Option<Repositories>,
  memory_store: Option<MemoryDocumentStore>,
  lock_manager: Option<Arc<dyn LockManager>>,
  signaler: Option<Arc<dyn SchedulerSignaler>>,
}

impl JobStoreBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn instance_name(mut self, name: impl Into<String>) -> Self {
    self.config.instance_name = name.into();
    self
  }

  pub fn instance_id(mut self, id: impl Into<String>) -> Self {
    self.config.instance_id = id.into();
    self
  }

  pub fn misfire_threshold(mut self, threshold: Duration) -> Self {
    self.config.misfire_threshold = threshold;
    self
  }

  pub fn max_misfires_to_handle_at_a_time(mut self, max: usize) -> Self {
    self.config.max_misfires_to_handle_at_a_time = max;
    self
  }

  pub fn db_retry_interval(mut self, interval: Duration) -> Self {
    self.config.db_retry_interval = interval;
    self
  }

  pub fn clustered(mut self, clustered: bool) -> Self {
    self.config.clustered = clustered;
    self
  }

  pub fn cluster_checkin_interval(mut self, interval: Duration) -> Self {
    self.config.cluster_checkin_interval = interval;
    self
  }

  pub fn cluster_checkin_misfire_threshold(mut self, threshold: Duration) -> Self {
    self.config.cluster_checkin_misfire_threshold = threshold;
    self
  }

  pub fn double_check_lock_misfire_handler(mut self, enabled: bool) -> Self {
    self.config.double_check_lock_misfire_handler = enabled;
    self
  }

  pub fn make_threads_daemon(mut self, daemon: bool) -> Self {
    self.config.make_threads_daemon = daemon;
    self
  }

  /// Retry policy of the default store-backed lock manager.
  pub fn lock_retry(mut self, retry: LockRetryPolicy) -> Self {
    self.config.lock_retry = retry;
    self
  }

  /// Lease TTL of the default store-backed lock manager.
  pub fn lock_lease_ttl(mut self, ttl: Duration) -> Self {
    self.config.lock_lease_ttl = ttl;
    self
  }

  pub fn repositories(mut self, repositories: Repositories) -> Self {
    self.repositories = Some(repositories);
    self
  }

  /// Uses `store`, scoped to the configured instance name at build time.
  pub fn memory_store(mut self, store: &MemoryDocumentStore) -> Self {
    self.memory_store = Some(store.clone());
    self
  }

  /// Replaces the default store-backed lock manager.
  pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
    self.lock_manager = Some(locks);
    self
  }

  pub fn signaler(mut self, signaler: Arc<dyn SchedulerSignaler>) -> Self {
    self.signaler = Some(signaler);
    self
  }

  /// Validates the configuration and creates the store. No background task starts
  /// until [`JobStore::scheduler_started`].
  pub fn build(self) -> std::result::Result<JobStore, ConfigError> {
    let mut config = self.config;
    // Cluster members need distinct ids; generate one unless the caller chose it.
    if config.clustered && config.instance_id == NON_CLUSTERED_INSTANCE_ID {
      config.instance_id = Uuid::new_v4().to_string();
    }
    if config.misfire_threshold < Duration::from_millis(1) {
      return Err(ConfigError::MisfireThresholdTooSmall);
    }
    if config.max_misfires_to_handle_at_a_time == 0 {
      return Err(ConfigError::ZeroMaxMisfires);
    }
    if config.cluster_checkin_interval.is_zero() {
      return Err(ConfigError::ZeroCheckinInterval);
    }
    if config.instance_name.is_empty() {
      return Err(ConfigError::EmptyInstanceName);
    }
    if config.instance_id.is_empty() {
      return Err(ConfigError::EmptyInstanceId);
    }

    let repos = match (self.repositories, self.memory_store) {
      (Some(repos), _) => repos,
      (None, Some(store)) => store.repositories(config.instance_name.clone()),
      (None, None) => return Err(ConfigError::MissingRepositories),
    };

    let locks = self.lock_manager.unwrap_or_else(|| {
      Arc::new(
        StoreLockManager::new(repos.locks.clone())
          .with_retry_policy(config.lock_retry.clone())
          .with_lease_ttl(config.lock_lease_ttl),
      )
    });
    let signaler = self.signaler.unwrap_or_else(|| Arc::new(NoopSignaler));

    let (shutdown_tx, _) = watch::channel(false);
    let fire_seed = Utc::now().timestamp_millis().max(0) as u64;

    info!(
      instance_name = %config.instance_name,
      instance_id = %config.instance_id,
      clustered = config.clustered,
      "Job store configured"
    );

    Ok(JobStore {
      requestor_id: Arc::from(Uuid::new_v4().to_string()),
      config: Arc::new(config),
      repos,
      locks,
      signaler,
      metrics: StoreMetrics::new(),
      fire_counter: Arc::new(AtomicU64::new(fire_seed)),
      cluster: Arc::new(parking_lot::Mutex::new(recovery::ClusterState::new())),
      lifecycle: Arc::new(Mutex::new(Lifecycle {
        phase: Phase::Created,
        shutdown_tx,
        handles: Vec::new(),
      })),
    })
  }
}

// --- Lifecycle State ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Created,
  Started,
  ShutDown,
}

struct Lifecycle {
  phase: Phase,
  shutdown_tx: watch::Sender<bool>,
  handles: Vec<(&'static str, JoinHandle<()>)>,
}

// --- Job Store Handle ---

/// Handle to a job store. Clones share all state.
#[derive(Clone)]
pub struct JobStore {
  config: Arc<JobStoreConfig>,
  repos: Repositories,
  locks: Arc<dyn LockManager>,
  signaler: Arc<dyn SchedulerSignaler>,
  metrics: StoreMetrics,
  /// Constant lock requestor id of this process.
  requestor_id: Arc<str>,
  fire_counter: Arc<AtomicU64>,
  cluster: Arc<parking_lot::Mutex<recovery::ClusterState>>,
  lifecycle: Arc<Mutex<Lifecycle>>,
}

impl fmt::Debug for JobStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobStore")
      .field("config", &self.config)
      .field("requestor_id", &self.requestor_id)
      .field("repos", &format_args!("Repositories"))
      .field("locks", &format_args!("Arc<dyn LockManager>"))
      .finish()
  }
}

impl JobStore {
  pub fn builder() -> JobStoreBuilder {
    JobStoreBuilder::new()
  }

  pub fn config(&self) -> &JobStoreConfig {
    &self.config
  }

  pub fn instance_id(&self) -> &str {
    &self.config.instance_id
  }

  pub fn instance_name(&self) -> &str {
    &self.config.instance_name
  }

  pub fn is_clustered(&self) -> bool {
    self.config.clustered
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  pub(crate) fn metrics(&self) -> &StoreMetrics {
    &self.metrics
  }

  pub(crate) fn signaler(&self) -> &dyn SchedulerSignaler {
    self.signaler.as_ref()
  }

  // --- Lifecycle ---

  /// Brings the store online.
  ///
  /// Clustered: runs the first cluster check-in (which recovers this instance's own
  /// leftovers and any failed members) and starts the cluster manager. Otherwise runs
  /// startup recovery. Then starts the misfire handler.
  pub async fn scheduler_started(&self) -> Result<()> {
    let mut lifecycle = self.lifecycle.lock().await;
    match lifecycle.phase {
      Phase::Created => {}
      Phase::Started => {
        warn!(instance_id = %self.config.instance_id, "Job store already started");
        return Ok(());
      }
      Phase::ShutDown => {
        return Err(JobStoreError::InvalidArgument(
          "Job store has been shut down and cannot be restarted".to_string(),
        ));
      }
    }

    if self.config.clustered {
      let mut manager = ClusterManager::new(self.clone(), lifecycle.shutdown_tx.subscribe());
      manager.initialize().await;
      lifecycle
        .handles
        .push(("cluster-manager", tokio::spawn(manager.run())));
    } else {
      self.recover_jobs().await?;
    }

    let handler = MisfireHandler::new(self.clone(), lifecycle.shutdown_tx.subscribe());
    lifecycle
      .handles
      .push(("misfire-handler", tokio::spawn(handler.run())));
    lifecycle.phase = Phase::Started;

    info!(
      instance_id = %self.config.instance_id,
      clustered = self.config.clustered,
      "Job store started"
    );
    Ok(())
  }

  /// Stops the background loops and waits for them (up to `timeout`).
  ///
  /// A clustered store also removes its own liveness row so other members do not
  /// treat it as failed.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> std::result::Result<(), ShutdownError> {
    let (handles, was_started) = {
      let mut lifecycle = self.lifecycle.lock().await;
      if lifecycle.phase == Phase::ShutDown {
        return Err(ShutdownError::AlreadyShuttingDown);
      }
      let was_started = lifecycle.phase == Phase::Started;
      lifecycle.phase = Phase::ShutDown;
      if lifecycle.shutdown_tx.send(true).is_err() {
        debug!("No background task was listening for shutdown.");
      }
      (std::mem::take(&mut lifecycle.handles), was_started)
    };

    info!(instance_id = %self.config.instance_id, "Shutting down job store...");
    if self.config.make_threads_daemon {
      for (_, handle) in &handles {
        handle.abort();
      }
    }

    let result = await_background_tasks(handles, timeout).await;

    if was_started && self.config.clustered {
      match self.repos.schedulers.delete(&self.config.instance_id).await {
        Ok(_) => debug!(instance_id = %self.config.instance_id, "Removed scheduler state"),
        Err(e) => error!(error = %e, "Failed to remove scheduler state during shutdown"),
      }
    }
    result
  }

  // --- Transactions ---

  /// Runs `body` inside `lock_type`, recording the lock wait.
  pub(crate) async fn in_lock<T, F, Fut>(&self, lock_type: LockType, body: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let wait = Instant::now();
    let metrics = &self.metrics;
    lock::execute_in_lock(self.locks.as_ref(), lock_type, &self.requestor_id, move || {
      metrics.lock_wait.record(wait.elapsed());
      body()
    })
    .await
  }

  pub(crate) fn misfire_time(&self) -> DateTime<Utc> {
    Utc::now() - to_chrono(self.config.misfire_threshold)
  }

  async fn load_trigger(&self, key: &TriggerKey) -> Result<Option<(Trigger, TriggerState)>> {
    match self.repos.triggers.get(key).await? {
      Some(record) => Ok(Some((record.decode()?, record.state))),
      None => Ok(None),
    }
  }

  // --- Jobs ---

  pub async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || {
        self.store_job_tx(job, replace_existing)
      })
      .await
  }

  async fn store_job_tx(&self, job: &JobDetail, replace_existing: bool) -> Result<()> {
    if self.repos.jobs.exists(&job.key).await? {
      if !replace_existing {
        return Err(JobStoreError::already_exists("job", &job.key));
      }
      self.repos.jobs.upsert(job).await?;
    } else {
      self
        .repos
        .jobs
        .insert(job)
        .await
        .map_err(|e| insert_error("job", &job.key, e))?;
    }
    debug!(job_key = %job.key, "Stored job");
    Ok(())
  }

  /// Removes the job and all of its triggers.
  pub async fn remove_job(&self, key: &JobKey) -> Result<bool> {
    self
      .in_lock(LockType::TriggerAccess, || self.remove_job_tx(key))
      .await
  }

  /// Removes each job in one transaction; each item reports its own outcome.
  pub async fn remove_jobs(&self, keys: &[JobKey]) -> Result<Vec<Result<bool>>> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
          results.push(self.remove_job_tx(key).await);
        }
        Ok(results)
      })
      .await
  }

  async fn remove_job_tx(&self, key: &JobKey) -> Result<bool> {
    for record in self.repos.triggers.for_job(key).await? {
      self.repos.triggers.delete(&record.key).await?;
    }
    let removed = self.repos.jobs.delete(key).await?;
    if removed {
      debug!(job_key = %key, "Removed job");
    }
    Ok(removed)
  }

  pub async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
    Ok(self.repos.jobs.get(key).await?)
  }

  pub async fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
    Ok(self.repos.jobs.exists(key).await?)
  }

  // --- Triggers ---

  /// Stores a trigger for an existing job.
  ///
  /// The trigger starts Paused when its group (or every group) is paused, and Blocked
  /// when its job disallows concurrent execution and is executing right now.
  pub async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || {
        self.store_trigger_tx(
          trigger,
          None,
          replace_existing,
          TriggerState::Waiting,
          false,
          false,
        )
      })
      .await
  }

  /// Stores a new job with its first trigger. Nothing is written when either one
  /// already exists or the trigger belongs to another job.
  pub async fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        check_trigger_targets(job, trigger)?;
        if self.repos.jobs.exists(&job.key).await? {
          return Err(JobStoreError::already_exists("job", &job.key));
        }
        if self.repos.triggers.exists(&trigger.key).await? {
          return Err(JobStoreError::already_exists("trigger", &trigger.key));
        }
        self.store_job_tx(job, false).await?;
        self
          .store_trigger_tx(trigger, Some(job), false, TriggerState::Waiting, false, false)
          .await
      })
      .await
  }

  /// Stores several jobs with their triggers in one transaction.
  ///
  /// Nothing is written if a trigger belongs to a job other than the one it is listed
  /// with, or, without `replace`, if any job or trigger already exists.
  pub async fn store_jobs_and_triggers(
    &self,
    entries: &[(JobDetail, Vec<Trigger>)],
    replace: bool,
  ) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        for (job, triggers) in entries {
          for trigger in triggers {
            check_trigger_targets(job, trigger)?;
          }
        }
        if !replace {
          for (job, triggers) in entries {
            if self.repos.jobs.exists(&job.key).await? {
              return Err(JobStoreError::already_exists("job", &job.key));
            }
            for trigger in triggers {
              if self.repos.triggers.exists(&trigger.key).await? {
                return Err(JobStoreError::already_exists("trigger", &trigger.key));
              }
            }
          }
        }
        for (job, triggers) in entries {
          self.store_job_tx(job, replace).await?;
          for trigger in triggers {
            self
              .store_trigger_tx(trigger, Some(job), replace, TriggerState::Waiting, false, false)
              .await?;
          }
        }
        Ok(())
      })
      .await
  }

  /// Writes `trigger` with `state`, adjusted for paused groups (unless `force_state`)
  /// and for a non-concurrent job that is executing (unless `recovering`).
  pub(crate) async fn store_trigger_tx(
    &self,
    trigger: &Trigger,
    job: Option<&JobDetail>,
    replace_existing: bool,
    state: TriggerState,
    force_state: bool,
    recovering: bool,
  ) -> Result<()> {
    let exists = self.repos.triggers.exists(&trigger.key).await?;
    if exists && !replace_existing {
      return Err(JobStoreError::already_exists("trigger", &trigger.key));
    }

    let mut state = state;
    if !force_state {
      let mut should_be_paused = self.repos.paused_groups.contains(&trigger.key.group).await?;
      if !should_be_paused {
        should_be_paused = self.repos.paused_groups.contains(ALL_GROUPS_PAUSED).await?;
        if should_be_paused {
          self.repos.paused_groups.add(&trigger.key.group).await?;
        }
      }
      if should_be_paused && matches!(state, TriggerState::Waiting | TriggerState::Acquired) {
        state = TriggerState::Paused;
      }
    }

    let disallows_concurrency = match job {
      Some(job) => {
        check_trigger_targets(job, trigger)?;
        job.concurrent_execution_disallowed
      }
      None => {
        self
          .repos
          .jobs
          .get(&trigger.job_key)
          .await?
          .ok_or_else(|| {
            JobStoreError::persistence(format!(
              "The job ({}) referenced by the trigger does not exist.",
              trigger.job_key
            ))
          })?
          .concurrent_execution_disallowed
      }
    };
    if disallows_concurrency && !recovering {
      state = self.check_blocked_state(&trigger.job_key, state).await?;
    }

    let record = TriggerRecord::encode(trigger, state);
    if exists {
      self.repos.triggers.upsert(&record).await?;
    } else {
      self
        .repos
        .triggers
        .insert(&record)
        .await
        .map_err(|e| insert_error("trigger", &trigger.key, e))?;
    }
    debug!(trigger_key = %trigger.key, ?state, "Stored trigger");
    Ok(())
  }

  /// Waiting/Paused become Blocked/PausedBlocked while the job executes somewhere.
  pub(crate) async fn check_blocked_state(
    &self,
    job_key: &JobKey,
    state: TriggerState,
  ) -> Result<TriggerState> {
    if !matches!(state, TriggerState::Waiting | TriggerState::Paused) {
      return Ok(state);
    }
    let executing = self
      .repos
      .fired_triggers
      .for_job(job_key)
      .await?
      .iter()
      .any(|r| r.state == TriggerState::Executing && r.concurrent_execution_disallowed);
    Ok(match (executing, state) {
      (true, TriggerState::Paused) => TriggerState::PausedBlocked,
      (true, _) => TriggerState::Blocked,
      (false, s) => s,
    })
  }

  /// Removes the trigger; a non-durable job left without triggers is removed too.
  pub async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
    self
      .in_lock(LockType::TriggerAccess, || self.remove_trigger_tx(key))
      .await
  }

  pub async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<Vec<Result<bool>>> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
          results.push(self.remove_trigger_tx(key).await);
        }
        Ok(results)
      })
      .await
  }

  pub(crate) async fn remove_trigger_tx(&self, key: &TriggerKey) -> Result<bool> {
    let Some(record) = self.repos.triggers.get(key).await? else {
      return Ok(false);
    };
    let job = self.repos.jobs.get(&record.job_key).await?;
    let removed = self.repos.triggers.delete(key).await?;

    if let Some(job) = job {
      if !job.durable && self.repos.triggers.for_job(&job.key).await?.is_empty() {
        self.repos.jobs.delete(&job.key).await?;
        debug!(job_key = %job.key, "Removed non-durable job with its last trigger");
        self.signaler.notify_scheduler_listeners_job_deleted(&job.key);
      }
    }
    Ok(removed)
  }

  /// Replaces the trigger at `key` with `new_trigger`, which must belong to the same job.
  /// Returns false if there is no trigger at `key`.
  pub async fn replace_trigger(&self, key: &TriggerKey, new_trigger: &Trigger) -> Result<bool> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let Some(old) = self.repos.triggers.get(key).await? else {
          return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
          return Err(JobStoreError::InvalidArgument(format!(
            "New trigger {} is not related to the same job as the old trigger {}",
            new_trigger.key, key
          )));
        }
        if &new_trigger.key != key && self.repos.triggers.exists(&new_trigger.key).await? {
          return Err(JobStoreError::already_exists("trigger", &new_trigger.key));
        }
        let job = self.repos.jobs.get(&old.job_key).await?.ok_or_else(|| {
          JobStoreError::persistence(format!(
            "The job ({}) referenced by the trigger does not exist.",
            old.job_key
          ))
        })?;
        let removed = self.repos.triggers.delete(key).await?;
        self
          .store_trigger_tx(
            new_trigger,
            Some(&job),
            false,
            TriggerState::Waiting,
            false,
            false,
          )
          .await?;
        Ok(removed)
      })
      .await
  }

  pub async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
    Ok(self.load_trigger(key).await?.map(|(trigger, _)| trigger))
  }

  pub async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
    Ok(self.repos.triggers.exists(key).await?)
  }

  pub async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStatus> {
    Ok(
      self
        .repos
        .triggers
        .get_state(key)
        .await?
        .map(TriggerState::status)
        .unwrap_or(TriggerStatus::None),
    )
  }

  /// Moves an Error trigger back into service: Waiting, or Paused when its group is paused,
  /// or Blocked when its non-concurrent job is executing.
  pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let Some(record) = self.repos.triggers.get(key).await? else {
          return Ok(());
        };
        if record.state != TriggerState::Error {
          return Ok(());
        }
        let paused = self.repos.paused_groups.contains(&key.group).await?
          || self.repos.paused_groups.contains(ALL_GROUPS_PAUSED).await?;
        let mut new_state = if paused {
          TriggerState::Paused
        } else {
          TriggerState::Waiting
        };
        if let Some(job) = self.repos.jobs.get(&record.job_key).await? {
          if job.concurrent_execution_disallowed {
            new_state = self.check_blocked_state(&job.key, new_state).await?;
          }
        }
        self
          .repos
          .triggers
          .compare_and_set_state(key, &[TriggerState::Error], new_state)
          .await?;
        info!(trigger_key = %key, ?new_state, "Trigger reset from ERROR state");
        Ok(())
      })
      .await
  }

  // --- Calendars ---

  /// Stores a calendar. With `update_triggers`, every trigger bound to an existing
  /// calendar of that name recomputes its next fire time against the new one.
  pub async fn store_calendar(
    &self,
    name: &str,
    calendar: &Calendar,
    replace_existing: bool,
    update_triggers: bool,
  ) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        if !self.repos.calendars.exists(name).await? {
          return self
            .repos
            .calendars
            .insert(name, calendar)
            .await
            .map_err(|e| insert_error("calendar", name, e));
        }
        if !replace_existing {
          return Err(JobStoreError::already_exists("calendar", name));
        }
        self.repos.calendars.upsert(name, calendar).await?;

        if update_triggers {
          for key in self.repos.triggers.keys_for_calendar(name).await? {
            let Some((mut trigger, state)) = self.load_trigger(&key).await? else {
              continue;
            };
            trigger.update_with_new_calendar(calendar, self.config.misfire_threshold);
            self
              .store_trigger_tx(&trigger, None, true, state, false, false)
              .await?;
          }
        }
        Ok(())
      })
      .await
  }

  /// Removes a calendar. Fails while any trigger still references it.
  pub async fn remove_calendar(&self, name: &str) -> Result<bool> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        if !self.repos.triggers.keys_for_calendar(name).await?.is_empty() {
          return Err(JobStoreError::InvalidArgument(format!(
            "Calendar '{}' cannot be removed while a trigger references it",
            name
          )));
        }
        Ok(self.repos.calendars.delete(name).await?)
      })
      .await
  }

  pub async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
    Ok(self.repos.calendars.get(name).await?)
  }

  // --- Queries ---

  pub async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
    Ok(self.repos.jobs.keys(matcher).await?)
  }

  pub async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
    Ok(self.repos.triggers.keys(matcher).await?)
  }

  pub async fn get_job_group_names(&self) -> Result<Vec<String>> {
    Ok(self.repos.jobs.group_names().await?)
  }

  pub async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
    Ok(self.repos.triggers.group_names().await?)
  }

  pub async fn get_calendar_names(&self) -> Result<Vec<String>> {
    Ok(self.repos.calendars.names().await?)
  }

  pub async fn get_triggers_for_job(&self, job_key: &JobKey) -> Result<Vec<Trigger>> {
    self
      .repos
      .triggers
      .for_job(job_key)
      .await?
      .iter()
      .map(TriggerRecord::decode)
      .collect()
  }

  pub async fn get_number_of_jobs(&self) -> Result<usize> {
    Ok(self.repos.jobs.count().await?)
  }

  pub async fn get_number_of_triggers(&self) -> Result<usize> {
    Ok(self.repos.triggers.count().await?)
  }

  pub async fn get_number_of_calendars(&self) -> Result<usize> {
    Ok(self.repos.calendars.count().await?)
  }

  /// Paused group names, without the all-groups marker.
  pub async fn get_paused_trigger_groups(&self) -> Result<Vec<String>> {
    Ok(
      self
        .repos
        .paused_groups
        .groups()
        .await?
        .into_iter()
        .filter(|g| g != ALL_GROUPS_PAUSED)
        .collect(),
    )
  }

  pub async fn is_trigger_group_paused(&self, group: &str) -> Result<bool> {
    Ok(self.repos.paused_groups.contains(group).await?)
  }

  /// Deletes every job, trigger, in-flight fire record, calendar and paused-group marker.
  pub async fn clear_all_scheduling_data(&self) -> Result<()> {
    self
      .in_lock(LockType::TriggerAccess, || async move {
        let triggers = self.repos.triggers.delete_all().await?;
        let fired = self.repos.fired_triggers.delete_all().await?;
        let jobs = self.repos.jobs.delete_all().await?;
        let calendars = self.repos.calendars.delete_all().await?;
        self.repos.paused_groups.delete_all().await?;
        info!(jobs, triggers, fired, calendars, "Cleared all scheduling data");
        Ok(())
      })
      .await
  }
}

// --- Helpers ---

pub(crate) fn to_chrono(duration: Duration) -> ChronoDuration {
  ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

fn insert_error(kind: &'static str, key: impl fmt::Display, err: StoreError) -> JobStoreError {
  match err {
    StoreError::DuplicateKey { .. } => JobStoreError::already_exists(kind, key),
    other => other.into(),
  }
}

/// A trigger stored together with a job must fire that job.
fn check_trigger_targets(job: &JobDetail, trigger: &Trigger) -> Result<()> {
  if trigger.job_key != job.key {
    return Err(JobStoreError::persistence(format!(
      "Trigger {} references job {}, not the job {} it is stored with.",
      trigger.key, trigger.job_key, job.key
    )));
  }
  Ok(())
}

async fn await_background_tasks(
  handles: Vec<(&'static str, JoinHandle<()>)>,
  timeout: Option<Duration>,
) -> std::result::Result<(), ShutdownError> {
  if handles.is_empty() {
    return Ok(());
  }

  let joins = try_join_all(handles.into_iter().map(|(name, handle)| async move {
    match handle.await {
      Ok(()) => {
        debug!(task = name, "Background task joined.");
        Ok(())
      }
      Err(e) if e.is_cancelled() => {
        debug!(task = name, "Background task aborted.");
        Ok(())
      }
      Err(e) => {
        error!(task = name, "Background task panicked: {:?}", e);
        Err(ShutdownError::TaskPanic)
      }
    }
  }));

  let result = match timeout {
    Some(limit) => match tokio::time::timeout(limit, joins).await {
      Ok(joined) => joined.map(|_| ()),
      Err(_) => {
        error!("Shutdown timed out after {:?}", limit);
        Err(ShutdownError::Timeout)
      }
    },
    None => joins.await.map(|_| ()),
  };

  if result.is_ok() {
    info!("All background tasks stopped.");
  }
  result
}
