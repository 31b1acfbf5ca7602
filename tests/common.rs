//! tests/common.rs
//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing_subscriber::fmt::TestWriter;
use turnkeeper_jobstore::{
  JobDetail, JobKey, JobStore, JobStoreBuilder, LockRetryPolicy, MemoryDocumentStore,
  SchedulerSignaler, Trigger, TriggerKey, TriggerSchedule,
};

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Builder preconfigured for fast tests: short lock polling and no background work
// until `scheduler_started`.
pub fn store_builder(documents: &MemoryDocumentStore, instance_id: &str) -> JobStoreBuilder {
  JobStore::builder()
    .instance_name("test-cluster")
    .instance_id(instance_id)
    .memory_store(documents)
    .lock_retry(LockRetryPolicy::bounded(
      StdDuration::from_millis(2),
      StdDuration::from_secs(5),
    ))
    .db_retry_interval(StdDuration::from_millis(50))
}

pub fn build_store(documents: &MemoryDocumentStore, instance_id: &str) -> JobStore {
  store_builder(documents, instance_id)
    .build()
    .expect("Failed to build job store")
}

pub fn job(name: &str) -> JobDetail {
  JobDetail::new(JobKey::new(name, "jobs"), "TestJob")
}

// One-shot trigger firing at `at`.
pub fn once_at(name: &str, group: &str, job_key: &JobKey, at: DateTime<Utc>) -> Trigger {
  Trigger::builder(TriggerKey::new(name, group), job_key.clone())
    .with_schedule(TriggerSchedule::once())
    .start_at(at)
    .build()
    .expect("Failed to build trigger")
}

// Trigger repeating every `interval` forever, starting at `at`.
pub fn repeating_at(
  name: &str,
  group: &str,
  job_key: &JobKey,
  at: DateTime<Utc>,
  interval: StdDuration,
) -> Trigger {
  Trigger::builder(TriggerKey::new(name, group), job_key.clone())
    .with_schedule(TriggerSchedule::repeat_forever(interval))
    .start_at(at)
    .build()
    .expect("Failed to build trigger")
}

pub fn seconds(n: i64) -> ChronoDuration {
  ChronoDuration::seconds(n)
}

// --- Recording Signaler ---

#[derive(Debug, Default)]
pub struct RecordingSignaler {
  pub misfired: Mutex<Vec<TriggerKey>>,
  pub finalized: Mutex<Vec<TriggerKey>>,
  pub deleted_jobs: Mutex<Vec<JobKey>>,
  pub scheduling_changes: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl RecordingSignaler {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn misfired_count(&self) -> usize {
    self.misfired.lock().len()
  }

  pub fn change_count(&self) -> usize {
    self.scheduling_changes.lock().len()
  }
}

impl SchedulerSignaler for RecordingSignaler {
  fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
    self.misfired.lock().push(trigger.key.clone());
  }

  fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
    self.finalized.lock().push(trigger.key.clone());
  }

  fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey) {
    self.deleted_jobs.lock().push(job_key.clone());
  }

  fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
    self.scheduling_changes.lock().push(candidate);
  }
}
