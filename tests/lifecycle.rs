//! tests/lifecycle.rs
//! Startup recovery, background loops and shutdown.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{build_store, job, once_at, repeating_at, seconds, setup_tracing, store_builder, RecordingSignaler};
use std::time::Duration as StdDuration;
use turnkeeper_jobstore::repository::FiredTriggerRecord;
use turnkeeper_jobstore::{
  GroupMatcher, JobStore, JobStoreError, LockRetryPolicy, MemoryDocumentStore, ShutdownError,
  TriggerState, NON_CLUSTERED_INSTANCE_ID, RECOVERING_JOBS_GROUP,
};

#[tokio::test]
async fn test_startup_recovery_repairs_unclean_stop() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let repos = docs.repositories("test-cluster");
  let store = build_store(&docs, "A");

  let plain = job("plain").durable(true);
  store.store_job(&plain, false).await.unwrap();
  let acquired = once_at("acquired", "g", &plain.key, Utc::now() + seconds(30));
  let blocked = once_at("blocked", "g", &plain.key, Utc::now() + seconds(30));
  let paused_blocked = once_at("paused-blocked", "g", &plain.key, Utc::now() + seconds(30));
  let complete = once_at("complete", "g", &plain.key, Utc::now() + seconds(30));
  for t in [&acquired, &blocked, &paused_blocked, &complete] {
    store.store_trigger(t, false).await.unwrap();
  }
  repos.triggers.set_state(&acquired.key, TriggerState::Acquired).await.unwrap();
  repos.triggers.set_state(&blocked.key, TriggerState::Blocked).await.unwrap();
  repos
    .triggers
    .set_state(&paused_blocked.key, TriggerState::PausedBlocked)
    .await
    .unwrap();
  repos.triggers.set_state(&complete.key, TriggerState::Complete).await.unwrap();

  // Overdue well beyond the default misfire threshold.
  let overdue = repeating_at(
    "overdue",
    "g",
    &plain.key,
    Utc::now() - seconds(600),
    StdDuration::from_secs(3600),
  );
  store.store_trigger(&overdue, false).await.unwrap();

  // A job that was executing when the previous process died.
  let recoverable = job("recoverable").durable(true).requests_recovery(true);
  let original = once_at("original", "r", &recoverable.key, Utc::now() + seconds(30));
  store.store_job_and_trigger(&recoverable, &original).await.unwrap();
  repos
    .fired_triggers
    .insert(&FiredTriggerRecord {
      fire_instance_id: "A-1".to_string(),
      instance_id: "A".to_string(),
      trigger_key: original.key.clone(),
      job_key: recoverable.key.clone(),
      state: TriggerState::Executing,
      fired_at: Utc::now() - seconds(5),
      scheduled_at: Some(Utc::now() - seconds(5)),
      priority: 5,
      concurrent_execution_disallowed: false,
      requests_recovery: true,
    })
    .await
    .unwrap();

  store.scheduler_started().await.unwrap();

  assert_eq!(repos.triggers.get_state(&acquired.key).await.unwrap(), Some(TriggerState::Waiting));
  assert_eq!(repos.triggers.get_state(&blocked.key).await.unwrap(), Some(TriggerState::Waiting));
  assert_eq!(
    repos.triggers.get_state(&paused_blocked.key).await.unwrap(),
    Some(TriggerState::Paused)
  );
  assert!(!store.check_trigger_exists(&complete.key).await.unwrap());

  let rescheduled = store.retrieve_trigger(&overdue.key).await.unwrap().unwrap();
  assert!(rescheduled.next_fire_time.unwrap() > Utc::now());

  let recovery = store
    .get_trigger_keys(&GroupMatcher::equals(RECOVERING_JOBS_GROUP))
    .await
    .unwrap();
  assert_eq!(recovery.len(), 1);
  assert!(repos.fired_triggers.for_instance("A").await.unwrap().is_empty());

  store.shutdown(Some(StdDuration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn test_restart_with_default_instance_id_recovers_jobs() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let default_store = || {
    JobStore::builder()
      .instance_name("test-cluster")
      .memory_store(&docs)
      .lock_retry(LockRetryPolicy::bounded(
        StdDuration::from_millis(2),
        StdDuration::from_secs(5),
      ))
      .build()
      .unwrap()
  };

  let first_run = default_store();
  assert_eq!(first_run.instance_id(), NON_CLUSTERED_INSTANCE_ID);
  let job = job("recoverable").durable(true).requests_recovery(true);
  let trigger = once_at("nightly", "r", &job.key, Utc::now() + seconds(1));
  first_run.store_job_and_trigger(&job, &trigger).await.unwrap();
  let acquired = first_run
    .acquire_next_triggers(Utc::now() + seconds(5), 1, ChronoDuration::zero())
    .await
    .unwrap();
  assert_eq!(acquired.len(), 1);
  first_run.triggers_fired(&acquired).await.unwrap();
  // The process dies while the job executes.
  drop(first_run);

  let second_run = default_store();
  second_run.scheduler_started().await.unwrap();

  let recovery = second_run
    .get_trigger_keys(&GroupMatcher::equals(RECOVERING_JOBS_GROUP))
    .await
    .unwrap();
  assert_eq!(recovery.len(), 1);
  let recovery_trigger = second_run.retrieve_trigger(&recovery[0]).await.unwrap().unwrap();
  assert_eq!(recovery_trigger.job_key, job.key);

  second_run.shutdown(Some(StdDuration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn test_clustered_default_instance_ids_are_distinct() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let build = || {
    JobStore::builder()
      .instance_name("test-cluster")
      .clustered(true)
      .memory_store(&docs)
      .build()
      .unwrap()
  };
  let (a, b) = (build(), build());
  assert_ne!(a.instance_id(), NON_CLUSTERED_INSTANCE_ID);
  assert_ne!(a.instance_id(), b.instance_id());
}

#[tokio::test]
async fn test_start_twice_and_shutdown_twice() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  store.scheduler_started().await.unwrap();
  // Second start is a no-op.
  store.scheduler_started().await.unwrap();

  store.shutdown(Some(StdDuration::from_secs(2))).await.unwrap();
  let err = store.shutdown(None).await.unwrap_err();
  assert_eq!(err, ShutdownError::AlreadyShuttingDown);

  let err = store.scheduler_started().await.unwrap_err();
  assert!(matches!(err, JobStoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_shutdown_before_start() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = store_builder(&docs, "A").clustered(true).build().unwrap();
  store.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_clustered_shutdown_removes_liveness_row() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let repos = docs.repositories("test-cluster");
  let store = store_builder(&docs, "A")
    .clustered(true)
    .cluster_checkin_interval(StdDuration::from_millis(100))
    .build()
    .unwrap();

  store.scheduler_started().await.unwrap();
  let rows = repos.schedulers.all().await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].instance_id, "A");

  store.shutdown(Some(StdDuration::from_secs(2))).await.unwrap();
  assert!(repos.schedulers.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_daemon_tasks_are_aborted() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = store_builder(&docs, "A")
    .clustered(true)
    .make_threads_daemon(true)
    .build()
    .unwrap();
  store.scheduler_started().await.unwrap();
  store.shutdown(Some(StdDuration::from_millis(500))).await.unwrap();
}

#[tokio::test]
async fn test_background_loops_survive_store_outage() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let signaler = RecordingSignaler::new();
  let store = store_builder(&docs, "A")
    .misfire_threshold(StdDuration::from_millis(100))
    .lock_lease_ttl(StdDuration::from_millis(200))
    .signaler(signaler.clone())
    .build()
    .unwrap();
  store.scheduler_started().await.unwrap();

  docs.set_unavailable(true);
  tokio::time::sleep(StdDuration::from_millis(300)).await;
  assert!(store.metrics_snapshot().background_failures > 0);

  let job = job("after-outage").durable(true);
  assert!(store.store_job(&job, false).await.is_err());

  docs.set_unavailable(false);
  let trigger = once_at("late", "g", &job.key, Utc::now() - seconds(5));
  store.store_job_and_trigger(&job, &trigger).await.unwrap();

  let mut waited = StdDuration::ZERO;
  while signaler.misfired_count() == 0 && waited < StdDuration::from_secs(5) {
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    waited += StdDuration::from_millis(20);
  }
  assert_eq!(signaler.misfired_count(), 1);

  store.shutdown(Some(StdDuration::from_secs(2))).await.unwrap();
}
