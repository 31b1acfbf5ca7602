//! tests/firing.rs
//! Acquire -> fire -> complete, and the non-concurrent job invariant.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{build_store, job, once_at, repeating_at, seconds, setup_tracing, store_builder, RecordingSignaler};
use serde_json::json;
use std::time::Duration as StdDuration;
use turnkeeper_jobstore::{
  CompletedExecutionInstruction, JobStoreError, MemoryDocumentStore, TriggerState, TriggerStatus,
};

#[tokio::test]
async fn test_acquire_fire_complete_cycle() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let repos = docs.repositories("test-cluster");
  let signaler = RecordingSignaler::new();
  let store = store_builder(&docs, "A")
    .signaler(signaler.clone())
    .build()
    .unwrap();

  let job = job("tick").durable(true);
  let trigger = repeating_at("tick", "g", &job.key, Utc::now() + seconds(1), StdDuration::from_secs(60));
  store.store_job_and_trigger(&job, &trigger).await.unwrap();

  let acquired = store
    .acquire_next_triggers(Utc::now() + seconds(5), 10, ChronoDuration::zero())
    .await
    .unwrap();
  assert_eq!(acquired.len(), 1);
  let fire_id = acquired[0].fire_instance_id.clone().expect("fire instance id assigned");
  assert!(fire_id.starts_with("A-"), "{}", fire_id);
  assert_eq!(repos.triggers.get_state(&trigger.key).await.unwrap(), Some(TriggerState::Acquired));
  let fired = repos.fired_triggers.for_instance("A").await.unwrap();
  assert_eq!(fired.len(), 1);
  assert_eq!(fired[0].state, TriggerState::Acquired);

  // Nothing else is due.
  let again = store
    .acquire_next_triggers(Utc::now() + seconds(5), 10, ChronoDuration::zero())
    .await
    .unwrap();
  assert!(again.is_empty());

  let results = store.triggers_fired(&acquired).await.unwrap();
  let bundle = results.into_iter().next().unwrap().unwrap().expect("trigger fired");
  assert!(!bundle.recovering);
  assert_eq!(bundle.scheduled_fire_time, trigger.next_fire_time);
  assert_eq!(
    bundle.next_fire_time,
    trigger.next_fire_time.map(|t| t + seconds(60))
  );
  assert_eq!(repos.triggers.get_state(&trigger.key).await.unwrap(), Some(TriggerState::Waiting));
  let executing = repos.fired_triggers.for_instance("A").await.unwrap();
  assert_eq!(executing[0].state, TriggerState::Executing);

  store
    .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::NoInstruction)
    .await
    .unwrap();
  assert!(repos.fired_triggers.for_instance("A").await.unwrap().is_empty());

  let snapshot = store.metrics_snapshot();
  assert_eq!(snapshot.triggers_acquired, 1);
  assert_eq!(snapshot.triggers_fired, 1);
  assert_eq!(snapshot.jobs_completed, 1);
  assert!(snapshot.locks_acquired >= 4);
}

#[tokio::test]
async fn test_negative_time_window_is_rejected() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");
  let err = store
    .acquire_next_triggers(Utc::now(), 1, ChronoDuration::milliseconds(-1))
    .await
    .unwrap_err();
  assert!(matches!(err, JobStoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_batch_window_limits_acquisition() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let job = job("batch").durable(true);
  store.store_job(&job, false).await.unwrap();
  let now = Utc::now();
  for (name, offset) in [("soon", 1), ("close", 2), ("later", 30)] {
    store
      .store_trigger(&once_at(name, "g", &job.key, now + seconds(offset)), false)
      .await
      .unwrap();
  }

  let acquired = store
    .acquire_next_triggers(now + seconds(1), 10, ChronoDuration::seconds(5))
    .await
    .unwrap();
  let names: Vec<_> = acquired.iter().map(|t| t.key.name.as_str()).collect();
  assert_eq!(names, vec!["soon", "close"]);
}

#[tokio::test]
async fn test_release_returns_trigger_to_waiting() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let repos = docs.repositories("test-cluster");
  let store = build_store(&docs, "A");

  let job = job("released").durable(true);
  let trigger = once_at("t", "g", &job.key, Utc::now() + seconds(1));
  store.store_job_and_trigger(&job, &trigger).await.unwrap();

  let acquired = store
    .acquire_next_triggers(Utc::now() + seconds(5), 1, ChronoDuration::zero())
    .await
    .unwrap();
  store.release_acquired_trigger(&acquired[0]).await.unwrap();

  assert_eq!(repos.triggers.get_state(&trigger.key).await.unwrap(), Some(TriggerState::Waiting));
  assert!(repos.fired_triggers.for_trigger(&trigger.key).await.unwrap().is_empty());

  // A trigger that is no longer Acquired does not fire.
  let results = store.triggers_fired(&acquired).await.unwrap();
  assert!(matches!(results[0], Ok(None)));
}

#[tokio::test]
async fn test_non_concurrent_job_fires_one_at_a_time() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let repos = docs.repositories("test-cluster");
  let store = build_store(&docs, "A");

  let job = job("exclusive").durable(true).disallow_concurrent_execution(true);
  store.store_job(&job, false).await.unwrap();
  let first = once_at("first", "g", &job.key, Utc::now() + seconds(1));
  let second = once_at("second", "g", &job.key, Utc::now() + seconds(1));
  store.store_trigger(&first, false).await.unwrap();
  store.store_trigger(&second, false).await.unwrap();

  // Only one trigger of the job per acquisition.
  let acquired = store
    .acquire_next_triggers(Utc::now() + seconds(5), 10, ChronoDuration::zero())
    .await
    .unwrap();
  assert_eq!(acquired.len(), 1);
  let fired_key = acquired[0].key.clone();
  let sibling_key = if fired_key == first.key { second.key.clone() } else { first.key.clone() };

  let bundle = store.triggers_fired(&acquired).await.unwrap().remove(0).unwrap().unwrap();
  assert_eq!(repos.triggers.get_state(&sibling_key).await.unwrap(), Some(TriggerState::Blocked));
  assert_eq!(repos.triggers.get_state(&fired_key).await.unwrap(), Some(TriggerState::Complete));

  // Blocked triggers are not acquirable.
  let none = store
    .acquire_next_triggers(Utc::now() + seconds(5), 10, ChronoDuration::zero())
    .await
    .unwrap();
  assert!(none.is_empty());

  // A trigger added while the job executes starts Blocked.
  let third = once_at("third", "g", &job.key, Utc::now() + seconds(1));
  store.store_trigger(&third, false).await.unwrap();
  assert_eq!(store.get_trigger_state(&third.key).await.unwrap(), TriggerStatus::Blocked);

  store
    .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::DeleteTrigger)
    .await
    .unwrap();
  assert!(!store.check_trigger_exists(&fired_key).await.unwrap());
  assert_eq!(repos.triggers.get_state(&sibling_key).await.unwrap(), Some(TriggerState::Waiting));
  assert_eq!(repos.triggers.get_state(&third.key).await.unwrap(), Some(TriggerState::Waiting));
}

#[tokio::test]
async fn test_completion_instructions() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let repos = docs.repositories("test-cluster");
  let signaler = RecordingSignaler::new();
  let store = store_builder(&docs, "A")
    .signaler(signaler.clone())
    .build()
    .unwrap();

  let job = job("verdicts").durable(true);
  store.store_job(&job, false).await.unwrap();
  let at = Utc::now() + seconds(1);
  let a = repeating_at("a", "g", &job.key, at, StdDuration::from_secs(60));
  let b = repeating_at("b", "g", &job.key, at, StdDuration::from_secs(60));
  store.store_trigger(&a, false).await.unwrap();
  store.store_trigger(&b, false).await.unwrap();

  let acquired = store
    .acquire_next_triggers(Utc::now() + seconds(5), 10, ChronoDuration::zero())
    .await
    .unwrap();
  assert_eq!(acquired.len(), 2);
  let bundles: Vec<_> = store
    .triggers_fired(&acquired)
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.unwrap().unwrap())
    .collect();

  store
    .triggered_job_complete(&bundles[0].trigger, &job, CompletedExecutionInstruction::SetTriggerError)
    .await
    .unwrap();
  assert_eq!(
    store.get_trigger_state(&bundles[0].trigger.key).await.unwrap(),
    TriggerStatus::Error
  );

  store
    .triggered_job_complete(&bundles[1].trigger, &job, CompletedExecutionInstruction::SetAllJobTriggersComplete)
    .await
    .unwrap();
  assert_eq!(store.get_trigger_state(&a.key).await.unwrap(), TriggerStatus::Complete);
  assert_eq!(store.get_trigger_state(&b.key).await.unwrap(), TriggerStatus::Complete);

  assert!(repos.fired_triggers.for_job(&job.key).await.unwrap().is_empty());
  assert!(signaler.scheduling_changes.lock().iter().all(|c| c.is_none()));
  assert_eq!(signaler.change_count(), 2);
}

#[tokio::test]
async fn test_dirty_job_data_is_persisted_after_execution() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let job = job("stateful").durable(true).persist_job_data_after_execution(true);
  let trigger = once_at("t", "g", &job.key, Utc::now() + seconds(1));
  store.store_job_and_trigger(&job, &trigger).await.unwrap();

  let acquired = store
    .acquire_next_triggers(Utc::now() + seconds(5), 1, ChronoDuration::zero())
    .await
    .unwrap();
  let mut bundle = store.triggers_fired(&acquired).await.unwrap().remove(0).unwrap().unwrap();
  assert!(!bundle.job.job_data.is_dirty());

  bundle.job.job_data.put("runs", json!(1));
  store
    .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::NoInstruction)
    .await
    .unwrap();

  let stored = store.retrieve_job(&job.key).await.unwrap().unwrap();
  assert_eq!(stored.job_data.get("runs"), Some(&json!(1)));
}

#[tokio::test]
async fn test_fired_trigger_with_missing_calendar_is_skipped() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let job = job("cal").durable(true);
  let mut trigger = once_at("t", "g", &job.key, Utc::now() + seconds(1));
  trigger.calendar_name = Some("gone".to_string());
  store.store_job_and_trigger(&job, &trigger).await.unwrap();

  let acquired = store
    .acquire_next_triggers(Utc::now() + seconds(5), 1, ChronoDuration::zero())
    .await
    .unwrap();
  let results = store.triggers_fired(&acquired).await.unwrap();
  assert!(matches!(results[0], Ok(None)));
}
