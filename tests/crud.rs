//! tests/crud.rs
//! Storing, retrieving and removing jobs, triggers and calendars.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{build_store, job, once_at, repeating_at, seconds, setup_tracing, store_builder, RecordingSignaler};
use std::time::Duration as StdDuration;
use turnkeeper_jobstore::{
  Calendar, GroupMatcher, JobKey, JobStoreError, MemoryDocumentStore, TriggerKey, TriggerState,
  TriggerStatus,
};

#[tokio::test]
async fn test_store_and_retrieve_job_with_trigger() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let job = job("report").durable(true).description("nightly report");
  let trigger = once_at("t1", "reports", &job.key, Utc::now() + seconds(60));
  store.store_job_and_trigger(&job, &trigger).await.unwrap();

  let loaded_job = store.retrieve_job(&job.key).await.unwrap().expect("job stored");
  assert_eq!(loaded_job.description.as_deref(), Some("nightly report"));
  assert!(loaded_job.durable);

  let loaded = store.retrieve_trigger(&trigger.key).await.unwrap().expect("trigger stored");
  assert_eq!(loaded.next_fire_time, trigger.next_fire_time);
  assert_eq!(loaded.job_key, job.key);

  assert_eq!(store.get_trigger_state(&trigger.key).await.unwrap(), TriggerStatus::Normal);
  assert_eq!(
    store.get_trigger_state(&TriggerKey::new("nope", "reports")).await.unwrap(),
    TriggerStatus::None
  );
  assert_eq!(store.get_number_of_jobs().await.unwrap(), 1);
  assert_eq!(store.get_number_of_triggers().await.unwrap(), 1);
  assert_eq!(store.get_trigger_group_names().await.unwrap(), vec!["reports".to_string()]);
  assert_eq!(
    store.get_trigger_keys(&GroupMatcher::starts_with("rep")).await.unwrap(),
    vec![trigger.key.clone()]
  );
  assert_eq!(store.get_triggers_for_job(&job.key).await.unwrap().len(), 1);
  assert!(store.check_job_exists(&job.key).await.unwrap());
  assert!(store.check_trigger_exists(&trigger.key).await.unwrap());
}

#[tokio::test]
async fn test_duplicate_job_needs_replace() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let original = job("dup").durable(true);
  store.store_job(&original, false).await.unwrap();

  let err = store.store_job(&original, false).await.unwrap_err();
  assert!(matches!(err, JobStoreError::AlreadyExists { kind: "job", .. }), "{:?}", err);

  let updated = job("dup").durable(true).description("v2");
  store.store_job(&updated, true).await.unwrap();
  let loaded = store.retrieve_job(&updated.key).await.unwrap().unwrap();
  assert_eq!(loaded.description.as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_trigger_for_missing_job_is_rejected() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let orphan = once_at("orphan", "g", &JobKey::new("ghost", "jobs"), Utc::now() + seconds(5));
  let err = store.store_trigger(&orphan, false).await.unwrap_err();
  match err {
    JobStoreError::Persistence { message, .. } => {
      assert!(message.contains("referenced by the trigger does not exist"), "{}", message)
    }
    other => panic!("unexpected error: {:?}", other),
  }
  assert!(!store.check_trigger_exists(&orphan.key).await.unwrap());
}

#[tokio::test]
async fn test_removing_last_trigger_deletes_non_durable_job() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let signaler = RecordingSignaler::new();
  let store = store_builder(&docs, "A")
    .signaler(signaler.clone())
    .build()
    .unwrap();

  let transient = job("transient");
  let t1 = once_at("t1", "g", &transient.key, Utc::now() + seconds(30));
  let t2 = once_at("t2", "g", &transient.key, Utc::now() + seconds(60));
  store.store_job_and_trigger(&transient, &t1).await.unwrap();
  store.store_trigger(&t2, false).await.unwrap();

  let kept = job("kept").durable(true);
  let t3 = once_at("t3", "g", &kept.key, Utc::now() + seconds(30));
  store.store_job_and_trigger(&kept, &t3).await.unwrap();

  assert!(store.remove_trigger(&t1.key).await.unwrap());
  assert!(store.check_job_exists(&transient.key).await.unwrap(), "job still has t2");

  assert!(store.remove_trigger(&t2.key).await.unwrap());
  assert!(!store.check_job_exists(&transient.key).await.unwrap());
  assert_eq!(signaler.deleted_jobs.lock().clone(), vec![transient.key.clone()]);

  assert!(store.remove_trigger(&t3.key).await.unwrap());
  assert!(store.check_job_exists(&kept.key).await.unwrap(), "durable job survives");

  assert!(!store.remove_trigger(&t3.key).await.unwrap());
}

#[tokio::test]
async fn test_remove_job_removes_its_triggers() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let job = job("with-triggers").durable(true);
  store.store_job(&job, false).await.unwrap();
  for i in 0..3 {
    let t = once_at(&format!("t{}", i), "g", &job.key, Utc::now() + seconds(10 + i));
    store.store_trigger(&t, false).await.unwrap();
  }

  let results = store
    .remove_jobs(&[job.key.clone(), JobKey::new("missing", "jobs")])
    .await
    .unwrap();
  assert!(matches!(results[0], Ok(true)));
  assert!(matches!(results[1], Ok(false)));
  assert_eq!(store.get_number_of_triggers().await.unwrap(), 0);
  assert_eq!(store.get_number_of_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn test_replace_trigger_rules() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let a = job("a").durable(true);
  let b = job("b").durable(true);
  store.store_job(&a, false).await.unwrap();
  store.store_job(&b, false).await.unwrap();
  let old = once_at("old", "g", &a.key, Utc::now() + seconds(30));
  store.store_trigger(&old, false).await.unwrap();

  let missing = TriggerKey::new("missing", "g");
  let replacement = once_at("new", "g", &a.key, Utc::now() + seconds(90));
  assert!(!store.replace_trigger(&missing, &replacement).await.unwrap());

  let wrong_job = once_at("new", "g", &b.key, Utc::now() + seconds(90));
  let err = store.replace_trigger(&old.key, &wrong_job).await.unwrap_err();
  assert!(matches!(err, JobStoreError::InvalidArgument(_)), "{:?}", err);
  assert!(store.check_trigger_exists(&old.key).await.unwrap());

  // A replacement whose key is taken leaves the old trigger in place.
  let taken = once_at("taken", "g", &a.key, Utc::now() + seconds(60));
  store.store_trigger(&taken, false).await.unwrap();
  let onto_taken = once_at("taken", "g", &a.key, Utc::now() + seconds(120));
  let err = store.replace_trigger(&old.key, &onto_taken).await.unwrap_err();
  assert!(matches!(err, JobStoreError::AlreadyExists { .. }), "{:?}", err);
  assert!(store.check_trigger_exists(&old.key).await.unwrap());
  let kept = store.retrieve_trigger(&taken.key).await.unwrap().unwrap();
  assert_eq!(kept.next_fire_time, taken.next_fire_time);

  // Replacing a trigger with one under the same key is allowed.
  let same_key = once_at("old", "g", &a.key, Utc::now() + seconds(45));
  assert!(store.replace_trigger(&old.key, &same_key).await.unwrap());
  let stored = store.retrieve_trigger(&old.key).await.unwrap().unwrap();
  assert_eq!(stored.next_fire_time, same_key.next_fire_time);

  assert!(store.replace_trigger(&old.key, &replacement).await.unwrap());
  assert!(!store.check_trigger_exists(&old.key).await.unwrap());
  let stored = store.retrieve_trigger(&replacement.key).await.unwrap().unwrap();
  assert_eq!(stored.next_fire_time, replacement.next_fire_time);
}

#[tokio::test]
async fn test_store_jobs_and_triggers_is_all_or_nothing() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let existing = job("existing").durable(true);
  let clash = once_at("clash", "g", &existing.key, Utc::now() + seconds(30));
  store.store_job_and_trigger(&existing, &clash).await.unwrap();

  let fresh = job("fresh");
  let fresh_trigger = once_at("fresh", "g", &fresh.key, Utc::now() + seconds(30));
  let batch = vec![
    (fresh.clone(), vec![fresh_trigger.clone()]),
    (existing.clone(), vec![clash.clone()]),
  ];

  let err = store.store_jobs_and_triggers(&batch, false).await.unwrap_err();
  assert!(matches!(err, JobStoreError::AlreadyExists { .. }), "{:?}", err);
  assert!(!store.check_job_exists(&fresh.key).await.unwrap());

  store.store_jobs_and_triggers(&batch, true).await.unwrap();
  assert!(store.check_job_exists(&fresh.key).await.unwrap());
  assert!(store.check_trigger_exists(&fresh_trigger.key).await.unwrap());
}

#[tokio::test]
async fn test_store_job_and_trigger_writes_nothing_on_conflict() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let first = job("first");
  let trigger = once_at("t", "g", &first.key, Utc::now() + seconds(30));
  store.store_job_and_trigger(&first, &trigger).await.unwrap();

  let second = job("second");
  let clash = once_at("t", "g", &second.key, Utc::now() + seconds(30));
  let err = store.store_job_and_trigger(&second, &clash).await.unwrap_err();
  assert!(matches!(err, JobStoreError::AlreadyExists { .. }), "{:?}", err);
  assert!(!store.check_job_exists(&second.key).await.unwrap());
  assert_eq!(store.get_number_of_jobs().await.unwrap(), 1);

  let stored = store.retrieve_trigger(&trigger.key).await.unwrap().unwrap();
  assert_eq!(stored.job_key, first.key);
}

#[tokio::test]
async fn test_trigger_must_reference_the_job_it_is_stored_with() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let real = job("real").durable(true);
  let ghost = JobKey::new("ghost", "jobs");
  let stray = once_at("stray", "g", &ghost, Utc::now() + seconds(30));

  let err = store.store_job_and_trigger(&real, &stray).await.unwrap_err();
  assert!(matches!(err, JobStoreError::Persistence { .. }), "{:?}", err);
  assert!(!store.check_job_exists(&real.key).await.unwrap());
  assert!(!store.check_trigger_exists(&stray.key).await.unwrap());

  let own = once_at("own", "g", &real.key, Utc::now() + seconds(30));
  let batch = vec![(real.clone(), vec![own.clone(), stray.clone()])];
  for replace in [false, true] {
    let err = store.store_jobs_and_triggers(&batch, replace).await.unwrap_err();
    assert!(matches!(err, JobStoreError::Persistence { .. }), "{:?}", err);
  }
  assert!(!store.check_job_exists(&real.key).await.unwrap());
  assert!(!store.check_trigger_exists(&own.key).await.unwrap());
  assert!(!store.check_trigger_exists(&stray.key).await.unwrap());
}

#[tokio::test]
async fn test_calendar_lifecycle() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let start = Utc::now() + ChronoDuration::hours(1);
  store
    .store_calendar("open", &Calendar::holidays(Vec::new()), false, false)
    .await
    .unwrap();

  let job = job("hourly").durable(true);
  let mut trigger = repeating_at("hourly", "g", &job.key, start, StdDuration::from_secs(3600));
  trigger.calendar_name = Some("open".to_string());
  store.store_job_and_trigger(&job, &trigger).await.unwrap();

  let err = store.remove_calendar("open").await.unwrap_err();
  assert!(matches!(err, JobStoreError::InvalidArgument(_)), "{:?}", err);

  let err = store
    .store_calendar("open", &Calendar::holidays(Vec::new()), false, false)
    .await
    .unwrap_err();
  assert!(matches!(err, JobStoreError::AlreadyExists { kind: "calendar", .. }));

  // Excluding the start date moves the trigger to the next day.
  let closed = Calendar::holidays(vec![start.date_naive()]);
  store.store_calendar("open", &closed, true, true).await.unwrap();
  let moved = store.retrieve_trigger(&trigger.key).await.unwrap().unwrap();
  let next = moved.next_fire_time.expect("still scheduled");
  assert!(next.date_naive() > start.date_naive(), "next fire time {}", next);
  assert_eq!(store.get_trigger_state(&trigger.key).await.unwrap(), TriggerStatus::Normal);

  assert_eq!(store.get_calendar_names().await.unwrap(), vec!["open".to_string()]);
  store.remove_trigger(&trigger.key).await.unwrap();
  assert!(store.remove_calendar("open").await.unwrap());
  assert_eq!(store.get_number_of_calendars().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reset_trigger_from_error_state() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let repos = docs.repositories("test-cluster");
  let store = build_store(&docs, "A");

  let job = job("flaky").durable(true);
  let trigger = once_at("t", "g", &job.key, Utc::now() + seconds(30));
  store.store_job_and_trigger(&job, &trigger).await.unwrap();
  repos.triggers.set_state(&trigger.key, TriggerState::Error).await.unwrap();
  assert_eq!(store.get_trigger_state(&trigger.key).await.unwrap(), TriggerStatus::Error);

  store.reset_trigger_from_error_state(&trigger.key).await.unwrap();
  assert_eq!(store.get_trigger_state(&trigger.key).await.unwrap(), TriggerStatus::Normal);
}

#[tokio::test]
async fn test_clear_all_scheduling_data() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let store = build_store(&docs, "A");

  let job = job("doomed");
  let trigger = once_at("t", "g", &job.key, Utc::now() + seconds(30));
  store.store_job_and_trigger(&job, &trigger).await.unwrap();
  store
    .store_calendar("cal", &Calendar::holidays(Vec::new()), false, false)
    .await
    .unwrap();
  store.pause_triggers(&GroupMatcher::equals("g")).await.unwrap();

  store.clear_all_scheduling_data().await.unwrap();
  assert_eq!(store.get_number_of_jobs().await.unwrap(), 0);
  assert_eq!(store.get_number_of_triggers().await.unwrap(), 0);
  assert_eq!(store.get_number_of_calendars().await.unwrap(), 0);
  assert!(store.get_paused_trigger_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_instance_names_are_isolated() {
  setup_tracing();
  let docs = MemoryDocumentStore::new();
  let billing = build_store(&docs, "A");
  let other = store_builder(&docs, "B")
    .instance_name("other-cluster")
    .build()
    .unwrap();

  let job = job("shared-name").durable(true);
  billing.store_job(&job, false).await.unwrap();
  other.store_job(&job, false).await.unwrap();
  assert!(billing.remove_job(&job.key).await.unwrap());
  assert!(other.check_job_exists(&job.key).await.unwrap());
}
