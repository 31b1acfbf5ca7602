//! TurnKeeper JobStore: a persistent, cluster-aware job store
//!
//! Keeps jobs, triggers, calendars and the in-flight firing records of a scheduler in a
//! shared document store, so that several scheduler processes with the same instance
//! name can cooperate: each trigger fires on exactly one process, and the work of a
//! process that dies is released or re-run by the survivors.
//!
//! # Features
//!
//! - Durable jobs and triggers (simple, cron, calendar-interval and daily-time-interval
//!   schedules) with exclusion calendars.
//! - Trigger state machine with pause/resume per trigger, group, job or everything.
//! - Jobs that disallow concurrent execution: at most one firing in flight cluster-wide.
//! - Misfire handling: a background loop applies each trigger's misfire instruction once
//!   it is late by more than the misfire threshold.
//! - Clustering: members check in periodically; overdue members are recovered, and jobs
//!   that request recovery are re-run through one-shot triggers in `RECOVERING_JOBS`.
//! - Pluggable storage ([`repository`]) and locking ([`lock`]). An in-memory document
//!   store is included; a Redis lease lock is available with the `redis_lock` feature.
//! - Metrics snapshot ([`MetricsSnapshot`]) and `tracing` integration.
//!
//! # Usage
//!
//! ```no_run
//! use turnkeeper_jobstore::{
//!     CompletedExecutionInstruction, JobDetail, JobKey, JobStore, MemoryDocumentStore, Trigger,
//!     TriggerKey, TriggerSchedule,
//! };
//! use chrono::{Duration as ChronoDuration, Utc};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let documents = MemoryDocumentStore::new();
//!     let store = JobStore::builder()
//!         .instance_name("billing")
//!         .instance_id("node-1")
//!         .clustered(true)
//!         .memory_store(&documents)
//!         .build()?;
//!     store.scheduler_started().await?;
//!
//!     let job = JobDetail::new(JobKey::new("invoice", "billing"), "InvoiceJob").durable(true);
//!     let trigger = Trigger::builder(TriggerKey::new("hourly", "billing"), job.key.clone())
//!         .with_schedule(TriggerSchedule::cron("0 0 * * * *"))
//!         .build()?;
//!     store.store_job_and_trigger(&job, &trigger).await?;
//!
//!     // One round of a scheduler's fire loop.
//!     let due = store
//!         .acquire_next_triggers(Utc::now() + ChronoDuration::seconds(30), 10, ChronoDuration::zero())
//!         .await?;
//!     for fired in store.triggers_fired(&due).await? {
//!         if let Ok(Some(bundle)) = fired {
//!             // ... run bundle.job ...
//!             store
//!                 .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::NoInstruction)
//!                 .await?;
//!         }
//!     }
//!
//!     store.shutdown(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`JobStoreBuilder`]: instance name and id, misfire threshold, misfire batch
//! size, retry interval of the background loops, clustering with its check-in interval
//! and grace period, and the lock manager. See [`JobStoreConfig`] for the defaults.
//!
//! # Observability
//!
//! - Retrieve counters with [`JobStore::metrics_snapshot`].
//! - Register a [`SchedulerSignaler`] to learn about misfires, finalized triggers,
//!   cascaded job deletions and scheduling changes.
//! - All components log through `tracing`.

pub mod calendar;
mod cluster;
pub mod error;
pub mod job;
pub mod jobstore;
pub mod lock;
pub mod matcher;
pub mod metrics;
mod misfire;
pub mod repository;
pub mod signal;
pub mod trigger;

// --- Public Re-exports ---

pub use calendar::{Calendar, CalendarRule};
pub use error::{ConfigError, JobStoreError, Result, ShutdownError, StoreError};
pub use job::{JobDataMap, JobDetail, JobKey, TriggerKey, DEFAULT_GROUP};
pub use jobstore::{
  JobStore, JobStoreBuilder, JobStoreConfig, RecoverMisfiredJobsResult, ALL_GROUPS_PAUSED,
  NON_CLUSTERED_INSTANCE_ID, RECOVERING_JOBS_GROUP,
};
pub use lock::{LockManager, LockRetryPolicy, LockType, StoreLockManager};
#[cfg(feature = "redis_lock")]
pub use lock::RedisLockManager;
pub use matcher::GroupMatcher;
pub use metrics::MetricsSnapshot;
pub use repository::{MemoryDocumentStore, Repositories};
pub use signal::{NoopSignaler, SchedulerSignaler, SchedulingSignal};
pub use trigger::{
  CompletedExecutionInstruction, IntervalUnit, MisfireInstruction, Trigger, TriggerBuilder,
  TriggerFiredBundle, TriggerSchedule, TriggerState, TriggerStatus, DEFAULT_PRIORITY,
  REPEAT_INDEFINITELY,
};
