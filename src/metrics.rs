use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Store Metrics (Internal State) ---

/// Atomic counters shared by the job store handle and its background tasks.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
  /// Triggers moved Waiting -> Acquired by `acquire_next_triggers`.
  pub triggers_acquired: Arc<AtomicUsize>,
  /// Triggers released back to Waiting without firing.
  pub triggers_released: Arc<AtomicUsize>,
  /// Successful `triggers_fired` items.
  pub triggers_fired: Arc<AtomicUsize>,
  /// `triggered_job_complete` calls.
  pub jobs_completed: Arc<AtomicUsize>,
  /// Triggers whose misfire instruction was applied.
  pub misfires_handled: Arc<AtomicUsize>,
  /// Misfire handler or cluster manager passes that failed.
  pub background_failures: Arc<AtomicUsize>,
  pub cluster_checkins: Arc<AtomicUsize>,
  /// Failed (or orphaned) instances whose work was recovered.
  pub instances_recovered: Arc<AtomicUsize>,
  /// One-shot recovery triggers stored for requests-recovery jobs.
  pub recovery_triggers_scheduled: Arc<AtomicUsize>,
  /// Time spent waiting to obtain a lock.
  pub lock_wait: Arc<SimpleHistogram>,
}

impl StoreMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn add(counter: &AtomicUsize, n: usize) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    Self::add(counter, 1);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      triggers_acquired: self.triggers_acquired.load(order),
      triggers_released: self.triggers_released.load(order),
      triggers_fired: self.triggers_fired.load(order),
      jobs_completed: self.jobs_completed.load(order),
      misfires_handled: self.misfires_handled.load(order),
      background_failures: self.background_failures.load(order),
      cluster_checkins: self.cluster_checkins.load(order),
      instances_recovered: self.instances_recovered.load(order),
      recovery_triggers_scheduled: self.recovery_triggers_scheduled.load(order),
      locks_acquired: self.lock_wait.get_count(),
      lock_wait_sum_micros: self.lock_wait.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot (Public Data) ---

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
  pub triggers_acquired: usize,
  pub triggers_released: usize,
  pub triggers_fired: usize,
  pub jobs_completed: usize,
  pub misfires_handled: usize,
  pub background_failures: usize,
  pub cluster_checkins: usize,
  pub instances_recovered: usize,
  pub recovery_triggers_scheduled: usize,
  pub locks_acquired: usize,
  pub lock_wait_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean time spent waiting for a lock, if any lock was obtained.
  pub fn mean_lock_wait(&self) -> Option<Duration> {
    if self.locks_acquired == 0 {
      None
    } else {
      Some(Duration::from_micros(
        (self.lock_wait_sum_micros / self.locks_acquired) as u64,
      ))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_reads_counters_and_histogram() {
    let metrics = StoreMetrics::new();
    StoreMetrics::incr(&metrics.triggers_acquired);
    StoreMetrics::add(&metrics.misfires_handled, 3);
    metrics.lock_wait.record(Duration::from_micros(100));
    metrics.lock_wait.record(Duration::from_micros(300));

    let snap = metrics.clone().snapshot();
    assert_eq!(snap.triggers_acquired, 1);
    assert_eq!(snap.misfires_handled, 3);
    assert_eq!(snap.locks_acquired, 2);
    assert_eq!(snap.mean_lock_wait(), Some(Duration::from_micros(200)));
    assert_eq!(MetricsSnapshot::default().mean_lock_wait(), None);
  }
}
