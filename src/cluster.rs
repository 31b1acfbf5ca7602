//! Background loop that keeps this instance's liveness row fresh and recovers failed
//! cluster members.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::jobstore::JobStore;
use crate::metrics::StoreMetrics;

/// Pause used when the next check-in is already due.
const OVERDUE_PAUSE: Duration = Duration::from_millis(100);

pub(crate) struct ClusterManager {
  store: JobStore,
  shutdown_rx: watch::Receiver<bool>,
  num_fails: u32,
}

impl ClusterManager {
  pub(crate) fn new(store: JobStore, shutdown_rx: watch::Receiver<bool>) -> Self {
    Self {
      store,
      shutdown_rx,
      num_fails: 0,
    }
  }

  /// First check-in, run synchronously before the loop starts.
  pub(crate) async fn initialize(&mut self) {
    if self.manage().await {
      self.store.signaler().signal_scheduling_change(None);
    }
  }

  async fn manage(&mut self) -> bool {
    match self.store.do_checkin().await {
      Ok(recovered) => {
        self.num_fails = 0;
        debug!("ClusterManager: Check-in complete.");
        recovered
      }
      Err(e) => {
        if self.num_fails % 4 == 0 {
          error!(error = %e, failures = self.num_fails + 1, "ClusterManager: Error managing cluster");
        }
        self.num_fails += 1;
        StoreMetrics::incr(&self.store.metrics().background_failures);
        false
      }
    }
  }

  pub(crate) async fn run(mut self) {
    info!(instance_id = %self.store.instance_id(), "Cluster manager started.");
    loop {
      let config = self.store.config();
      let pause = next_pause(
        config.cluster_checkin_interval,
        Utc::now() - self.store.last_checkin(),
        config.db_retry_interval,
        self.num_fails > 0,
      );

      tokio::select! {
        biased;
        _ = self.shutdown_rx.changed() => {
          break;
        }
        _ = tokio::time::sleep(pause) => {}
      }

      if self.manage().await {
        self.store.signaler().signal_scheduling_change(None);
      }
    }
    info!(instance_id = %self.store.instance_id(), "Cluster manager stopped.");
  }
}

/// Pause until the next check-in is due, measured from the last one.
fn next_pause(
  interval: Duration,
  since_last: ChronoDuration,
  db_retry_interval: Duration,
  failing: bool,
) -> Duration {
  let elapsed = since_last.to_std().unwrap_or(Duration::ZERO);
  let mut pause = interval.saturating_sub(elapsed);
  if pause.is_zero() {
    pause = OVERDUE_PAUSE;
  }
  if failing {
    pause = pause.max(db_retry_interval);
  }
  pause
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sleeps_until_next_checkin() {
    let pause = next_pause(
      Duration::from_secs(7),
      ChronoDuration::seconds(2),
      Duration::from_secs(15),
      false,
    );
    assert_eq!(pause, Duration::from_secs(5));
  }

  #[test]
  fn overdue_checkin_uses_short_pause() {
    let pause = next_pause(
      Duration::from_secs(1),
      ChronoDuration::seconds(3),
      Duration::from_secs(15),
      false,
    );
    assert_eq!(pause, OVERDUE_PAUSE);
  }

  #[test]
  fn failing_checkins_wait_for_retry_interval() {
    let pause = next_pause(
      Duration::from_secs(1),
      ChronoDuration::zero(),
      Duration::from_secs(15),
      true,
    );
    assert_eq!(pause, Duration::from_secs(15));
  }
}
