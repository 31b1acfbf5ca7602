//! Background loop that applies misfire instructions to overdue triggers.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::jobstore::{JobStore, RecoverMisfiredJobsResult};
use crate::metrics::StoreMetrics;

/// Shortest pause between two passes.
const MIN_PAUSE: Duration = Duration::from_millis(50);

pub(crate) struct MisfireHandler {
  store: JobStore,
  shutdown_rx: watch::Receiver<bool>,
  num_fails: u32,
}

impl MisfireHandler {
  pub(crate) fn new(store: JobStore, shutdown_rx: watch::Receiver<bool>) -> Self {
    Self {
      store,
      shutdown_rx,
      num_fails: 0,
    }
  }

  async fn manage(&mut self) -> RecoverMisfiredJobsResult {
    debug!("MisfireHandler: scanning for misfires...");
    match self.store.recover_misfires().await {
      Ok(result) => {
        self.num_fails = 0;
        result
      }
      Err(e) => {
        if self.num_fails % 4 == 0 {
          error!(error = %e, failures = self.num_fails + 1, "MisfireHandler: Error handling misfires");
        }
        self.num_fails += 1;
        StoreMetrics::incr(&self.store.metrics().background_failures);
        RecoverMisfiredJobsResult::NO_OP
      }
    }
  }

  pub(crate) async fn run(mut self) {
    info!(instance_id = %self.store.instance_id(), "Misfire handler started.");
    loop {
      let started = Instant::now();
      let result = self.manage().await;
      if result.processed_misfired_trigger_count > 0 {
        self
          .store
          .signaler()
          .signal_scheduling_change(result.earliest_new_time);
      }

      let config = self.store.config();
      let pause = next_pause(
        config.misfire_threshold,
        config.db_retry_interval,
        started.elapsed(),
        result.has_more_misfired_triggers,
        self.num_fails > 0,
      );

      tokio::select! {
        biased;
        _ = self.shutdown_rx.changed() => {
          break;
        }
        _ = tokio::time::sleep(pause) => {}
      }
    }
    info!(instance_id = %self.store.instance_id(), "Misfire handler stopped.");
  }
}

/// Pause before the next pass: short while a backlog remains, otherwise the rest of
/// the misfire threshold, and never less than the retry interval while failing.
fn next_pause(
  threshold: Duration,
  db_retry_interval: Duration,
  elapsed: Duration,
  has_more: bool,
  failing: bool,
) -> Duration {
  if has_more {
    return MIN_PAUSE;
  }
  let mut pause = threshold.saturating_sub(elapsed);
  if pause.is_zero() {
    pause = MIN_PAUSE;
  }
  if failing {
    pause = pause.max(db_retry_interval);
  }
  pause
}

#[cfg(test)]
mod tests {
  use super::*;

  const SECOND: Duration = Duration::from_secs(1);

  #[test]
  fn backlog_is_drained_quickly() {
    assert_eq!(next_pause(60 * SECOND, 15 * SECOND, SECOND, true, true), MIN_PAUSE);
  }

  #[test]
  fn waits_out_the_threshold() {
    assert_eq!(next_pause(60 * SECOND, 15 * SECOND, SECOND, false, false), 59 * SECOND);
    assert_eq!(next_pause(SECOND, 15 * SECOND, 2 * SECOND, false, false), MIN_PAUSE);
  }

  #[test]
  fn failures_back_off_to_retry_interval() {
    assert_eq!(next_pause(SECOND, 15 * SECOND, Duration::ZERO, false, true), 15 * SECOND);
  }
}
