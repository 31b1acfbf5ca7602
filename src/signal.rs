//! Notifications from the store back to the scheduler.

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::job::JobKey;
use crate::trigger::Trigger;

/// Receives fire-and-forget notifications from the store.
///
/// Implementations must not block and must not call back into the store: calls can
/// be made by the background loops as well as by user-facing operations.
pub trait SchedulerSignaler: Send + Sync {
  /// A trigger misfired and its misfire instruction is about to be applied.
  fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);

  /// A trigger will never fire again and was marked complete.
  fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

  /// A non-durable job was deleted together with its last trigger.
  fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey);

  /// Scheduling changed. `candidate` is the new earliest fire time if known; `None`
  /// asks the scheduler to re-scan now.
  fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);
}

/// Signaler that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignaler;

impl SchedulerSignaler for NoopSignaler {
  fn notify_trigger_listeners_misfired(&self, _trigger: &Trigger) {}
  fn notify_scheduler_listeners_finalized(&self, _trigger: &Trigger) {}
  fn notify_scheduler_listeners_job_deleted(&self, _job_key: &JobKey) {}
  fn signal_scheduling_change(&self, _candidate: Option<DateTime<Utc>>) {}
}

/// Accumulates scheduling-change signals raised while a transaction runs.
///
/// The earliest candidate wins; `None` ("now") is earlier than any timestamp. The
/// accumulated signal is dispatched once, after the lock is released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingSignal {
  pending: Option<Option<DateTime<Utc>>>,
}

impl SchedulingSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn raise(&mut self, candidate: Option<DateTime<Utc>>) {
    self.pending = Some(match (self.pending, candidate) {
      (None, c) => c,
      (Some(None), _) | (Some(_), None) => None,
      (Some(Some(current)), Some(c)) => Some(current.min(c)),
    });
  }

  pub fn is_raised(&self) -> bool {
    self.pending.is_some()
  }

  /// The coalesced candidate, if anything was raised.
  pub fn pending(&self) -> Option<Option<DateTime<Utc>>> {
    self.pending
  }

  pub(crate) fn dispatch(self, signaler: &dyn SchedulerSignaler) {
    if let Some(candidate) = self.pending {
      trace!(?candidate, "Signaling scheduling change");
      signaler.signal_scheduling_change(candidate);
    }
  }
}
