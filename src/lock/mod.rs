//! Cluster-wide named locks.
//!
//! Every mutating store operation runs inside [`execute_in_lock`]: acquire the named
//! lease, run the body, release the lease whatever the body returned.

#[cfg(feature = "redis_lock")]
pub mod redis;
pub mod store;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Result;

#[cfg(feature = "redis_lock")]
pub use self::redis::RedisLockManager;
pub use store::StoreLockManager;

/// The two independent locks of one instance name.
///
/// Cluster check-in takes `StateAccess` first and then `TriggerAccess`, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockType {
  TriggerAccess,
  StateAccess,
}

impl fmt::Display for LockType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LockType::TriggerAccess => f.write_str("TRIGGER_ACCESS"),
      LockType::StateAccess => f.write_str("STATE_ACCESS"),
    }
  }
}

/// Proof of a held lease. Pass it back to [`LockManager::release`] exactly once.
#[derive(Debug)]
pub struct LockHandle {
  pub lock_type: LockType,
  /// Fencing token; release only removes the lease when the token still matches.
  pub token: String,
  pub requestor: String,
  pub acquired_at: DateTime<Utc>,
}

#[async_trait]
pub trait LockManager: Send + Sync {
  /// Blocks until the lease is held, or fails with a persistence error.
  async fn acquire(&self, lock_type: LockType, requestor: &str) -> Result<LockHandle>;

  /// Releases a lease obtained from [`LockManager::acquire`].
  async fn release(&self, handle: LockHandle) -> Result<()>;
}

/// How a lock manager waits between acquisition attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRetryPolicy {
  pub poll_interval: Duration,
  /// Give up with a persistence error after this long. `None` waits forever.
  pub max_wait: Option<Duration>,
}

impl Default for LockRetryPolicy {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(1),
      max_wait: None,
    }
  }
}

impl LockRetryPolicy {
  /// Retries without sleeping, only yielding to the runtime. Meant for tests.
  pub fn immediate() -> Self {
    Self {
      poll_interval: Duration::ZERO,
      max_wait: None,
    }
  }

  pub fn bounded(poll_interval: Duration, max_wait: Duration) -> Self {
    Self {
      poll_interval,
      max_wait: Some(max_wait),
    }
  }

  pub(crate) fn is_exhausted(&self, waited: Duration) -> bool {
    self.max_wait.is_some_and(|max| waited >= max)
  }

  pub(crate) async fn pause(&self) {
    if self.poll_interval.is_zero() {
      tokio::task::yield_now().await;
    } else {
      tokio::time::sleep(self.poll_interval).await;
    }
  }
}

/// Runs `body` while holding `lock_type`.
///
/// The lease is released on both the success and the error path. If releasing fails
/// after a successful body, the release error is returned; after a failed body the
/// body's error wins and the release failure is only logged.
///
/// Dropping the returned future mid-body leaks the lease until the backend's TTL
/// expires it.
pub async fn execute_in_lock<T, F, Fut>(
  locks: &dyn LockManager,
  lock_type: LockType,
  requestor: &str,
  body: F,
) -> Result<T>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let handle = locks.acquire(lock_type, requestor).await?;
  let outcome = body().await;

  match locks.release(handle).await {
    Ok(()) => outcome,
    Err(release_err) => {
      error!(lock_type = %lock_type, requestor, error = %release_err, "Failed to release lock");
      match outcome {
        Ok(_) => Err(release_err),
        Err(body_err) => Err(body_err),
      }
    }
  }
}
