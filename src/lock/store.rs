use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{LockHandle, LockManager, LockRetryPolicy, LockType};
use crate::error::{JobStoreError, Result};
use crate::repository::{LockRecord, LockRepository};

/// Default lifetime of a lease before other holders may expire it.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Lease lock on the Lock collection of the shared store.
///
/// Acquisition is an insert race on `(instance name, lock type)`: the insert that
/// succeeds holds the lock, everybody else polls. Leases older than the TTL are
/// deleted before each attempt, so a crashed holder cannot block the cluster forever.
pub struct StoreLockManager {
  locks: Arc<dyn LockRepository>,
  // Serializes this process's attempts on the shared lease.
  gate: Mutex<()>,
  retry: LockRetryPolicy,
  lease_ttl: Duration,
}

impl StoreLockManager {
  pub fn new(locks: Arc<dyn LockRepository>) -> Self {
    Self {
      locks,
      gate: Mutex::new(()),
      retry: LockRetryPolicy::default(),
      lease_ttl: DEFAULT_LEASE_TTL,
    }
  }

  pub fn with_retry_policy(mut self, retry: LockRetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
    self.lease_ttl = lease_ttl;
    self
  }

  async fn try_acquire(&self, lock_type: LockType, requestor: &str) -> Result<Option<LockHandle>> {
    let _gate = self.gate.lock().await;
    let now = Utc::now();

    let ttl = ChronoDuration::from_std(self.lease_ttl).unwrap_or(ChronoDuration::MAX);
    let expired = self.locks.delete_expired(now - ttl).await?;
    if expired > 0 {
      warn!(lock_type = %lock_type, expired, "Expired stale lock lease(s) older than the lease TTL");
    }

    let record = LockRecord {
      lock_type,
      token: Uuid::new_v4().to_string(),
      holder: requestor.to_string(),
      acquired_at: now,
    };
    if self.locks.try_insert(&record).await? {
      Ok(Some(LockHandle {
        lock_type,
        token: record.token,
        requestor: record.holder,
        acquired_at: now,
      }))
    } else {
      Ok(None)
    }
  }
}

#[async_trait]
impl LockManager for StoreLockManager {
  async fn acquire(&self, lock_type: LockType, requestor: &str) -> Result<LockHandle> {
    let started = Instant::now();
    let mut attempts: u64 = 0;

    loop {
      attempts += 1;
      if let Some(handle) = self.try_acquire(lock_type, requestor).await? {
        debug!(lock_type = %lock_type, requestor, attempts, "Lock obtained");
        return Ok(handle);
      }

      trace!(lock_type = %lock_type, requestor, attempts, "Lock is held elsewhere, retrying");
      if self.retry.is_exhausted(started.elapsed()) {
        return Err(JobStoreError::persistence(format!(
          "Timed out obtaining lock {} for {} after {:?}",
          lock_type,
          requestor,
          started.elapsed()
        )));
      }
      self.retry.pause().await;
    }
  }

  async fn release(&self, handle: LockHandle) -> Result<()> {
    let _gate = self.gate.lock().await;
    let removed = self.locks.delete(handle.lock_type, &handle.token).await?;
    if removed {
      debug!(lock_type = %handle.lock_type, requestor = %handle.requestor, "Lock returned");
    } else {
      warn!(
        lock_type = %handle.lock_type,
        requestor = %handle.requestor,
        "Lock was not held at release (lease expired or removed)"
      );
    }
    Ok(())
  }
}
