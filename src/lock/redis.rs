use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{LockHandle, LockManager, LockRetryPolicy, LockType};
use crate::error::{JobStoreError, Result};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Lease lock held in Redis.
///
/// Acquire is `SET key token NX PX ttl`; release deletes the key only while it still
/// holds this handle's token. Unlike the store lock, acquisition waits a bounded time
/// and then fails with a persistence error.
pub struct RedisLockManager {
  client: ::redis::Client,
  key_prefix: String,
  gate: Mutex<()>,
  retry: LockRetryPolicy,
  lease_ttl: Duration,
}

impl RedisLockManager {
  /// Connects lazily to `redis_url`; lock keys are namespaced by `instance_name`.
  pub fn new(redis_url: &str, instance_name: &str) -> Result<Self> {
    let client = ::redis::Client::open(redis_url)
      .map_err(|e| JobStoreError::persistence(format!("Invalid Redis URL {}: {}", redis_url, e)))?;
    Ok(Self {
      client,
      key_prefix: format!("turnkeeper:{}:lock:", instance_name),
      gate: Mutex::new(()),
      retry: LockRetryPolicy::bounded(Duration::from_millis(50), Duration::from_secs(10)),
      lease_ttl: Duration::from_secs(30),
    })
  }

  pub fn with_retry_policy(mut self, retry: LockRetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
    self.lease_ttl = lease_ttl;
    self
  }

  fn key(&self, lock_type: LockType) -> String {
    format!("{}{}", self.key_prefix, lock_type)
  }

  async fn connection(&self) -> Result<::redis::aio::MultiplexedConnection> {
    self
      .client
      .get_multiplexed_async_connection()
      .await
      .map_err(|e| JobStoreError::persistence(format!("Redis connection failed: {}", e)))
  }
}

#[async_trait]
impl LockManager for RedisLockManager {
  async fn acquire(&self, lock_type: LockType, requestor: &str) -> Result<LockHandle> {
    let key = self.key(lock_type);
    let ttl_ms = self.lease_ttl.as_millis() as u64;
    let started = Instant::now();

    loop {
      let token = Uuid::new_v4().to_string();
      let acquired = {
        let _gate = self.gate.lock().await;
        let mut conn = self.connection().await?;
        ::redis::cmd("SET")
          .arg(&key)
          .arg(&token)
          .arg("NX")
          .arg("PX")
          .arg(ttl_ms)
          .query_async::<Option<String>>(&mut conn)
          .await
          .map_err(|e| JobStoreError::persistence(format!("Redis SET {} failed: {}", key, e)))?
          .is_some()
      };

      if acquired {
        debug!(lock_type = %lock_type, requestor, "Redis lock obtained");
        return Ok(LockHandle {
          lock_type,
          token,
          requestor: requestor.to_string(),
          acquired_at: Utc::now(),
        });
      }

      trace!(lock_type = %lock_type, requestor, "Redis lock is held elsewhere, retrying");
      if self.retry.is_exhausted(started.elapsed()) {
        return Err(JobStoreError::persistence(format!(
          "Could not obtain Redis lock {} for {} within {:?}",
          lock_type,
          requestor,
          started.elapsed()
        )));
      }
      self.retry.pause().await;
    }
  }

  async fn release(&self, handle: LockHandle) -> Result<()> {
    let key = self.key(handle.lock_type);
    let _gate = self.gate.lock().await;
    let mut conn = self.connection().await?;
    let removed = ::redis::cmd("EVAL")
      .arg(RELEASE_SCRIPT)
      .arg(1)
      .arg(&key)
      .arg(&handle.token)
      .query_async::<i64>(&mut conn)
      .await
      .map_err(|e| JobStoreError::persistence(format!("Redis lock release failed: {}", e)))?;

    if removed == 0 {
      warn!(
        lock_type = %handle.lock_type,
        requestor = %handle.requestor,
        "Redis lock was not held at release (lease expired or taken over)"
      );
    } else {
      debug!(lock_type = %handle.lock_type, requestor = %handle.requestor, "Redis lock returned");
    }
    Ok(())
  }
}
