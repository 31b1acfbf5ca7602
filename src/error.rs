use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the store.
pub type Result<T> = std::result::Result<T, JobStoreError>;

// --- Store Driver Errors ---

/// Failures reported by a repository backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  /// An insert collided with an existing `(instance name, key)` document.
  #[error("Duplicate key in {collection}: {key}")]
  DuplicateKey { collection: &'static str, key: String },
  #[error("Store backend error: {0}")]
  Backend(String),
}

// --- Job Store Errors ---

/// Errors surfaced by `JobStore` operations.
#[derive(Error, Debug)]
pub enum JobStoreError {
  /// A store call with `replace_existing == false` found an existing record. Nothing was written.
  #[error("Unable to store {kind} with key '{key}', because one already exists with this identification.")]
  AlreadyExists { kind: &'static str, key: String },
  /// Driver failure, lock timeout, missing referenced record, or a corrupt record.
  #[error("{message}")]
  Persistence {
    message: String,
    #[source]
    source: Option<StoreError>,
  },
  /// The caller passed something the store cannot act on.
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),
}

impl JobStoreError {
  pub(crate) fn persistence(message: impl Into<String>) -> Self {
    JobStoreError::Persistence {
      message: message.into(),
      source: None,
    }
  }

  pub(crate) fn already_exists(kind: &'static str, key: impl fmt::Display) -> Self {
    JobStoreError::AlreadyExists {
      kind,
      key: key.to_string(),
    }
  }
}

impl From<StoreError> for JobStoreError {
  fn from(err: StoreError) -> Self {
    JobStoreError::Persistence {
      message: format!("Couldn't complete store operation: {}", err),
      source: Some(err),
    }
  }
}

// --- Configuration Errors ---

/// Errors rejected eagerly by `JobStoreBuilder::build`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("Misfire threshold must be at least 1 millisecond")]
  MisfireThresholdTooSmall,
  #[error("Maximum misfires to handle at a time must be greater than zero")]
  ZeroMaxMisfires,
  #[error("Cluster check-in interval must be greater than zero")]
  ZeroCheckinInterval,
  #[error("Instance name must not be empty")]
  EmptyInstanceName,
  #[error("Instance id must not be empty")]
  EmptyInstanceId,
  #[error("Repositories must be provided (`repositories` or `memory_store`)")]
  MissingRepositories,
}

// --- Shutdown Errors ---

/// Errors related to `JobStore::shutdown`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Timed out waiting for background tasks (misfire handler, cluster manager) to stop.")]
  Timeout,
  #[error("A background task panicked during shutdown.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::error::Error as _;

  #[test]
  fn store_error_is_kept_as_source() {
    let err: JobStoreError = StoreError::Backend("connection reset".into()).into();
    assert!(err.to_string().contains("connection reset"));
    let source = err.source().expect("source preserved");
    assert_eq!(source.to_string(), "Store backend error: connection reset");
  }
}
