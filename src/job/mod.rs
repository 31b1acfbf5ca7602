use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Group assigned to jobs and triggers that are created without one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

// --- Identity Keys ---

/// Identity of a stored job: `(name, group)`, unique within one instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
  pub name: String,
  pub group: String,
}

impl JobKey {
  pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      group: group.into(),
    }
  }

  /// Creates a key in [`DEFAULT_GROUP`].
  pub fn with_default_group(name: impl Into<String>) -> Self {
    Self::new(name, DEFAULT_GROUP)
  }
}

impl fmt::Display for JobKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.group, self.name)
  }
}

/// Identity of a stored trigger: `(name, group)`, unique within one instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
  pub name: String,
  pub group: String,
}

impl TriggerKey {
  pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      group: group.into(),
    }
  }

  /// Creates a key in [`DEFAULT_GROUP`].
  pub fn with_default_group(name: impl Into<String>) -> Self {
    Self::new(name, DEFAULT_GROUP)
  }
}

impl fmt::Display for TriggerKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.group, self.name)
  }
}

// --- Job Data ---

/// Opaque key/value data attached to jobs and triggers.
///
/// Mutations mark the map dirty so the store knows whether a job's data has to be
/// written back after execution (see [`JobDetail::persist_job_data_after_execution`]).
/// The dirty flag is runtime-only and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDataMap {
  entries: BTreeMap<String, Value>,
  #[serde(skip)]
  dirty: bool,
}

impl JobDataMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.entries.get(key)
  }

  /// Inserts a value, returning the previous one. Marks the map dirty.
  pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
    self.dirty = true;
    self.entries.insert(key.into(), value.into())
  }

  pub fn remove(&mut self, key: &str) -> Option<Value> {
    let removed = self.entries.remove(key);
    if removed.is_some() {
      self.dirty = true;
    }
    removed
  }

  pub fn contains_key(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.entries.iter()
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  pub fn clear_dirty_flag(&mut self) {
    self.dirty = false;
  }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for JobDataMap {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self {
      entries: iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
      dirty: false,
    }
  }
}

// --- Job Definition ---

/// A durable job definition.
///
/// The store never runs jobs; `job_type` is an opaque reference the scheduler uses to
/// look up the code to execute. Build with [`JobDetail::new`] and the chained setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
  pub key: JobKey,
  /// Opaque reference to the job implementation (e.g. a registered type name).
  pub job_type: String,
  pub description: Option<String>,
  /// Durable jobs survive having no triggers; non-durable jobs are deleted with their last trigger.
  pub durable: bool,
  /// At most one firing of this job may be in flight across the whole cluster.
  pub concurrent_execution_disallowed: bool,
  /// Write `job_data` back to the store after each execution if it was modified.
  pub persist_job_data_after_execution: bool,
  /// Re-fire the job if the instance executing it fails mid-execution.
  pub requests_recovery: bool,
  pub job_data: JobDataMap,
}

impl JobDetail {
  /// Creates a non-durable, concurrent, non-recoverable job.
  pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
    Self {
      key,
      job_type: job_type.into(),
      description: None,
      durable: false,
      concurrent_execution_disallowed: false,
      persist_job_data_after_execution: false,
      requests_recovery: false,
      job_data: JobDataMap::new(),
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn durable(mut self, durable: bool) -> Self {
    self.durable = durable;
    self
  }

  pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
    self.concurrent_execution_disallowed = disallow;
    self
  }

  pub fn persist_job_data_after_execution(mut self, persist: bool) -> Self {
    self.persist_job_data_after_execution = persist;
    self
  }

  pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
    self.requests_recovery = requests_recovery;
    self
  }

  pub fn job_data(mut self, job_data: JobDataMap) -> Self {
    self.job_data = job_data;
    self
  }
}
