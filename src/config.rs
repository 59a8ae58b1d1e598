use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;

/// How many tasks the intake queue holds before `submit` has to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntakeCapacity {
  /// `submit` never waits for space; queued tasks cost memory instead.
  #[default]
  Unbounded,
  /// At most `n` tasks wait in intake. `submit` waits for a slot, giving up
  /// if the pool is cancelled meanwhile. A value of 0 is treated as 1.
  Bounded(usize),
}

/// Construction settings for an [`ExecutionPool`](crate::ExecutionPool).
#[derive(Clone)]
pub struct PoolConfig {
  pub name: String,
  pub executor_count: usize,
  pub intake_capacity: IntakeCapacity,
  /// Cancels the pool if work is still outstanding this long after construction.
  pub deadline: Option<Duration>,
  /// Runtime to spawn executors on. Defaults to the runtime current at construction.
  pub tokio_handle: Option<TokioHandle>,
}

impl PoolConfig {
  pub fn new(executor_count: usize) -> Self {
    Self {
      executor_count,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_executor_count(mut self, executor_count: usize) -> Self {
    self.executor_count = executor_count;
    self
  }

  pub fn with_intake_capacity(mut self, intake_capacity: IntakeCapacity) -> Self {
    self.intake_capacity = intake_capacity;
    self
  }

  pub fn with_deadline(mut self, deadline: Duration) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn with_tokio_handle(mut self, handle: TokioHandle) -> Self {
    self.tokio_handle = Some(handle);
    self
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "execution_pool".to_string(),
      executor_count: 1,
      intake_capacity: IntakeCapacity::Unbounded,
      deadline: None,
      tokio_handle: None,
    }
  }
}

impl fmt::Debug for PoolConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolConfig")
      .field("name", &self.name)
      .field("executor_count", &self.executor_count)
      .field("intake_capacity", &self.intake_capacity)
      .field("deadline", &self.deadline)
      .field("tokio_handle_is_some", &self.tokio_handle.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = PoolConfig::default();
    assert_eq!(config.name, "execution_pool");
    assert_eq!(config.executor_count, 1);
    assert_eq!(config.intake_capacity, IntakeCapacity::Unbounded);
    assert!(config.deadline.is_none());
    assert!(config.tokio_handle.is_none());
  }

  #[test]
  fn builder_overrides() {
    let config = PoolConfig::new(4)
      .with_name("ingest")
      .with_intake_capacity(IntakeCapacity::Bounded(16))
      .with_deadline(Duration::from_secs(3));
    assert_eq!(config.name, "ingest");
    assert_eq!(config.executor_count, 4);
    assert_eq!(config.intake_capacity, IntakeCapacity::Bounded(16));
    assert_eq!(config.deadline, Some(Duration::from_secs(3)));

    let config = config.with_executor_count(2);
    assert_eq!(config.executor_count, 2);
  }
}
