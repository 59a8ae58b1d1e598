use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The error type a task body returns. Anything convertible into a boxed
/// `std::error::Error` works, including `&str` and `String`.
pub type TaskError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur within the `futures_batchpool` pool.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
  /// A submitted task returned an error. Displays the task's own message.
  #[error("{0}")]
  Task(Arc<dyn StdError + Send + Sync + 'static>),

  #[error("Submitted task future panicked")]
  TaskPanicked,

  #[error("Pool was cancelled before all submitted tasks completed")]
  Cancelled,

  #[error("Pool deadline of {0:?} exceeded before all submitted tasks completed")]
  DeadlineExceeded(Duration),

  #[error("Executor count must be at least 1, got {0}")]
  InvalidExecutorCount(usize),

  #[error("Pool has already been joined, no further tasks may be submitted")]
  PoolClosed,

  #[error("No Tokio runtime is available to start the pool's executors")]
  NoRuntime,

  #[error("Pool is cancelled, task handoff to the intake queue was abandoned")]
  PoolShuttingDown,

  #[error("Pool's intake queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,
}

impl PoolError {
  /// Wraps a task's own error.
  pub fn task(err: impl Into<TaskError>) -> Self {
    PoolError::Task(Arc::from(err.into()))
  }

  /// Returns the underlying task error, if this error came from a task body.
  pub fn task_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
    match self {
      PoolError::Task(err) => Some(err.as_ref()),
      _ => None,
    }
  }

  /// `true` for errors caused by the pool's lifetime ending rather than by a task.
  pub fn is_cancellation(&self) -> bool {
    matches!(self, PoolError::Cancelled | PoolError::DeadlineExceeded(_))
  }
}
