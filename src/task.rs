use crate::error::TaskError;
use crate::outstanding::OutstandingGuard;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// What a task body resolves to.
pub type TaskResult = Result<(), TaskError>;

/// The type of future that the pool executes.
pub type TaskToExecute = Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>>;

type TaskBody = Box<dyn FnOnce(TaskContext) -> TaskToExecute + Send + 'static>;

/// An opaque unit of work.
///
/// The body is only invoked once an executor picks the task up, and receives
/// a [`TaskContext`] it should consult to stop early once the pool is
/// cancelled.
pub struct Task {
  body: TaskBody,
}

impl Task {
  pub fn new<F, Fut, E>(body: F) -> Self
  where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<TaskError> + 'static,
  {
    Self {
      // `body` runs inside the future so a panic in the closure is caught with the task.
      body: Box::new(move |ctx| -> TaskToExecute {
        Box::pin(async move { body(ctx).await.map_err(Into::into) })
      }),
    }
  }

  pub(crate) fn into_future(self, ctx: TaskContext) -> TaskToExecute {
    (self.body)(ctx)
  }
}

impl fmt::Debug for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task").finish_non_exhaustive()
  }
}

/// Cancellation-aware execution context handed to every running task.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub(crate) token: CancellationToken,
  pub(crate) executor_id: usize,
  pub(crate) pool_name: Arc<String>,
}

impl TaskContext {
  /// `true` once the pool has been cancelled (task failure, parent
  /// cancellation or deadline).
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Resolves when the pool is cancelled.
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }

  /// A token tied to the pool's lifetime, for handing to nested operations.
  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }

  pub fn executor_id(&self) -> usize {
    self.executor_id
  }

  pub fn pool_name(&self) -> &str {
    &self.pool_name
  }
}

/// Internal representation of a submitted task while it waits in intake or runs.
pub(crate) struct QueuedTask {
  pub(crate) task_id: u64,
  pub(crate) task: Task,
  /// Released when the task has finished or been discarded.
  pub(crate) _outstanding: OutstandingGuard,
}

impl fmt::Debug for QueuedTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedTask")
      .field("task_id", &self.task_id)
      .finish_non_exhaustive()
  }
}
