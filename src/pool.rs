use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::latch::ErrorLatch;
use crate::outstanding::OutstandingCounter;
use crate::task::{QueuedTask, Task, TaskContext};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Why `join` stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinOutcome {
  Drained,
  Cancelled,
}

/// A fixed set of executors working through a batch of tasks.
///
/// The first task to fail cancels the pool and its error is what
/// [`join`](Self::join) reports. Cancellation is cooperative: it stops
/// queued tasks from starting, while tasks already running see it through
/// their [`TaskContext`] and are expected to return early on their own.
pub struct ExecutionPool {
  pool_name: Arc<String>,
  executor_count: usize,
  scope: CancellationToken,
  intake: QueueProducer,
  leftovers: QueueConsumer,
  outstanding: OutstandingCounter,
  latch: Arc<ErrorLatch>,
  active_tasks: Arc<DashMap<u64, usize>>,
  closed: AtomicBool,
  executor_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionPool {
  /// Starts a pool with `executor_count` executors whose lifetime is bound to `parent`.
  pub fn new(parent: &CancellationToken, executor_count: usize) -> Result<Arc<Self>, PoolError> {
    Self::with_config(parent, PoolConfig::new(executor_count))
  }

  pub fn with_config(parent: &CancellationToken, config: PoolConfig) -> Result<Arc<Self>, PoolError> {
    if config.executor_count == 0 {
      error!(pool_name = %config.name, "Refusing to start a pool with zero executors.");
      return Err(PoolError::InvalidExecutorCount(config.executor_count));
    }
    let tokio_handle = match config.tokio_handle.clone() {
      Some(handle) => handle,
      None => TokioHandle::try_current().map_err(|_| PoolError::NoRuntime)?,
    };

    let (producer, consumer) = TaskQueue::new(config.intake_capacity).split();
    let scope = parent.child_token();

    let pool = Arc::new(Self {
      pool_name: Arc::new(config.name.clone()),
      executor_count: config.executor_count,
      scope: scope.clone(),
      intake: producer,
      leftovers: consumer.clone(),
      outstanding: OutstandingCounter::new(),
      latch: Arc::new(ErrorLatch::new()),
      active_tasks: Arc::new(DashMap::new()),
      closed: AtomicBool::new(false),
      executor_handles: Mutex::new(Vec::with_capacity(config.executor_count)),
    });

    let mut handles = Vec::with_capacity(config.executor_count);
    for executor_id in 0..config.executor_count {
      let executor = Executor {
        executor_id,
        pool_name: pool.pool_name.clone(),
        intake: consumer.clone(),
        scope: scope.clone(),
        latch: pool.latch.clone(),
        active_tasks: pool.active_tasks.clone(),
      };
      handles.push(tokio_handle.spawn(
        executor
          .run()
          .instrument(info_span!("pool_executor", pool_name = %config.name, executor_id)),
      ));
    }
    *pool.executor_handles.lock() = handles;

    if let Some(deadline) = config.deadline {
      tokio_handle.spawn(
        Self::watch_deadline(deadline, scope, pool.outstanding.clone(), pool.latch.clone())
          .instrument(info_span!("pool_deadline", pool_name = %config.name)),
      );
    }

    info!(
      pool_name = %config.name,
      executor_count = config.executor_count,
      intake_capacity = ?config.intake_capacity,
      deadline = ?config.deadline,
      "Execution pool started."
    );
    Ok(pool)
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn executor_count(&self) -> usize {
    self.executor_count
  }

  /// Tasks submitted but not yet finished, queued or running.
  pub fn outstanding_task_count(&self) -> usize {
    self.outstanding.get()
  }

  /// Tasks an executor is currently running.
  pub fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  /// `(task_id, executor_id)` for every task currently running.
  pub fn active_tasks(&self) -> Vec<(u64, usize)> {
    self
      .active_tasks
      .iter()
      .map(|entry| (*entry.key(), *entry.value()))
      .collect()
  }

  /// Tasks waiting in intake for a free executor.
  pub fn queued_task_count(&self) -> usize {
    self.intake.len()
  }

  pub fn is_cancelled(&self) -> bool {
    self.scope.is_cancelled()
  }

  /// `true` once `join` has returned.
  pub fn is_closed(&self) -> bool {
    self.closed.load(AtomicOrdering::Acquire)
  }

  /// The error latched so far, without waiting.
  pub fn current_error(&self) -> Option<PoolError> {
    self.latch.current_error()
  }

  /// Queues `tasks` for execution and returns how many were accepted.
  ///
  /// Tasks submitted once the pool is cancelled are dropped without running;
  /// submissions racing with cancellation may land on either side.
  ///
  /// # Errors
  /// Returns `PoolError::PoolClosed` if `join` has already returned.
  pub async fn submit<I>(&self, tasks: I) -> Result<usize, PoolError>
  where
    I: IntoIterator<Item = Task>,
  {
    if self.is_closed() {
      warn!(pool_name = %self.pool_name, "Submit: Attempted to submit tasks to a pool that has already been joined.");
      return Err(PoolError::PoolClosed);
    }

    let mut accepted = 0usize;
    for task in tasks {
      if self.scope.is_cancelled() {
        debug!(pool_name = %self.pool_name, "Submit: Pool is cancelled, dropping task.");
        continue;
      }

      let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
      let queued = QueuedTask {
        task_id,
        task,
        _outstanding: self.outstanding.register(),
      };

      match self.intake.send(queued, &self.scope).await {
        Ok(()) => {
          debug!(pool_name = %self.pool_name, %task_id, "Task handed to intake.");
          accepted += 1;
        }
        Err(PoolError::PoolShuttingDown) => {
          debug!(pool_name = %self.pool_name, %task_id, "Submit: Pool cancelled during handoff, task dropped.");
        }
        Err(send_error) => {
          if self.intake.is_closed() {
            warn!(pool_name = %self.pool_name, %task_id, "Submit: Intake closed by a concurrent join, task dropped.");
            return Err(PoolError::PoolClosed);
          }
          error!(pool_name = %self.pool_name, %task_id, "Submit: Failed to hand task to intake: {:?}", send_error);
          return Err(send_error);
        }
      }
    }
    Ok(accepted)
  }

  /// Wraps `body` in a [`Task`] and submits it.
  pub async fn spawn<F, Fut, E>(&self, body: F) -> Result<usize, PoolError>
  where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<TaskError> + 'static,
  {
    self.submit([Task::new(body)]).await
  }

  /// Cancels the pool from outside, with the same effect as cancelling the
  /// parent token. Queued tasks will not start and `join` reports
  /// `PoolError::Cancelled` unless a task error was latched first.
  pub fn cancel(&self) {
    info!(pool_name = %self.pool_name, "Pool cancelled explicitly.");
    self.scope.cancel();
  }

  /// Waits until every submitted task has finished or the pool is cancelled,
  /// then returns the first latched error.
  ///
  /// The wait is driven by change notifications on the outstanding counter and
  /// by the cancellation scope; it never polls. If all tasks have finished
  /// when cancellation is observed, completion takes precedence.
  ///
  /// After this returns, intake is closed and further `submit` calls fail.
  /// Tasks still running after a cancellation are left to finish on their own.
  pub async fn join(&self) -> Result<(), PoolError> {
    let outcome = tokio::select! {
      biased;
      _ = self.outstanding.drained() => JoinOutcome::Drained,
      _ = self.scope.cancelled() => JoinOutcome::Cancelled,
    };

    if outcome == JoinOutcome::Cancelled && self.latch.record_error(PoolError::Cancelled) {
      info!(pool_name = %self.pool_name, "Join: Pool lifetime cancelled externally.");
    }

    self.teardown(outcome).await;

    match self.latch.current_error() {
      Some(err) => {
        info!(pool_name = %self.pool_name, ?outcome, error = %err, "Join: Batch finished with an error.");
        Err(err)
      }
      None => {
        info!(pool_name = %self.pool_name, ?outcome, "Join: Batch finished successfully.");
        Ok(())
      }
    }
  }

  async fn teardown(&self, outcome: JoinOutcome) {
    if self.closed.swap(true, AtomicOrdering::AcqRel) {
      trace!(pool_name = %self.pool_name, "Teardown already done by an earlier join.");
      return;
    }
    self.intake.close();
    self.scope.cancel();
    info!(pool_name = %self.pool_name, "Intake closed and pool scope cancelled.");

    // Executors stop receiving once the scope is cancelled; whatever is still
    // queued never starts.
    let mut discarded = 0usize;
    while let Some(queued) = self.leftovers.recv().await {
      trace!(pool_name = %self.pool_name, task_id = queued.task_id, "Discarding queued task that never started.");
      discarded += 1;
    }
    if discarded > 0 {
      debug!(pool_name = %self.pool_name, discarded, "Discarded queued tasks during teardown.");
    }

    let handles = std::mem::take(&mut *self.executor_handles.lock());
    if outcome == JoinOutcome::Cancelled {
      debug!(
        pool_name = %self.pool_name,
        outstanding = self.outstanding.get(),
        "Not waiting for executors; in-flight tasks finish cooperatively."
      );
      return;
    }

    for handle in handles {
      if let Err(join_error) = handle.await {
        error!(pool_name = %self.pool_name, "Error joining executor during teardown: {:?}", join_error);
      }
    }
    debug!(pool_name = %self.pool_name, "All executors joined.");
  }

  async fn watch_deadline(
    deadline: Duration,
    scope: CancellationToken,
    outstanding: OutstandingCounter,
    latch: Arc<ErrorLatch>,
  ) {
    tokio::select! {
      biased;
      _ = scope.cancelled() => {
        trace!("Pool scope ended before the deadline.");
      }
      _ = tokio::time::sleep(deadline) => {
        // An idle pool is still closed to new work, but has nothing to report.
        let remaining = outstanding.get();
        if remaining == 0 {
          debug!(?deadline, "Deadline reached with no outstanding work, cancelling pool.");
        } else if latch.record_error(PoolError::DeadlineExceeded(deadline)) {
          warn!(?deadline, remaining, "Deadline exceeded, cancelling pool.");
        }
        scope.cancel();
      }
    }
  }
}

impl std::fmt::Debug for ExecutionPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutionPool")
      .field("pool_name", &self.pool_name)
      .field("executor_count", &self.executor_count)
      .field("outstanding", &self.outstanding.get())
      .field("active", &self.active_tasks.len())
      .field("cancelled", &self.scope.is_cancelled())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl Drop for ExecutionPool {
  fn drop(&mut self) {
    if !self.scope.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "ExecutionPool dropped without join. Cancelling scope and closing intake."
      );
      self.scope.cancel();
      self.intake.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Pool already cancelled or joined.");
    }
  }
}

/// One of the pool's fixed executors.
struct Executor {
  executor_id: usize,
  pool_name: Arc<String>,
  intake: QueueConsumer,
  scope: CancellationToken,
  latch: Arc<ErrorLatch>,
  active_tasks: Arc<DashMap<u64, usize>>,
}

impl Executor {
  async fn run(self) {
    debug!("Executor started.");

    loop {
      let next = tokio::select! {
        biased;
        _ = self.scope.cancelled() => {
          debug!("Pool scope cancelled. Executor exiting.");
          break;
        }
        received = self.intake.recv() => received,
      };

      let queued = match next {
        Some(queued) => queued,
        None => {
          debug!("Intake closed and empty. Executor exiting.");
          break;
        }
      };

      if self.scope.is_cancelled() {
        debug!(task_id = queued.task_id, "Dequeued task after cancellation, discarding.");
        self.latch_interruption(queued.task_id);
        continue;
      }

      self.execute(queued).await;
    }

    trace!("Executor stopped.");
  }

  async fn execute(&self, queued: QueuedTask) {
    let QueuedTask {
      task_id,
      task,
      _outstanding: outstanding,
    } = queued;

    let ctx = TaskContext {
      token: self.scope.child_token(),
      executor_id: self.executor_id,
      pool_name: self.pool_name.clone(),
    };

    self.active_tasks.insert(task_id, self.executor_id);
    trace!(%task_id, "Running task.");

    let outcome = AssertUnwindSafe(task.into_future(ctx)).catch_unwind().await;
    self.active_tasks.remove(&task_id);

    let failure = match outcome {
      Ok(Ok(())) => {
        trace!(%task_id, "Task completed successfully.");
        None
      }
      Ok(Err(task_error)) => {
        debug!(%task_id, error = %task_error, "Task returned an error.");
        Some(PoolError::task(task_error))
      }
      Err(_panic_payload) => {
        error!(%task_id, "Task panicked during execution.");
        Some(PoolError::TaskPanicked)
      }
    };

    match failure {
      Some(err) => {
        if self.latch.record_error(err) {
          info!(%task_id, "First task failure latched. Cancelling pool.");
        } else {
          trace!(%task_id, "Pool already has an error latched, discarding this one.");
        }
        self.scope.cancel();
      }
      None if self.scope.is_cancelled() => self.latch_interruption(task_id),
      None => {}
    }

    // The decrement must not be observable before the task has returned or
    // before the cancellation it saw is latched.
    drop(outstanding);
  }

  /// Records that the scope cut this task short. Task failures and the
  /// deadline latch before they cancel, so this only lands when the parent
  /// token or `ExecutionPool::cancel` was the cause.
  fn latch_interruption(&self, task_id: u64) {
    if self.latch.record_error(PoolError::Cancelled) {
      info!(%task_id, "Pool cancelled while work was outstanding.");
    }
  }
}
