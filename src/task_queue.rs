use crate::config::IntakeCapacity;
use crate::error::PoolError;
use crate::task::QueuedTask;

use fibre::mpmc::{self, AsyncReceiver, AsyncSender};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// An internal message type that pairs a task with the intake slot it holds.
///
/// The slot is released when the message is dropped, which happens once an
/// executor has received it. A bounded queue therefore only frees space after
/// a task has been fully dequeued.
struct QueueMessage {
  task: QueuedTask,
  _permit: Option<OwnedSemaphorePermit>,
}

impl fmt::Debug for QueueMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("task_id", &self.task.task_id)
      .finish_non_exhaustive()
  }
}

/// The pool's intake: many submitters on one side, every executor on the other.
///
/// Built on an unbounded `fibre::mpmc` channel. When a capacity is configured,
/// a `Semaphore` gate in front of the channel provides backpressure.
#[derive(Debug)]
pub(crate) struct TaskQueue {
  tx: AsyncSender<QueueMessage>,
  rx: AsyncReceiver<QueueMessage>,
  gate: Option<Arc<Semaphore>>,
}

impl TaskQueue {
  pub(crate) fn new(capacity: IntakeCapacity) -> Self {
    let (tx, rx) = mpmc::unbounded_async();
    let gate = match capacity {
      IntakeCapacity::Unbounded => None,
      IntakeCapacity::Bounded(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
    };
    Self { tx, rx, gate }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer, QueueConsumer) {
    (
      QueueProducer {
        tx: self.tx,
        gate: self.gate,
        closed: AtomicBool::new(false),
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

/// The producer half. Shared by every caller of `submit`.
pub(crate) struct QueueProducer {
  tx: AsyncSender<QueueMessage>,
  gate: Option<Arc<Semaphore>>,
  // The mpmc sender only reports closure once every receiver is gone.
  closed: AtomicBool,
}

/// The consumer half. Every executor holds its own clone; each message
/// reaches exactly one of them.
#[derive(Clone)]
pub(crate) struct QueueConsumer {
  rx: AsyncReceiver<QueueMessage>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("free_slots", &self.free_slots())
      .finish_non_exhaustive()
  }
}

impl fmt::Debug for QueueConsumer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer").finish_non_exhaustive()
  }
}

impl QueueProducer {
  /// Hands a task to intake.
  ///
  /// With a bounded queue this first waits for a free slot, racing that wait
  /// against `scope`. If the scope is cancelled first the handoff is
  /// abandoned and the task is dropped.
  pub(crate) async fn send(&self, task: QueuedTask, scope: &CancellationToken) -> Result<(), PoolError> {
    if scope.is_cancelled() || self.is_closed() {
      return Err(PoolError::PoolShuttingDown);
    }

    let permit = match &self.gate {
      None => None,
      Some(gate) => {
        tokio::select! {
          biased;
          _ = scope.cancelled() => return Err(PoolError::PoolShuttingDown),
          acquired = gate.clone().acquire_owned() => match acquired {
            Ok(permit) => Some(permit),
            Err(_) => return Err(PoolError::QueueSendChannelClosed),
          },
        }
      }
    };

    let message = QueueMessage { task, _permit: permit };
    if self.tx.send(message).await.is_ok() {
      Ok(())
    } else {
      Err(PoolError::QueueSendChannelClosed)
    }
  }

  /// Closes the sending side. Executors drain what is left and then see a disconnect.
  pub(crate) fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      let _ = self.tx.close();
    }
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Number of tasks waiting in intake.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }

  /// Free slots left in a bounded queue; `None` when unbounded.
  pub(crate) fn free_slots(&self) -> Option<usize> {
    self.gate.as_ref().map(|gate| gate.available_permits())
  }
}

impl QueueConsumer {
  /// Receives the next task.
  ///
  /// Returns `None` only once the queue is closed and empty. The intake slot
  /// is freed as soon as the message is unpacked.
  pub(crate) async fn recv(&self) -> Option<QueuedTask> {
    match self.rx.recv().await {
      Ok(message) => Some(message.task),
      Err(_) => None,
    }
  }
}
