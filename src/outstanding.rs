use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Count of submitted-but-not-yet-completed tasks.
///
/// Backed by a `watch` channel so that waiters are woken on every transition
/// instead of polling the value.
#[derive(Clone)]
pub(crate) struct OutstandingCounter {
  tx: Arc<watch::Sender<usize>>,
}

impl OutstandingCounter {
  pub(crate) fn new() -> Self {
    let (tx, _rx) = watch::channel(0usize);
    Self { tx: Arc::new(tx) }
  }

  /// Increments the counter. The returned guard decrements it exactly once when dropped.
  pub(crate) fn register(&self) -> OutstandingGuard {
    self.tx.send_modify(|count| *count += 1);
    OutstandingGuard { tx: self.tx.clone() }
  }

  pub(crate) fn get(&self) -> usize {
    *self.tx.borrow()
  }

  /// Resolves once the counter is observed at zero.
  pub(crate) async fn drained(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives in `self`, so the channel cannot close while we wait.
    let _ = rx.wait_for(|count| *count == 0).await;
  }
}

impl fmt::Debug for OutstandingCounter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutstandingCounter").field("count", &self.get()).finish()
  }
}

/// Held by a task from submission until it has finished or been discarded.
pub(crate) struct OutstandingGuard {
  tx: Arc<watch::Sender<usize>>,
}

impl fmt::Debug for OutstandingGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutstandingGuard").finish_non_exhaustive()
  }
}

impl Drop for OutstandingGuard {
  fn drop(&mut self) {
    self.tx.send_modify(|count| {
      debug_assert!(*count > 0, "outstanding counter underflow");
      *count = count.saturating_sub(1);
    });
  }
}
