use crate::error::PoolError;

use std::fmt;

use parking_lot::Mutex;

/// A write-once holder for the first error of a batch.
///
/// Any number of writers may call [`record_error`](Self::record_error)
/// concurrently. The first one to take the lock claims the slot; every later
/// value is dropped. The slot never changes once set.
pub struct ErrorLatch<E: Clone = PoolError> {
  slot: Mutex<Option<E>>,
}

impl<E: Clone> ErrorLatch<E> {
  pub fn new() -> Self {
    Self { slot: Mutex::new(None) }
  }

  /// Stores `err` if the latch is still empty.
  ///
  /// Returns `true` if this call set the latch, `false` if an earlier error
  /// already holds it (in which case `err` is discarded).
  pub fn record_error(&self, err: E) -> bool {
    let mut slot = self.slot.lock();
    if slot.is_some() {
      return false;
    }
    *slot = Some(err);
    true
  }

  /// Returns a copy of the latched error, if any.
  pub fn current_error(&self) -> Option<E> {
    self.slot.lock().clone()
  }

  pub fn is_set(&self) -> bool {
    self.slot.lock().is_some()
  }
}

impl<E: Clone> Default for ErrorLatch<E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<E: Clone + fmt::Debug> fmt::Debug for ErrorLatch<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ErrorLatch")
      .field("current_error", &self.current_error())
      .finish()
  }
}
