//! A Tokio-based pool that runs a batch of futures on a fixed number of
//! executors, keeps the first error, and cancels the rest of the batch
//! cooperatively once something fails.
//!
//! ```no_run
//! use futures_batchpool::{ExecutionPool, Task, TaskError};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), futures_batchpool::PoolError> {
//! let parent = CancellationToken::new();
//! let pool = ExecutionPool::new(&parent, 4)?;
//!
//! pool
//!   .submit((0..10).map(|i| {
//!     Task::new(move |ctx| async move {
//!       if ctx.is_cancelled() {
//!         return Ok(());
//!       }
//!       if i == 7 {
//!         return Err(TaskError::from("seven failed"));
//!       }
//!       Ok(())
//!     })
//!   }))
//!   .await?;
//!
//! pool.join().await
//! # }
//! ```

mod config;
mod error;
mod latch;
mod outstanding;
mod pool;
mod task;
mod task_queue;

pub use config::{IntakeCapacity, PoolConfig};
pub use error::{PoolError, TaskError};
pub use latch::ErrorLatch;
pub use pool::ExecutionPool;
pub use task::{Task, TaskContext, TaskResult, TaskToExecute};
