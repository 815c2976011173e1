//! # deferq-queue
//!
//! A single-process, at-least-once delayed job queue.
//!
//! Tasks live in a pending snapshot file until due. A due task is handed to
//! the handler registered for its routing key; with no handler it moves to an
//! expired file and waits for a later registration to sweep it out.
//!
//! ```ignore
//! let queue = PersistentQueue::open(QueueConfig::new("jobs.json")).await?;
//! queue.handle_fn("email:", |_ctx, task| async move {
//!     send(&task.payload).await.map_err(HandlerError::failed)
//! }).await?;
//! queue.enqueue("email:welcome", b"alice".to_vec(), Duration::from_secs(60)).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod config;
mod handler;
mod queue;
mod task;

pub use config::QueueConfig;
pub use handler::{FnHandler, HandlerContext, HandlerError, HandlerRegistry, TaskHandler, handler_fn};
pub use queue::{PersistentQueue, QueueBuilder, QueueStats};
pub use task::{PersistedTask, TaskMap};
