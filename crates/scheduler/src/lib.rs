//! # deferq-scheduler
//!
//! Runs zero-argument async actions at their due time.
//!
//! Every add, cancel, and wake-up is funneled through one coordinating task
//! that owns the heap, so structural changes never interleave. Due actions
//! run on a bounded, supervised pool and are never awaited by the scheduler.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod item;
mod scheduler;

pub use item::{ScheduledEntry, TaskAction};
pub use scheduler::{PriorityScheduler, SchedulerConfig};
