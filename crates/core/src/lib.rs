//! # deferq-core
//!
//! Error taxonomy, result helpers, and the clock abstraction shared by the
//! snapshot store, the scheduler, and the queue.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod clock;
pub mod error;
pub mod result;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, ErrorKind};
pub use result::{Result, ResultExt};
