//! Heap entries.

use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

/// A scheduled action. Arguments are captured by the closure.
pub type TaskAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Heap key: earliest due time first, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Slot {
    pub due_at: DateTime<Utc>,
    pub seq: u64,
}

/// A live entry. Canceled entries are dropped from the item table and their
/// heap slots are discarded lazily when they reach the top.
pub(crate) struct ScheduledItem {
    pub identity: String,
    pub due_at: DateTime<Utc>,
    pub action: TaskAction,
}

impl fmt::Debug for ScheduledItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledItem")
            .field("identity", &self.identity)
            .field("due_at", &self.due_at)
            .finish_non_exhaustive()
    }
}

/// Public view of a pending item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub identity: String,
    pub due_at: DateTime<Utc>,
}
