//! The priority scheduler and its coordinating task.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deferq_core::{Clock, Error, Result, SystemClock};
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::item::{ScheduledEntry, ScheduledItem, Slot, TaskAction};

/// Configuration for [`PriorityScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Capacity of the operation queue; senders wait when it is full.
    pub op_queue_capacity: usize,
    /// Upper bound on actions running at once.
    pub max_concurrent_actions: usize,
    /// How long the coordinator sleeps with nothing scheduled.
    pub idle_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            op_queue_capacity: 100,
            max_concurrent_actions: 256,
            idle_wait: Duration::from_secs(24 * 60 * 60),
        }
    }
}

enum Op {
    Add {
        identity: String,
        due_at: DateTime<Utc>,
        action: TaskAction,
    },
    Remove {
        identity: String,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ScheduledEntry>>,
    },
    Wake,
}

/// Time-ordered scheduler keyed by an opaque identity.
///
/// At most one live item exists per identity; adding an identity again
/// replaces the earlier item.
pub struct PriorityScheduler {
    ops: mpsc::Sender<Op>,
    stop: watch::Sender<bool>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl PriorityScheduler {
    /// Start a scheduler on the system clock.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Start a scheduler reading time from `clock`.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel(config.op_queue_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let coordinator = Coordinator::new(&config, Arc::clone(&clock));
        let handle = tokio::spawn(coordinator.run(ops_rx, stop_rx));

        debug!(
            op_queue_capacity = config.op_queue_capacity,
            max_concurrent_actions = config.max_concurrent_actions,
            "Scheduler started"
        );

        Self {
            ops: ops_tx,
            stop: stop_tx,
            coordinator: Mutex::new(Some(handle)),
            clock,
        }
    }

    /// The clock due times are compared against.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Schedule `action` to run at `due_at`, replacing any item already
    /// scheduled under `identity`.
    ///
    /// An empty identity is replaced by a fresh uuid. Returns the identity
    /// actually used.
    ///
    /// # Errors
    ///
    /// `Aborted` once the scheduler has been stopped.
    pub async fn add_task<F, Fut>(
        &self,
        identity: impl Into<String>,
        due_at: DateTime<Utc>,
        action: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut identity = identity.into();
        if identity.is_empty() {
            identity = Uuid::new_v4().to_string();
        }

        let action: TaskAction = Box::new(move || action().boxed());
        self.send(Op::Add {
            identity: identity.clone(),
            due_at,
            action,
        })
        .await?;

        Ok(identity)
    }

    /// Cancel the item scheduled under `identity`.
    ///
    /// Unknown or already fired identities are ignored. Cancellation only
    /// wins if it reaches the coordinator before the item is popped.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty identity, `Aborted` once stopped.
    pub async fn remove_task(&self, identity: &str) -> Result<()> {
        if identity.is_empty() {
            return Err(Error::invalid_argument("empty schedule identity"));
        }

        self.send(Op::Remove {
            identity: identity.to_string(),
        })
        .await
    }

    /// Live items in firing order.
    ///
    /// # Errors
    ///
    /// `Aborted` once stopped.
    pub async fn snapshot(&self) -> Result<Vec<ScheduledEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(Op::Snapshot { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Re-check due items now instead of at the next planned wake-up.
    ///
    /// Only needed when the clock jumps, as a manually driven clock does.
    ///
    /// # Errors
    ///
    /// `Aborted` once stopped.
    pub async fn wake(&self) -> Result<()> {
        self.send(Op::Wake).await
    }

    /// Whether stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Signal the coordinator to exit without waiting for it.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop the coordinator and wait until it has exited.
    ///
    /// Items not yet due are dropped; actions already running are detached
    /// and left to finish on their own. Calling this again is a no-op.
    pub async fn stop(&self) {
        self.request_stop();

        let handle = self.coordinator.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler coordinator did not exit cleanly");
            }
            info!("Scheduler stopped");
        }
    }

    async fn send(&self, op: Op) -> Result<()> {
        if self.is_stopped() {
            return Err(stopped());
        }
        self.ops.send(op).await.map_err(|_| stopped())
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        self.request_stop();
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("stopped", &self.is_stopped())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

fn stopped() -> Error {
    Error::aborted("scheduler stopped")
}

/// State owned by the coordinating task and nothing else.
struct Coordinator {
    heap: BinaryHeap<Reverse<Slot>>,
    items: HashMap<u64, ScheduledItem>,
    index: HashMap<String, u64>,
    next_seq: u64,
    clock: Arc<dyn Clock>,
    pool: Arc<Semaphore>,
    running: JoinSet<()>,
    idle_wait: Duration,
}

impl Coordinator {
    fn new(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            heap: BinaryHeap::new(),
            items: HashMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            clock,
            pool: Arc::new(Semaphore::new(config.max_concurrent_actions.max(1))),
            running: JoinSet::new(),
            idle_wait: config.idle_wait,
        }
    }

    async fn run(mut self, mut ops: mpsc::Receiver<Op>, mut stop: watch::Receiver<bool>) {
        let mut wake_at = wake_after(self.process());

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                biased;

                _ = stop.changed() => break,
                op = ops.recv() => match op {
                    Some(op) => self.apply(op),
                    None => break,
                },
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    reap(joined);
                    continue;
                }
                () = tokio::time::sleep_until(wake_at) => {}
            }

            wake_at = wake_after(self.process());
        }

        let detached = self.running.len();
        self.running.detach_all();
        debug!(
            pending = self.items.len(),
            detached,
            "Scheduler coordinator exited"
        );
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Add {
                identity,
                due_at,
                action,
            } => self.insert(identity, due_at, action),
            Op::Remove { identity } => {
                if let Some(seq) = self.index.remove(&identity) {
                    self.items.remove(&seq);
                    debug!(identity = %identity, "Scheduled item canceled");
                }
            }
            Op::Snapshot { reply } => {
                let _ = reply.send(self.entries());
            }
            Op::Wake => {}
        }
    }

    fn insert(&mut self, identity: String, due_at: DateTime<Utc>, action: TaskAction) {
        if let Some(previous) = self.index.remove(&identity) {
            self.items.remove(&previous);
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Reverse(Slot { due_at, seq }));
        self.index.insert(identity.clone(), seq);
        debug!(identity = %identity, due_at = %due_at, "Item scheduled");
        self.items.insert(
            seq,
            ScheduledItem {
                identity,
                due_at,
                action,
            },
        );
    }

    /// Fire everything due and return how long to sleep.
    fn process(&mut self) -> Duration {
        let now = self.clock.now();
        for item in self.pop_due(now) {
            self.fire(item);
        }
        self.next_wait(now)
    }

    /// Pop every live item due at or before `now`, discarding canceled slots.
    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<ScheduledItem> {
        let mut due = Vec::new();

        while let Some(&Reverse(slot)) = self.heap.peek() {
            if !self.items.contains_key(&slot.seq) {
                self.heap.pop();
                continue;
            }
            if slot.due_at > now {
                break;
            }

            self.heap.pop();
            if let Some(item) = self.items.remove(&slot.seq) {
                self.index.remove(&item.identity);
                due.push(item);
            }
        }

        due
    }

    fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        self.heap
            .peek()
            .map_or(self.idle_wait, |Reverse(slot)| {
                (slot.due_at - now).to_std().unwrap_or(Duration::ZERO)
            })
            .min(self.idle_wait)
    }

    fn fire(&mut self, item: ScheduledItem) {
        let pool = Arc::clone(&self.pool);
        let ScheduledItem {
            identity,
            due_at,
            action,
        } = item;

        debug!(identity = %identity, due_at = %due_at, "Firing scheduled item");
        self.running.spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                warn!(identity = %identity, "Action pool closed, dropping item");
                return;
            };
            action().await;
        });
    }

    fn entries(&self) -> Vec<ScheduledEntry> {
        let mut live: Vec<(u64, &ScheduledItem)> =
            self.items.iter().map(|(seq, item)| (*seq, item)).collect();
        live.sort_by_key(|(seq, item)| (item.due_at, *seq));

        live.into_iter()
            .map(|(_, item)| ScheduledEntry {
                identity: item.identity.clone(),
                due_at: item.due_at,
            })
            .collect()
    }
}

/// `wait` from now, clamped so a huge idle wait cannot overflow.
fn wake_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Scheduled action panicked");
        } else {
            debug!(error = %e, "Scheduled action canceled");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeDelta;
    use deferq_core::ManualClock;

    use super::*;

    fn coordinator(clock: Arc<ManualClock>) -> Coordinator {
        Coordinator::new(&SchedulerConfig::default(), clock)
    }

    fn noop() -> TaskAction {
        Box::new(|| async {}.boxed())
    }

    #[tokio::test]
    async fn test_pop_due_respects_due_time() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut c = coordinator(Arc::clone(&clock));
        let now = clock.now();

        c.insert("later".into(), now + TimeDelta::seconds(10), noop());
        c.insert("now".into(), now, noop());

        let due = c.pop_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].identity, "now");
        assert_eq!(c.next_wait(now), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_equal_due_times_pop_in_insertion_order() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut c = coordinator(Arc::clone(&clock));
        let now = clock.now();

        for name in ["a", "b", "c", "d"] {
            c.insert(name.into(), now, noop());
        }

        let order: Vec<_> = c.pop_due(now).into_iter().map(|i| i.identity).collect();
        assert_eq!(order, ["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_reinsert_replaces_previous_item() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut c = coordinator(Arc::clone(&clock));
        let now = clock.now();

        c.insert("k".into(), now, noop());
        c.insert("k".into(), now + TimeDelta::seconds(5), noop());

        assert!(c.pop_due(now).is_empty());
        let later = c.pop_due(now + TimeDelta::seconds(5));
        assert_eq!(later.len(), 1);
        assert!(c.heap.is_empty());
        assert!(c.index.is_empty());
    }

    #[tokio::test]
    async fn test_remove_drops_item_lazily() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut c = coordinator(Arc::clone(&clock));
        let now = clock.now();

        c.insert("gone".into(), now, noop());
        c.apply(Op::Remove {
            identity: "gone".into(),
        });

        assert_eq!(c.heap.len(), 1);
        assert!(c.pop_due(now).is_empty());
        assert!(c.heap.is_empty());
    }

    #[tokio::test]
    async fn test_idle_wait_when_empty() {
        let clock = Arc::new(ManualClock::starting_now());
        let c = coordinator(Arc::clone(&clock));
        assert_eq!(c.next_wait(clock.now()), SchedulerConfig::default().idle_wait);
    }

    #[test]
    fn test_wake_after_saturates() {
        assert!(wake_after(Duration::MAX) > Instant::now());
    }

    #[tokio::test]
    async fn test_entries_in_firing_order() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut c = coordinator(Arc::clone(&clock));
        let now = clock.now();

        c.insert("second".into(), now + TimeDelta::seconds(2), noop());
        c.insert("first".into(), now + TimeDelta::seconds(1), noop());

        let ids: Vec<_> = c.entries().into_iter().map(|e| e.identity).collect();
        assert_eq!(ids, ["first", "second"]);
    }
}
