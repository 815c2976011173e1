//! The persistent queue.
//!
//! # Flow
//!
//! ```text
//! enqueue ──► pending store ──► scheduler ──(due id)──► dispatcher
//!                                                          │
//!                        handler found ◄───────────────────┤
//!                        no handler ──► expired store ──► sweep on registration
//! ```
//!
//! The scheduler's action only forwards the task id into a bounded channel;
//! the dispatcher owns the store reads and writes and runs handlers on a
//! bounded pool.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferq_core::{Clock, Error, Result, ResultExt, SystemClock};
use deferq_scheduler::{PriorityScheduler, ScheduledEntry};
use deferq_snapshot::{FileStorage, SnapshotObserver, SnapshotStore};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::handler::{HandlerContext, HandlerError, HandlerRegistry, TaskHandler, handler_fn};
use crate::task::{PersistedTask, TaskMap};

type TaskStore = SnapshotStore<TaskMap>;

/// Counts reported by [`PersistentQueue::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub expired: usize,
    pub handlers: usize,
}

/// Arms the scheduler for a task: when due, its id goes to the dispatcher.
async fn arm(
    scheduler: &PriorityScheduler,
    due_tx: &mpsc::Sender<String>,
    id: &str,
    due_at: DateTime<Utc>,
) -> Result<()> {
    let due_tx = due_tx.clone();
    let task_id = id.to_string();
    scheduler
        .add_task(id, due_at, move || async move {
            if due_tx.send(task_id).await.is_err() {
                debug!("Dispatcher closed, due task left pending");
            }
        })
        .await
        .map(|_| ())
}

/// Re-arms every pending task when the pending file is loaded.
struct RearmObserver {
    scheduler: Arc<PriorityScheduler>,
    due_tx: mpsc::Sender<String>,
}

#[async_trait]
impl SnapshotObserver<TaskMap> for RearmObserver {
    async fn after_load(&self, file: &str, loaded: std::result::Result<&TaskMap, &Error>) -> Result<()> {
        let Ok(tasks) = loaded else {
            return Ok(());
        };

        for task in tasks.values() {
            arm(&self.scheduler, &self.due_tx, &task.id, task.due_at)
                .await
                .inspect_error(|e| error!(task_id = %task.id, error = %e, "Failed to re-arm task"))?;
        }
        info!(file = %file, tasks = tasks.len(), "Pending tasks re-armed");
        Ok(())
    }
}

struct QueueShared {
    config: QueueConfig,
    pending: TaskStore,
    expired: TaskStore,
    scheduler: Arc<PriorityScheduler>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    due_tx: mpsc::Sender<String>,
    stop_tx: watch::Sender<bool>,
    sweep_lock: Mutex<()>,
}

impl QueueShared {
    fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Due-time callback: deliver, or park in the expired store.
    async fn dispatch_due(&self, id: &str) -> Result<()> {
        let Some(task) = self.pending.read(|tasks| tasks.get(id).cloned()).await else {
            debug!(task_id = %id, "Due task already consumed");
            return Ok(());
        };

        match self.handlers.lookup(&task.routing_key).await {
            Some(handler) => {
                self.deliver(handler.as_ref(), &task).await;
            }
            None => {
                self.expired
                    .change(|tasks| {
                        tasks.insert(task.id.clone(), task.clone());
                        Ok(())
                    })
                    .await?;
                info!(task_id = %id, routing_key = %task.routing_key, "No handler, task expired");
            }
        }

        self.pending
            .change(|tasks| {
                tasks.remove(id);
                Ok(())
            })
            .await
    }

    /// Run a handler once. Failures, skip-retry, and panics all consume the task.
    async fn deliver(&self, handler: &dyn TaskHandler, task: &PersistedTask) {
        let ctx = HandlerContext::new(self.stop_tx.subscribe());
        let outcome = AssertUnwindSafe(handler.handle(&ctx, task))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                debug!(task_id = %task.id, routing_key = %task.routing_key, "Task handled");
            }
            Ok(Err(HandlerError::SkipRetry)) => {
                debug!(task_id = %task.id, "Handler asked to skip retry");
            }
            Ok(Err(e)) => {
                warn!(task_id = %task.id, routing_key = %task.routing_key, error = %e, "Handler failed");
            }
            Err(_) => {
                error!(task_id = %task.id, routing_key = %task.routing_key, "Handler panicked");
            }
        }
    }

    /// Deliver every expired task that now has a handler.
    async fn sweep_expired(&self) -> Result<usize> {
        let _sweeping = self.sweep_lock.lock().await;

        let candidates: Vec<PersistedTask> =
            self.expired.read(|tasks| tasks.values().cloned().collect()).await;

        let mut delivered = 0;
        for task in candidates {
            if self.is_stopping() {
                break;
            }
            let Some(handler) = self.handlers.lookup(&task.routing_key).await else {
                continue;
            };

            self.deliver(handler.as_ref(), &task).await;
            self.expired
                .change(|tasks| {
                    tasks.remove(&task.id);
                    Ok(())
                })
                .await?;
            delivered += 1;
        }

        if delivered > 0 {
            info!(delivered, "Expired tasks swept");
        }
        Ok(delivered)
    }

    fn spawn_delayed_sweep(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let delay = self.config.sweep_delay();

        tokio::spawn(async move {
            let mut stop = shared.stop_tx.subscribe();
            if *stop.borrow() {
                return;
            }
            tokio::select! {
                _ = stop.changed() => return,
                () = tokio::time::sleep(delay) => {}
            }
            shared.sweep_expired().await.into_option_logged();
        });
    }
}

async fn run_dispatcher(
    shared: Arc<QueueShared>,
    mut due_rx: mpsc::Receiver<String>,
    mut stop: watch::Receiver<bool>,
) {
    let pool = Arc::new(Semaphore::new(shared.config.max_concurrent_dispatch));
    let mut running = JoinSet::new();

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            biased;

            _ = stop.changed() => break,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Dispatch task failed");
                }
            }
            id = due_rx.recv() => {
                let Some(id) = id else { break };
                let shared = Arc::clone(&shared);
                let pool = Arc::clone(&pool);
                running.spawn(async move {
                    let Ok(_permit) = pool.acquire_owned().await else {
                        return;
                    };
                    if let Err(e) = shared.dispatch_due(&id).await {
                        error!(task_id = %id, error = %e, "Dispatch failed");
                    }
                });
            }
        }
    }

    // In-flight deliveries see the stop through their context.
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Dispatch task failed");
        }
    }
    debug!("Dispatcher exited");
}

/// Builder for [`PersistentQueue`].
pub struct QueueBuilder {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    storage: Option<Arc<dyn FileStorage>>,
    handlers: Vec<(String, Arc<dyn TaskHandler>)>,
}

impl QueueBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            storage: None,
            handlers: Vec::new(),
        }
    }

    /// Read due times from `clock`.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist through `storage` instead of the local filesystem.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Register a handler before the pending file is loaded, so tasks that
    /// fell due while the process was down are delivered instead of expired.
    #[must_use]
    pub fn handler(mut self, pattern: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((pattern.into(), handler));
        self
    }

    fn store(&self, file: String) -> deferq_snapshot::SnapshotStoreBuilder<TaskMap> {
        let builder = SnapshotStore::<TaskMap>::builder(file)
            .auto_save(self.config.auto_save_interval().unwrap_or_default());
        match &self.storage {
            Some(storage) => builder.storage(Arc::clone(storage)),
            None => builder,
        }
    }

    /// Open both stores, re-arm pending tasks, and start dispatching.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` for a bad configuration, `InvalidArgument` for an empty
    /// handler pattern, or any failure loading either file.
    pub async fn open(self) -> Result<PersistentQueue> {
        self.config.validate()?;

        let handlers = HandlerRegistry::new();
        for (pattern, handler) in &self.handlers {
            handlers.set(pattern, Some(Arc::clone(handler))).await?;
        }

        let scheduler = Arc::new(PriorityScheduler::with_clock(
            self.config.scheduler_config(),
            Arc::clone(&self.clock),
        ));
        let (due_tx, due_rx) = mpsc::channel(self.config.dispatch_buffer);

        let stores = async {
            let expired = self.store(self.config.expired_file_name()).open().await?;
            let pending = self
                .store(self.config.pending_file.clone())
                .observer(Arc::new(RearmObserver {
                    scheduler: Arc::clone(&scheduler),
                    due_tx: due_tx.clone(),
                }))
                .open()
                .await?;
            Ok::<_, Error>((pending, expired))
        }
        .await;

        let (pending, expired) = match stores {
            Ok(stores) => stores,
            Err(e) => {
                scheduler.stop().await;
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(QueueShared {
            config: self.config,
            pending,
            expired,
            scheduler,
            handlers,
            clock: self.clock,
            due_tx,
            stop_tx,
            sweep_lock: Mutex::new(()),
        });

        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&shared), due_rx, stop_rx));

        if !self.handlers.is_empty() {
            shared.spawn_delayed_sweep();
        }

        info!(
            pending_file = %shared.config.pending_file,
            expired_file = %shared.config.expired_file_name(),
            "Queue opened"
        );

        Ok(PersistentQueue {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }
}

/// Durable delayed-task queue.
pub struct PersistentQueue {
    shared: Arc<QueueShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentQueue {
    /// Open a queue with default clock and storage.
    ///
    /// # Errors
    ///
    /// See [`QueueBuilder::open`].
    pub async fn open(config: QueueConfig) -> Result<Self> {
        QueueBuilder::new(config).open().await
    }

    /// Start building a queue.
    #[must_use]
    pub fn builder(config: QueueConfig) -> QueueBuilder {
        QueueBuilder::new(config)
    }

    /// Schedule `payload` for `routing_key` after `delay`. Returns the new id.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty routing key, `Aborted` after stop, or a
    /// storage failure.
    pub async fn enqueue(
        &self,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<String> {
        self.enqueue_with_id(Uuid::new_v4().to_string(), routing_key, payload, delay)
            .await
    }

    /// Like [`enqueue`](Self::enqueue) with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if a pending or expired task has the same id; both
    /// stores are left unchanged. Otherwise as for `enqueue`. If arming the scheduler
    /// fails after the task was persisted, the task is re-armed on the next
    /// open.
    pub async fn enqueue_with_id(
        &self,
        id: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<String> {
        let id = id.into();
        let routing_key = routing_key.into();

        if id.is_empty() {
            return Err(Error::invalid_argument("empty task id"));
        }
        if routing_key.is_empty() {
            return Err(Error::invalid_argument("empty routing key"));
        }
        if self.shared.is_stopping() {
            return Err(Error::aborted("queue stopped"));
        }
        if self.shared.expired.read(|tasks| tasks.contains_key(&id)).await {
            return Err(Error::already_exists("task", id));
        }

        let due_at = self.shared.clock.deadline(delay);
        let task = PersistedTask::new(id.clone(), routing_key, payload, due_at);

        self.shared
            .pending
            .change(|tasks| {
                if tasks.contains_key(&task.id) {
                    return Err(Error::already_exists("task", task.id.clone()));
                }
                tasks.insert(task.id.clone(), task.clone());
                Ok(())
            })
            .await?;

        arm(&self.shared.scheduler, &self.shared.due_tx, &id, due_at).await?;
        debug!(task_id = %id, routing_key = %task.routing_key, due_at = %due_at, "Task enqueued");
        Ok(id)
    }

    /// Enqueue a value encoded as JSON; read it back with
    /// [`PersistedTask::decode_payload`].
    ///
    /// # Errors
    ///
    /// `SerializationFailed` if `value` cannot be encoded, otherwise as for
    /// `enqueue`.
    pub async fn enqueue_value<T: Serialize + ?Sized>(
        &self,
        routing_key: impl Into<String>,
        value: &T,
        delay: Duration,
    ) -> Result<String> {
        let payload = serde_json::to_vec(value).map_err(Error::serialization_failed)?;
        self.enqueue(routing_key, payload, delay).await
    }

    /// Register or, with `None`, unregister the handler for `pattern`.
    ///
    /// A registration schedules a sweep of the expired store after the
    /// configured delay.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty pattern.
    pub async fn handle_func(&self, pattern: &str, handler: Option<Arc<dyn TaskHandler>>) -> Result<()> {
        let registering = handler.is_some();
        self.shared.handlers.set(pattern, handler).await?;

        if registering {
            info!(pattern = %pattern, "Handler registered");
            if !self.shared.is_stopping() {
                self.shared.spawn_delayed_sweep();
            }
        } else {
            info!(pattern = %pattern, "Handler unregistered");
        }
        Ok(())
    }

    /// Register `handler` for `pattern`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty pattern.
    pub async fn handle(&self, pattern: &str, handler: Arc<dyn TaskHandler>) -> Result<()> {
        self.handle_func(pattern, Some(handler)).await
    }

    /// Register an async closure for `pattern`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty pattern.
    pub async fn handle_fn<F, Fut>(&self, pattern: &str, f: F) -> Result<()>
    where
        F: Fn(HandlerContext, PersistedTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.handle(pattern, handler_fn(f)).await
    }

    /// Unregister `pattern`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty pattern.
    pub async fn unhandle(&self, pattern: &str) -> Result<()> {
        self.handle_func(pattern, None).await
    }

    /// Remove a pending task before it falls due and return it.
    ///
    /// A task whose due-time callback is already running may still be
    /// delivered once.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty id, `NotFound` if no pending task has
    /// the id, `Aborted` after stop, or a storage failure.
    pub async fn cancel(&self, id: &str) -> Result<PersistedTask> {
        if id.is_empty() {
            return Err(Error::invalid_argument("empty task id"));
        }
        if self.shared.is_stopping() {
            return Err(Error::aborted("queue stopped"));
        }

        let task = self
            .shared
            .pending
            .change(|tasks| tasks.remove(id).ok_or_else(|| Error::not_found("task", id)))
            .await?;

        if let Err(e) = self.shared.scheduler.remove_task(id).await {
            debug!(task_id = %id, error = %e, "Scheduler gone before cancel reached it");
        }
        info!(task_id = %id, routing_key = %task.routing_key, "Task canceled");
        Ok(task)
    }

    /// Registered handler patterns, sorted.
    pub async fn handler_patterns(&self) -> Vec<String> {
        self.shared.handlers.patterns().await
    }

    /// Deliver every expired task that has a handler now. Returns how many
    /// were delivered.
    ///
    /// # Errors
    ///
    /// Fails if the expired store cannot be saved.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.shared.sweep_expired().await
    }

    /// Pending tasks ordered by due time.
    pub async fn pending_tasks(&self) -> Vec<PersistedTask> {
        sorted(&self.shared.pending).await
    }

    /// Expired tasks ordered by due time.
    pub async fn expired_tasks(&self) -> Vec<PersistedTask> {
        sorted(&self.shared.expired).await
    }

    /// What the scheduler currently holds.
    ///
    /// # Errors
    ///
    /// `Aborted` after stop.
    pub async fn scheduled(&self) -> Result<Vec<ScheduledEntry>> {
        self.shared.scheduler.snapshot().await
    }

    /// Current counts.
    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.shared.pending.read(TaskMap::len).await,
            expired: self.shared.expired.read(TaskMap::len).await,
            handlers: self.shared.handlers.len().await,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Stop scheduling, let in-flight deliveries finish, and flush both files.
    ///
    /// Tasks not yet due stay in the pending file for the next open.
    ///
    /// # Errors
    ///
    /// Propagates a failed final flush.
    pub async fn stop(&self) -> Result<()> {
        self.shared.stop_tx.send_replace(true);
        self.shared.scheduler.stop().await;

        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "Dispatcher did not exit cleanly");
            }
        }

        let pending = self.shared.pending.close().await;
        let expired = self.shared.expired.close().await;
        info!("Queue stopped");
        pending.and(expired)
    }
}

impl Drop for PersistentQueue {
    fn drop(&mut self) {
        self.shared.stop_tx.send_replace(true);
        self.shared.scheduler.request_stop();
    }
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("config", &self.shared.config)
            .field("stopping", &self.shared.is_stopping())
            .finish_non_exhaustive()
    }
}

async fn sorted(store: &TaskStore) -> Vec<PersistedTask> {
    let mut tasks: Vec<PersistedTask> = store.read(|tasks| tasks.values().cloned().collect()).await;
    tasks.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
    tasks
}
