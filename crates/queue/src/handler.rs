//! Task handlers and the routing-key registry.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use deferq_core::{Error, Result};
use thiserror::Error;
use tokio::sync::{RwLock, watch};

use crate::task::PersistedTask;

/// Failure returned by a [`TaskHandler`].
///
/// No variant triggers a retry; the task is consumed either way.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler asks that nothing further be done for this delivery.
    #[error("skip retry")]
    SkipRetry,

    #[error("handler failed: {reason}")]
    Failed { reason: String },
}

impl HandlerError {
    /// Create a failure.
    pub fn failed(reason: impl ToString) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }

    /// Whether this is the skip-retry signal.
    #[must_use]
    pub const fn is_skip_retry(&self) -> bool {
        matches!(self, Self::SkipRetry)
    }
}

/// Per-delivery context handed to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    stop: watch::Receiver<bool>,
}

impl HandlerContext {
    pub(crate) fn new(stop: watch::Receiver<bool>) -> Self {
        Self { stop }
    }

    /// Whether the queue is shutting down.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once the queue begins shutting down.
    pub async fn stopped(&self) {
        let mut stop = self.stop.clone();
        loop {
            if *stop.borrow_and_update() {
                return;
            }
            if stop.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Processes tasks whose routing key matches the registered pattern.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handle one delivery.
    ///
    /// # Errors
    ///
    /// A returned error is logged; the task is not redelivered.
    async fn handle(&self, ctx: &HandlerContext, task: &PersistedTask) -> std::result::Result<(), HandlerError>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(HandlerContext, PersistedTask) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &HandlerContext, task: &PersistedTask) -> std::result::Result<(), HandlerError> {
        (self.0)(ctx.clone(), task.clone()).await
    }
}

/// Wrap `f` as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(HandlerContext, PersistedTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Pattern to handler map.
///
/// Lookup prefers an exact match, then the longest registered prefix of the
/// routing key.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`, or unregister it with `None`.
    ///
    /// Returns whether a handler was previously registered for the pattern.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty pattern.
    pub async fn set(&self, pattern: &str, handler: Option<Arc<dyn TaskHandler>>) -> Result<bool> {
        if pattern.is_empty() {
            return Err(Error::invalid_argument("empty routing key pattern"));
        }

        let mut handlers = self.handlers.write().await;
        let previous = match handler {
            Some(handler) => handlers.insert(pattern.to_string(), handler),
            None => handlers.remove(pattern),
        };
        Ok(previous.is_some())
    }

    /// Find the handler for `routing_key`.
    pub async fn lookup(&self, routing_key: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().await;

        // Every prefix of the key sorts at or before the key, and among
        // prefixes the longer one sorts later.
        handlers
            .range::<str, _>((Bound::Unbounded, Bound::Included(routing_key)))
            .rev()
            .find(|(pattern, _)| routing_key.starts_with(pattern.as_str()))
            .map(|(_, handler)| Arc::clone(handler))
    }

    /// Whether any handler matches `routing_key`.
    pub async fn matches(&self, routing_key: &str) -> bool {
        self.lookup(routing_key).await.is_some()
    }

    /// Registered patterns, sorted.
    pub async fn patterns(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Number of registered patterns.
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Whether nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").finish_non_exhaustive()
    }
}
