//! Queue configuration.

use std::path::Path;
use std::time::Duration;

use deferq_core::{Error, Result};
use deferq_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};

/// Configuration for a [`PersistentQueue`](crate::PersistentQueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// File holding tasks not yet due.
    #[serde(default)]
    pub pending_file: String,

    /// File holding due tasks nobody could handle. Defaults to
    /// `<pending_file>.expired`.
    #[serde(default)]
    pub expired_file: Option<String>,

    /// Batch saves on this interval. Zero saves on every change.
    #[serde(default)]
    pub auto_save_interval_ms: u64,

    /// Scheduler operation queue capacity.
    #[serde(default = "default_op_queue_capacity")]
    pub op_queue_capacity: usize,

    /// Scheduler action pool size.
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,

    /// Handlers running at once.
    #[serde(default = "default_max_concurrent_dispatch")]
    pub max_concurrent_dispatch: usize,

    /// Due task ids buffered between the scheduler and the dispatcher.
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,

    /// Delay between a handler registration and the expired sweep it triggers.
    #[serde(default = "default_sweep_delay_ms")]
    pub sweep_delay_ms: u64,

    /// Scheduler wake-up interval with nothing scheduled.
    #[serde(default = "default_idle_wait_secs")]
    pub idle_wait_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pending_file: String::new(),
            expired_file: None,
            auto_save_interval_ms: 0,
            op_queue_capacity: default_op_queue_capacity(),
            max_concurrent_actions: default_max_concurrent_actions(),
            max_concurrent_dispatch: default_max_concurrent_dispatch(),
            dispatch_buffer: default_dispatch_buffer(),
            sweep_delay_ms: default_sweep_delay_ms(),
            idle_wait_secs: default_idle_wait_secs(),
        }
    }
}

impl QueueConfig {
    /// Configuration for a queue persisted to `pending_file`.
    pub fn new(pending_file: impl Into<String>) -> Self {
        Self {
            pending_file: pending_file.into(),
            ..Default::default()
        }
    }

    /// Set the expired file.
    #[must_use]
    pub fn with_expired_file(mut self, file: impl Into<String>) -> Self {
        self.expired_file = Some(file.into());
        self
    }

    /// Set the auto-save interval.
    #[must_use]
    pub fn with_auto_save(mut self, interval: Duration) -> Self {
        self.auto_save_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the sweep delay.
    #[must_use]
    pub fn with_sweep_delay(mut self, delay: Duration) -> Self {
        self.sweep_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Parse TOML.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if the text does not parse or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::config_invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// `FileReadFailed` if the file cannot be read, `ConfigInvalid` if it
    /// does not parse or fails validation.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::file_read_failed(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Reject unusable settings.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.pending_file.is_empty() {
            return Err(Error::config_invalid("pending_file must not be empty"));
        }
        if self.expired_file.as_deref() == Some("") {
            return Err(Error::config_invalid("expired_file must not be empty"));
        }
        if self.expired_file_name() == self.pending_file {
            return Err(Error::config_invalid(
                "expired_file must differ from pending_file",
            ));
        }

        let capacities = [
            ("op_queue_capacity", self.op_queue_capacity),
            ("max_concurrent_actions", self.max_concurrent_actions),
            ("max_concurrent_dispatch", self.max_concurrent_dispatch),
            ("dispatch_buffer", self.dispatch_buffer),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(Error::config_invalid(format!("{name} must be at least 1")));
        }

        if self.idle_wait_secs == 0 {
            return Err(Error::config_invalid("idle_wait_secs must be at least 1"));
        }

        Ok(())
    }

    /// The expired file name, defaulted from the pending file.
    #[must_use]
    pub fn expired_file_name(&self) -> String {
        self.expired_file
            .clone()
            .unwrap_or_else(|| format!("{}.expired", self.pending_file))
    }

    /// Auto-save interval; `None` for synchronous saves.
    #[must_use]
    pub fn auto_save_interval(&self) -> Option<Duration> {
        (self.auto_save_interval_ms > 0).then(|| Duration::from_millis(self.auto_save_interval_ms))
    }

    /// Delay before an expired sweep.
    #[must_use]
    pub const fn sweep_delay(&self) -> Duration {
        Duration::from_millis(self.sweep_delay_ms)
    }

    /// Scheduler settings derived from this configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            op_queue_capacity: self.op_queue_capacity,
            max_concurrent_actions: self.max_concurrent_actions,
            idle_wait: Duration::from_secs(self.idle_wait_secs),
        }
    }
}

const fn default_op_queue_capacity() -> usize {
    100
}

const fn default_max_concurrent_actions() -> usize {
    256
}

const fn default_max_concurrent_dispatch() -> usize {
    64
}

const fn default_dispatch_buffer() -> usize {
    1024
}

const fn default_sweep_delay_ms() -> u64 {
    5000
}

const fn default_idle_wait_secs() -> u64 {
    24 * 60 * 60
}
