//! Persisted task records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use deferq_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Task id to task, as stored in the pending and expired files.
pub type TaskMap = BTreeMap<String, PersistedTask>;

/// A task waiting for, or past, its due time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    /// Unique task id; also the scheduler identity.
    pub id: String,
    /// Selects the handler.
    pub routing_key: String,
    /// Opaque bytes handed to the handler.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Earliest time the task may be dispatched.
    pub due_at: DateTime<Utc>,
}

impl PersistedTask {
    /// Create a task record.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            routing_key: routing_key.into(),
            payload,
            due_at,
        }
    }

    /// Decode a payload written by `PersistentQueue::enqueue_value`.
    ///
    /// # Errors
    ///
    /// `SerializationFailed` if the payload is not JSON for `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(Error::serialization_failed)
    }

    /// Whether the task is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeDelta;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Email {
        to: String,
    }

    #[test]
    fn test_decode_payload() {
        let task = PersistedTask::new("t", "email:welcome", br#"{"to":"a@b.c"}"#.to_vec(), Utc::now());
        let email: Email = task.decode_payload().unwrap();
        assert_eq!(email.to, "a@b.c");
    }

    #[test]
    fn test_decode_payload_rejects_raw_bytes() {
        let task = PersistedTask::new("t", "k", vec![0xff, 0x00], Utc::now());
        assert!(task.decode_payload::<Email>().is_err());
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let task = PersistedTask::new("t", "k", Vec::new(), now + TimeDelta::seconds(1));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + TimeDelta::seconds(1)));
    }

    #[test]
    fn test_missing_payload_defaults_to_empty() {
        let json = r#"{"id":"t","routing_key":"k","due_at":"2024-01-01T00:00:00Z"}"#;
        let task: PersistedTask = serde_json::from_str(json).unwrap();
        assert!(task.payload.is_empty());
    }
}
