//! String-keyed JSON values on top of a [`SnapshotStore`].

use std::collections::BTreeMap;

use deferq_core::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::store::SnapshotStore;

type Entries = BTreeMap<String, String>;

/// A persisted map from string keys to JSON-encoded values.
#[derive(Debug)]
pub struct KvStore {
    store: SnapshotStore<Entries>,
}

impl KvStore {
    /// Open a KV file with default storage.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be recovered or decoded.
    pub async fn open(file_name: impl Into<String>) -> Result<Self> {
        Ok(Self::from_store(SnapshotStore::open(file_name).await?))
    }

    /// Wrap an already opened store.
    #[must_use]
    pub fn from_store(store: SnapshotStore<Entries>) -> Self {
        Self { store }
    }

    /// Set one key.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be encoded or the store cannot be saved.
    pub async fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<()> {
        self.set_all(&[key], &[value]).await
    }

    /// Get one key, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Fails if the stored value does not decode as `V`.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let mut values = self.get_all(&[key]).await?;
        Ok(values.pop().flatten())
    }

    /// Remove one key.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be saved.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.del_all(&[key]).await
    }

    /// Set several keys in one change.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `keys` and `values` differ in length; otherwise
    /// encoding or storage failures. Nothing is written on error.
    pub async fn set_all<K, V>(&self, keys: &[K], values: &[&V]) -> Result<()>
    where
        K: AsRef<str>,
        V: Serialize + ?Sized,
    {
        if keys.len() != values.len() {
            return Err(Error::invalid_argument(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }

        let encoded = values
            .iter()
            .map(|v| serde_json::to_string(v).map_err(Error::serialization_failed))
            .collect::<Result<Vec<_>>>()?;

        self.store
            .change(|entries| {
                for (key, value) in keys.iter().zip(encoded) {
                    entries.insert(key.as_ref().to_string(), value);
                }
                Ok(())
            })
            .await
    }

    /// Get several keys; absent keys yield `None` in their position.
    ///
    /// # Errors
    ///
    /// Fails on the first stored value that does not decode as `V`.
    pub async fn get_all<K, V>(&self, keys: &[K]) -> Result<Vec<Option<V>>>
    where
        K: AsRef<str>,
        V: DeserializeOwned,
    {
        let raw: Vec<Option<String>> = self
            .store
            .read(|entries| {
                keys.iter()
                    .map(|k| entries.get(k.as_ref()).cloned())
                    .collect()
            })
            .await;

        raw.into_iter()
            .map(|value| {
                value
                    .map(|v| serde_json::from_str(&v).map_err(Error::serialization_failed))
                    .transpose()
            })
            .collect()
    }

    /// Remove several keys in one change.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be saved.
    pub async fn del_all<K: AsRef<str>>(&self, keys: &[K]) -> Result<()> {
        self.store
            .change(|entries| {
                for key in keys {
                    entries.remove(key.as_ref());
                }
                Ok(())
            })
            .await
    }

    /// All keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.store.read(|entries| entries.keys().cloned().collect()).await
    }

    /// Every entry that decodes as `V`, sorted by key. Others are skipped.
    pub async fn list<V: DeserializeOwned>(&self) -> Vec<(String, V)> {
        self.store
            .read(|entries| {
                entries
                    .iter()
                    .filter_map(|(k, v)| match serde_json::from_str(v) {
                        Ok(value) => Some((k.clone(), value)),
                        Err(e) => {
                            debug!(key = %k, error = %e, "Skipping undecodable entry");
                            None
                        }
                    })
                    .collect()
            })
            .await
    }

    /// Flush and stop the underlying store.
    ///
    /// # Errors
    ///
    /// Propagates the final flush's failure.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}
