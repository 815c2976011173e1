//! The snapshot store.
//!
//! One value of type `T` lives behind a tokio `RwLock`. Readers share the
//! lock; [`SnapshotStore::change`] is the only write path. Without an
//! auto-save interval every change is persisted inside the same exclusive
//! section, so a returned `Ok` means memory and file agree.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use deferq_core::{Result, ResultExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::codec::{Codec, JsonCodec};
use crate::durable;
use crate::observer::{NoopObserver, SnapshotObserver};
use crate::storage::{FileStorage, LocalFileStorage};

/// Anything that can be snapshotted.
pub trait SnapshotValue: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

impl<T> SnapshotValue for T where T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

struct SnapshotState<T> {
    value: T,
    dirty: bool,
}

struct StoreInner<T: SnapshotValue, C> {
    state: RwLock<SnapshotState<T>>,
    codec: C,
    storage: Arc<dyn FileStorage>,
    observer: Arc<dyn SnapshotObserver<T>>,
    file_name: String,
}

impl<T: SnapshotValue, C: Codec> StoreInner<T, C> {
    fn is_persistent(&self) -> bool {
        !self.file_name.is_empty()
    }

    async fn load(&self, initial: T) -> Result<T> {
        if !self.is_persistent() {
            return Ok(initial);
        }

        self.observer.before_load(&self.file_name).await?;

        let loaded = self.read_value(initial).await;
        match &loaded {
            Ok(value) => self.observer.after_load(&self.file_name, Ok(value)).await?,
            Err(e) => {
                self.observer
                    .after_load(&self.file_name, Err(e))
                    .await
                    .into_option_logged();
            }
        }

        loaded
    }

    async fn read_value(&self, initial: T) -> Result<T> {
        durable::recover_snapshot(self.storage.as_ref(), &self.file_name).await?;

        match self.storage.read_file(&self.file_name).await? {
            Some(bytes) => self.codec.decode(&bytes),
            None => Ok(initial),
        }
    }

    /// Caller holds the write lock.
    async fn persist(&self, state: &mut SnapshotState<T>) -> Result<()> {
        if !self.is_persistent() {
            state.dirty = false;
            return Ok(());
        }

        self.observer.before_save(&self.file_name, &state.value).await?;

        let written = self.write_value(&state.value).await;
        if written.is_ok() {
            state.dirty = false;
        }
        self.observer
            .after_save(&self.file_name, &state.value, written.as_ref().map(|_| ()))
            .await;

        written?;
        debug!(file = %self.file_name, "Snapshot saved");
        Ok(())
    }

    async fn write_value(&self, value: &T) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        durable::write_snapshot(self.storage.as_ref(), &self.file_name, &bytes).await
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.dirty {
            self.persist(&mut state).await
        } else {
            Ok(())
        }
    }
}

/// A value persisted wholesale to one file.
pub struct SnapshotStore<T: SnapshotValue, C: Codec = JsonCodec> {
    inner: Arc<StoreInner<T, C>>,
    auto_save: Option<Duration>,
    saver: Option<JoinHandle<()>>,
}

impl<T: SnapshotValue> SnapshotStore<T, JsonCodec> {
    /// Start building a store persisted to `file_name`.
    ///
    /// An empty file name builds a memory-only store.
    pub fn builder(file_name: impl Into<String>) -> SnapshotStoreBuilder<T, JsonCodec> {
        SnapshotStoreBuilder {
            file_name: file_name.into(),
            storage: None,
            codec: JsonCodec,
            observer: Arc::new(NoopObserver),
            auto_save: None,
            initial: T::default(),
        }
    }

    /// Open `file_name` with default storage and the JSON codec.
    ///
    /// # Errors
    ///
    /// Fails if an existing file cannot be recovered, read, or decoded.
    pub async fn open(file_name: impl Into<String>) -> Result<Self> {
        Self::builder(file_name).open().await
    }
}

impl<T: SnapshotValue, C: Codec> SnapshotStore<T, C> {
    /// Run `f` against the current value under the shared lock.
    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let state = self.inner.state.read().await;
        f(&state.value)
    }

    /// A clone of the current value.
    pub async fn cloned(&self) -> T {
        self.read(T::clone).await
    }

    /// Apply `f` to a copy of the value and swap it in if `f` succeeds.
    ///
    /// A failing `f` leaves both the value and the file untouched. With no
    /// auto-save interval the new value is written before this returns;
    /// otherwise the store is marked dirty for the background saver.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or the encoding/storage error of the
    /// synchronous save. After a failed save the new value is kept in memory
    /// and stays dirty so a later flush retries it.
    pub async fn change<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut state = self.inner.state.write().await;

        let mut next = state.value.clone();
        let out = f(&mut next)?;
        state.value = next;
        state.dirty = true;

        if self.auto_save.is_none() {
            self.inner.persist(&mut state).await?;
        }

        Ok(out)
    }

    /// Persist if there are unsaved changes.
    ///
    /// # Errors
    ///
    /// Propagates encoding and storage failures.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Persist unconditionally.
    ///
    /// # Errors
    ///
    /// Propagates encoding and storage failures.
    pub async fn save(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        self.inner.persist(&mut state).await
    }

    /// Flush and stop the auto-save task.
    ///
    /// # Errors
    ///
    /// Propagates the final flush's failure; the saver is stopped regardless.
    pub async fn close(&self) -> Result<()> {
        let flushed = self.flush().await;
        if let Some(saver) = &self.saver {
            saver.abort();
        }
        flushed
    }

    /// The backing file name; empty for a memory-only store.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    /// Whether there are changes not yet persisted.
    pub async fn is_dirty(&self) -> bool {
        self.inner.state.read().await.dirty
    }
}

impl<T: SnapshotValue, C: Codec> Drop for SnapshotStore<T, C> {
    fn drop(&mut self) {
        if let Some(saver) = &self.saver {
            saver.abort();
        }
    }
}

impl<T: SnapshotValue, C: Codec> fmt::Debug for SnapshotStore<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("file_name", &self.inner.file_name)
            .field("codec", &self.inner.codec)
            .field("auto_save", &self.auto_save)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SnapshotStore`].
pub struct SnapshotStoreBuilder<T: SnapshotValue, C: Codec = JsonCodec> {
    file_name: String,
    storage: Option<Arc<dyn FileStorage>>,
    codec: C,
    observer: Arc<dyn SnapshotObserver<T>>,
    auto_save: Option<Duration>,
    initial: T,
}

impl<T: SnapshotValue, C: Codec> SnapshotStoreBuilder<T, C> {
    /// Use `storage` instead of the local filesystem.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a different encoding.
    #[must_use]
    pub fn codec<C2: Codec>(self, codec: C2) -> SnapshotStoreBuilder<T, C2> {
        SnapshotStoreBuilder {
            file_name: self.file_name,
            storage: self.storage,
            codec,
            observer: self.observer,
            auto_save: self.auto_save,
            initial: self.initial,
        }
    }

    /// Register the lifecycle observer, replacing [`NoopObserver`].
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn SnapshotObserver<T>>) -> Self {
        self.observer = observer;
        self
    }

    /// Batch saves on a timer instead of saving on every change.
    ///
    /// A zero interval keeps synchronous persistence.
    #[must_use]
    pub fn auto_save(mut self, interval: Duration) -> Self {
        self.auto_save = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Value used when no file exists yet.
    #[must_use]
    pub fn initial(mut self, value: T) -> Self {
        self.initial = value;
        self
    }

    /// Recover, load, and notify the observer.
    ///
    /// # Errors
    ///
    /// Fails if recovery, reading, decoding, or an observer hook fails.
    pub async fn open(self) -> Result<SnapshotStore<T, C>> {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(LocalFileStorage::default()));

        let inner = StoreInner {
            state: RwLock::new(SnapshotState {
                value: T::default(),
                dirty: false,
            }),
            codec: self.codec,
            storage,
            observer: self.observer,
            file_name: self.file_name,
        };

        let value = inner.load(self.initial).await?;
        inner.state.write().await.value = value;

        let inner = Arc::new(inner);
        let saver = self
            .auto_save
            .filter(|_| inner.is_persistent())
            .map(|every| spawn_saver(Arc::downgrade(&inner), every));

        info!(
            file = %inner.file_name,
            auto_save = ?self.auto_save,
            "Snapshot store opened"
        );

        Ok(SnapshotStore {
            inner,
            auto_save: self.auto_save,
            saver,
        })
    }
}

fn spawn_saver<T: SnapshotValue, C: Codec>(
    inner: Weak<StoreInner<T, C>>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.flush().await.into_option_logged();
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::BTreeMap;

    use deferq_core::{Error, ErrorKind};
    use tempfile::TempDir;

    use super::*;
    use crate::codec::BincodeCodec;

    type Map = BTreeMap<String, u32>;

    fn storage(dir: &TempDir) -> Arc<dyn FileStorage> {
        Arc::new(LocalFileStorage::new(dir.path()))
    }

    #[tokio::test]
    async fn test_missing_file_opens_with_initial() {
        let dir = TempDir::new().unwrap();
        let mut initial = Map::new();
        initial.insert("seed".into(), 1);

        let store = SnapshotStore::<Map>::builder("s.json")
            .storage(storage(&dir))
            .initial(initial.clone())
            .open()
            .await
            .unwrap();

        assert_eq!(store.cloned().await, initial);
        assert!(!dir.path().join("s.json").exists());
    }

    #[tokio::test]
    async fn test_change_persists_synchronously() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::<Map>::builder("s.json")
            .storage(storage(&dir))
            .open()
            .await
            .unwrap();

        store
            .change(|m| {
                m.insert("a".into(), 7);
                Ok(())
            })
            .await
            .unwrap();

        assert!(!store.is_dirty().await);
        let reopened = SnapshotStore::<Map>::builder("s.json")
            .storage(storage(&dir))
            .open()
            .await
            .unwrap();
        assert_eq!(reopened.read(|m| m.get("a").copied()).await, Some(7));
    }

    #[tokio::test]
    async fn test_failed_closure_leaves_value_untouched() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::<Map>::builder("s.json")
            .storage(storage(&dir))
            .open()
            .await
            .unwrap();

        let err = store
            .change(|m| {
                m.insert("half".into(), 1);
                Err::<(), _>(Error::already_exists("entry", "half"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(store.read(Map::is_empty).await);
        assert!(!dir.path().join("s.json").exists());
    }

    #[tokio::test]
    async fn test_memory_only_store_never_touches_disk() {
        let store = SnapshotStore::<Map>::open("").await.unwrap();
        store
            .change(|m| {
                m.insert("x".into(), 1);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(store.file_name(), "");
        assert!(!store.is_dirty().await);
        assert_eq!(store.read(Map::len).await, 1);
    }

    #[tokio::test]
    async fn test_auto_save_defers_until_flush() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::<Map>::builder("s.json")
            .storage(storage(&dir))
            .auto_save(Duration::from_secs(3600))
            .open()
            .await
            .unwrap();

        store
            .change(|m| {
                m.insert("a".into(), 1);
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.is_dirty().await);
        assert!(!dir.path().join("s.json").exists());

        store.close().await.unwrap();
        assert!(!store.is_dirty().await);
        assert!(dir.path().join("s.json").exists());
    }

    #[tokio::test]
    async fn test_auto_save_timer_persists() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::<Map>::builder("s.json")
            .storage(storage(&dir))
            .auto_save(Duration::from_millis(20))
            .open()
            .await
            .unwrap();

        store
            .change(|m| {
                m.insert("a".into(), 1);
                Ok(())
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.is_dirty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(dir.path().join("s.json").exists());
    }

    #[tokio::test]
    async fn test_bincode_store_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::<Map>::builder("s.bin")
            .storage(storage(&dir))
            .codec(BincodeCodec)
            .open()
            .await
            .unwrap();
        store
            .change(|m| {
                m.insert("k".into(), 42);
                Ok(())
            })
            .await
            .unwrap();
        drop(store);

        let reopened = SnapshotStore::<Map>::builder("s.bin")
            .storage(storage(&dir))
            .codec(BincodeCodec)
            .open()
            .await
            .unwrap();
        assert_eq!(reopened.read(|m| m.get("k").copied()).await, Some(42));
    }

    #[tokio::test]
    async fn test_corrupt_file_fails_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("s.json"), b"{ nope").unwrap();

        let err = SnapshotStore::<Map>::builder("s.json")
            .storage(storage(&dir))
            .open()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
