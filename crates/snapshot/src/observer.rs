//! Load/save lifecycle hooks.

use async_trait::async_trait;
use deferq_core::{Error, Result};

/// Collaborator notified around every load and save of a [`SnapshotStore`].
///
/// The after-hooks run whether the operation succeeded or not and receive
/// its outcome. Hooks run while the store holds its lock, so an observer must
/// not call back into the same store. Every hook defaults to a no-op.
///
/// [`SnapshotStore`]: crate::SnapshotStore
#[async_trait]
pub trait SnapshotObserver<T: Send + Sync>: Send + Sync {
    /// Called before the file is read.
    ///
    /// # Errors
    ///
    /// An error aborts the load.
    async fn before_load(&self, _file: &str) -> Result<()> {
        Ok(())
    }

    /// Called with the freshly loaded value, or with the error that stopped
    /// the load, before the store is handed out.
    ///
    /// # Errors
    ///
    /// After a successful load an error fails store construction. After a
    /// failed load the returned error is logged and the load error wins.
    async fn after_load(&self, _file: &str, _loaded: std::result::Result<&T, &Error>) -> Result<()> {
        Ok(())
    }

    /// Called with the value about to be written.
    ///
    /// # Errors
    ///
    /// An error aborts the save.
    async fn before_save(&self, _file: &str, _value: &T) -> Result<()> {
        Ok(())
    }

    /// Called with the value that was written, or failed to be.
    async fn after_save(&self, _file: &str, _value: &T, _saved: std::result::Result<(), &Error>) {}
}

/// Observer that ignores every event. The default for a new store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl<T: Send + Sync> SnapshotObserver<T> for NoopObserver {}
