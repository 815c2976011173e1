//! File storage collaborator.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use deferq_core::{Error, Result};
use tokio::io::AsyncWriteExt;

/// Named-file byte storage.
///
/// Names are opaque to the store; implementations decide how to resolve them.
#[async_trait]
pub trait FileStorage: Send + Sync + std::fmt::Debug {
    /// Replace the contents of `name` with `data`.
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Read `name`, or `None` if it does not exist.
    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Check whether `name` exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Rename `from` to `to`, replacing `to` if present.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove `name`. Removing a missing file succeeds.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Local filesystem storage rooted at a directory.
///
/// Relative names resolve against the root; absolute names are used as-is.
/// Writes go to a `.tmp` sibling that is fsynced and renamed over the target.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    /// Create storage rooted at `root`. An empty root means the working directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a storage name to a filesystem path.
    #[must_use]
    pub fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut temp = OsString::from(path.as_os_str());
        temp.push(".tmp");
        PathBuf::from(temp)
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(name);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::file_write_failed(parent, e))?;
        }

        let temp = Self::temp_path(&path);
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| Error::file_write_failed(&temp, e))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::file_write_failed(&temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::file_write_failed(&temp, e))?;
        drop(file);

        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| Error::file_write_failed(&path, e))
    }

    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_read_failed(path, e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::file_read_failed(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| Error::file_write_failed(from, e))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::file_write_failed(path, e)),
        }
    }
}
