//! Core error types for deferq operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for deferq operations.
#[derive(Debug, Error)]
pub enum Error {
    // Caller errors
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("{entity} already exists: '{id}'")]
    AlreadyExists { entity: String, id: String },

    #[error("{entity} not found: '{id}'")]
    NotFound { entity: String, id: String },

    #[error("aborted: {reason}")]
    Aborted { reason: String },

    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("failed to write file '{path}': {reason}")]
    FileWriteFailed { path: PathBuf, reason: String },

    // Encoding and configuration errors
    #[error("serialization error: {reason}")]
    SerializationFailed { reason: String },

    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyExists,
    NotFound,
    Aborted,
    Storage,
    Serialization,
    Config,
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create an aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a file write error.
    pub fn file_write_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a serialization error.
    pub fn serialization_failed(reason: impl ToString) -> Self {
        Self::SerializationFailed {
            reason: reason.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            reason: reason.into(),
        }
    }

    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Aborted { .. } => ErrorKind::Aborted,
            Self::FileReadFailed { .. } | Self::FileWriteFailed { .. } | Self::Io(_) => {
                ErrorKind::Storage
            }
            Self::SerializationFailed { .. } => ErrorKind::Serialization,
            Self::ConfigInvalid { .. } => ErrorKind::Config,
        }
    }
}
