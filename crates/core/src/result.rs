//! Result type definition and extension traits.
//!
//! Provides combinators for the fire-and-forget paths where an error can only
//! be logged, never returned.

use crate::error::Error;

/// The standard Result type for deferq operations.
///
/// # Examples
///
/// ```ignore
/// fn operation() -> Result<String> {
///     let config = QueueConfig::from_toml_str("pending_file = \"q.json\"")?;
///     Ok(config.pending_file)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for Results.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;

    /// Unwrap the value or fall back to `T::default()`, logging the error.
    fn or_default_logged(self) -> T
    where
        T: Default;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, "Operation failed");
                None
            }
        }
    }

    fn or_default_logged(self) -> T
    where
        T: Default,
    {
        self.into_option_logged().unwrap_or_default()
    }

    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
