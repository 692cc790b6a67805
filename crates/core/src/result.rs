//! Result alias and extension helpers.

use crate::error::Error;

/// The standard Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing combinators for provider results.
pub trait ResultExt<T> {
    /// Treat a not found error as "already gone": `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns every error other than [`Error::NotFound`] unchanged.
    fn ignore_not_found(self) -> Result<Option<T>>;
}

impl<T> ResultExt<T> for Result<T> {
    fn ignore_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => {
                tracing::debug!(error = %e, "treating missing resource as already deleted");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
