//! Result alias and logging combinators.
//!
//! Background tasks must keep running when a side effect fails (an event
//! that could not be stored, a trigger for an application that was just
//! removed). These combinators turn such failures into log lines.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for keel core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Log-and-discard combinators for any Result whose error can be displayed.
pub trait LogResultExt<T> {
    /// Log a warning describing `what` failed, and drop the error.
    fn warn_on_err(self, what: &str) -> Option<T>;

    /// Like [`Self::warn_on_err`], at debug level for expected failures.
    fn debug_on_err(self, what: &str) -> Option<T>;
}

impl<T, E: Display> LogResultExt<T> for std::result::Result<T, E> {
    fn warn_on_err(self, what: &str) -> Option<T> {
        self.map_err(|e| tracing::warn!(error = %e, "{what}")).ok()
    }

    fn debug_on_err(self, what: &str) -> Option<T> {
        self.map_err(|e| tracing::debug!(error = %e, "{what}")).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_passes_through() {
        let result: Result<u8> = Ok(7);
        assert_eq!(result.warn_on_err("loading"), Some(7));
    }

    #[test]
    fn test_core_error_is_discarded() {
        let result: Result<u8> = Err(Error::invalid_config("history_limit is zero"));
        assert_eq!(result.warn_on_err("loading"), None);
    }

    #[test]
    fn test_foreign_error_is_discarded() {
        let result: std::result::Result<(), String> = Err("no worker".to_string());
        assert_eq!(result.debug_on_err("unregistering"), None);
    }
}
