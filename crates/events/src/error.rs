//! Errors raised by the event bus and its subscriptions.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The bus was built with unusable settings.
    #[error("invalid event bus configuration: {reason}")]
    InvalidConfig { reason: String },

    /// No event is waiting on a non-blocking receive.
    #[error("no event available")]
    Empty,

    /// Every sender is gone; no further events will arrive.
    #[error("event channel closed")]
    ChannelClosed,

    /// The subscriber fell behind and the oldest events were overwritten.
    #[error("subscriber lagged behind by {skipped} events")]
    Lagged { skipped: u64 },
}

impl Error {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the subscription can keep receiving after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Empty | Self::Lagged { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lagged_is_recoverable() {
        let err = Error::Lagged { skipped: 12 };
        assert!(err.to_string().contains("12"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_closed_is_final() {
        assert!(!Error::ChannelClosed.is_recoverable());
        assert!(Error::invalid_config("capacity is zero")
            .to_string()
            .contains("capacity is zero"));
    }
}
