//! Driver error taxonomy and operation progress.
//!
//! Transient conditions (malformed reply, no signal yet, verification
//! mismatch within budget) never appear as errors: they are resolved inside
//! the engine and reported as [`Progress::Waiting`]. Everything else is a
//! [`DriverError`] that propagates one level to the test executor.

use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Outcome of a top-level driver operation that completed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The operation finished.
    Done,
    /// Nothing happened yet; the caller should re-invoke the operation.
    Waiting,
}

impl Progress {
    /// True for [`Progress::Done`].
    #[inline]
    pub const fn is_done(self) -> bool {
        matches!(self, Progress::Done)
    }
}

/// Error types for driver operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    /// Transport failure; the rest of the operation was not executed.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Missing or inconsistent configuration for an enabled feature.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bin or reprobe request could not be carried out.
    #[error("Binning error: {0}")]
    Binning(String),

    /// The handler replied, but the reply is semantically wrong.
    #[error("Answer error: {0}")]
    Answer(String),

    /// The configured model does not provide this feature.
    #[error("Not supported by this handler model: {0}")]
    Unsupported(String),

    /// Diagnostics key unknown to this handler model.
    #[error("Status not available: {0}")]
    NotAvailable(String),

    /// The operation was aborted by the operator before any command was sent.
    #[error("Operation aborted")]
    Aborted,
}

impl From<ConfigError> for DriverError {
    fn from(e: ConfigError) -> Self {
        DriverError::Config(e.to_string())
    }
}

/// Result type used by all driver operations.
pub type DriverResult<T = Progress> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Binning("bin 999 out of range".to_string());
        assert!(err.to_string().contains("999"));

        let err: DriverError = TransportError::Timeout.into();
        assert!(matches!(err, DriverError::Transport(TransportError::Timeout)));

        let err: DriverError = ConfigError::FileNotFound.into();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn test_progress() {
        assert!(Progress::Done.is_done());
        assert!(!Progress::Waiting.is_done());
    }
}
