//! Error types.

use std::io;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
///
/// Clonable so that a recorded background error can be returned to every
/// writer absorbed into a failed group commit.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O failure from the filesystem.
    #[error("IO error: {0}")]
    Io(String),

    /// On-disk state failed validation.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The requested key or database does not exist.
    #[error("NotFound: {0}")]
    NotFound(String),

    /// The operation is not supported in this configuration.
    #[error("Not implemented: {0}")]
    NotSupported(String),

    /// Caller-supplied argument or option is invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    pub fn io<S: Into<String>>(msg: S) -> Self {
        Error::Io(msg.into())
    }

    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Error::NotSupported(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Whether this error indicates damaged on-disk state.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Whether this error is a missing-key / missing-database result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::corruption("bad block");
        assert_eq!(format!("{}", err), "Corruption: bad block");

        let err = Error::invalid_argument("comparator mismatch");
        assert_eq!(format!("{}", err), "Invalid argument: comparator mismatch");
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_predicates() {
        assert!(Error::corruption("x").is_corruption());
        assert!(!Error::corruption("x").is_not_found());
        assert!(Error::not_found("y").is_not_found());
    }
}
