//! Error types for PolyStore
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for PolyStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for PolyStore
#[derive(Debug, Error)]
pub enum Error {
    // Coordination errors
    #[error("coordination store error: {0}")]
    CoordinationStore(String),

    #[error("timed out waiting for lock: {resource}")]
    LockTimeout { resource: String },

    // Topology errors
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("storage unit not found: {0}")]
    StorageUnitNotFound(String),

    #[error("storage engine not found: {0}")]
    StorageEngineNotFound(u64),

    #[error("fragment not found: {0}")]
    FragmentNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid layout error
    pub fn invalid_layout(msg: impl Into<String>) -> Self {
        Self::InvalidLayout(msg.into())
    }

    /// Create a coordination store error
    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::CoordinationStore(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CoordinationStore(_) | Self::LockTimeout { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::StorageUnitNotFound(_) | Self::StorageEngineNotFound(_) | Self::FragmentNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::coordination("down").is_retryable());
        assert!(
            Error::LockTimeout {
                resource: "fragment".into()
            }
            .is_retryable()
        );
        assert!(!Error::invalid_layout("gap").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::StorageUnitNotFound("unit0000000001".into()).is_not_found());
        assert!(Error::StorageEngineNotFound(3).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::LockTimeout {
            resource: "storage_unit".into(),
        };
        assert_eq!(err.to_string(), "timed out waiting for lock: storage_unit");
    }
}
