// packages/engine/src/utils/errors.rs
//! Engine error types
//!
//! `EngineError` is the only error type that leaves this crate. Errors and
//! panics raised inside an embedded runtime are translated into
//! [`EngineError::Embedded`] by the boundary guard before they reach a caller.

use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Host-owned engine error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Raised inside an embedded runtime instance and translated at the boundary
    #[error("{0}")]
    Embedded(String),

    /// Configuration rejected before any instance was created
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Package archive could not be opened
    #[error("Failed to open archive: {0}")]
    ArchiveOpenFailed(String),

    /// Caller passed a handle that does not belong here
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The owning pool has already been torn down
    #[error("Instance pool is closed")]
    PoolClosed,
}

impl EngineError {
    /// Message carried by the error, without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            EngineError::Embedded(msg)
            | EngineError::InvalidConfig(msg)
            | EngineError::ArchiveOpenFailed(msg)
            | EngineError::InvalidArgument(msg) => msg,
            EngineError::PoolClosed => "instance pool is closed",
        }
    }

    /// Whether this error originated inside an embedded runtime
    pub fn is_embedded(&self) -> bool {
        matches!(self, EngineError::Embedded(_))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_display_is_raw_message() {
        let err = EngineError::Embedded("boom".to_string());
        assert_eq!(err.to_string(), "boom");
        assert!(err.is_embedded());
    }

    #[test]
    fn test_config_error_prefix() {
        let err = EngineError::InvalidConfig("zero instances".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: zero instances");
        assert_eq!(err.message(), "zero instances");
        assert!(!err.is_embedded());
    }
}
