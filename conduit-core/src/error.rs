//! Error types shared across Conduit crates

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the domain model
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed object or request, never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced object does not exist
    #[error("{kind} '{key}' not found")]
    NotFound {
        /// Resource kind (pipeline, step, action, ...)
        kind: &'static str,
        /// Key that was looked up
        key: String,
    },

    /// No node could be selected for a schedulable unit
    #[error("scheduling failed: {0}")]
    Schedule(String),

    /// A storage key could not be decoded into an identity
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    /// JSON encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("pipeline", "default/p1");
        assert_eq!(err.to_string(), "pipeline 'default/p1' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validation_is_not_not_found() {
        let err = Error::validation("missing stages");
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "validation failed: missing stages");
    }
}
