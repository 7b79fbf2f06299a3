//! Error types for store operations

use thiserror::Error;

use crate::{LeaseId, Revision};

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors reported by a store backend
#[derive(Debug, Error)]
pub enum KvError {
    /// Key does not exist
    #[error("key '{0}' not found")]
    NotFound(String),

    /// Lease expired or was never granted
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// Conditional write lost against a newer revision
    #[error("revision conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: Revision,
        actual: Revision,
    },

    /// Requested watch start revision is no longer retained
    #[error("revision {0} has been compacted")]
    Compacted(Revision),

    /// Store is shutting down
    #[error("store closed")]
    Closed,

    /// Transport or backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl KvError {
    /// Check if this error is a lease-not-found error
    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, Self::LeaseNotFound(_))
    }

    /// Check if this error is a revision conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = KvError::Conflict {
            key: "a/b".to_string(),
            expected: 3,
            actual: 5,
        };
        assert_eq!(err.to_string(), "revision conflict on 'a/b': expected 3, found 5");
        assert!(err.is_conflict());
        assert!(!err.is_lease_not_found());
    }
}
