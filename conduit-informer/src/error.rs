//! Error types for informers

use conduit_kv::KvError;
use thiserror::Error;

/// Result type alias for informer operations
pub type Result<T> = std::result::Result<T, InformerError>;

/// Errors raised while syncing with or writing to the store
#[derive(Debug, Error)]
pub enum InformerError {
    /// Store call failed
    #[error(transparent)]
    Store(#[from] KvError),

    /// A stored value could not be decoded
    #[error("failed to decode '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// An object could not be encoded
    #[error("failed to encode '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Domain-level error (invalid key, validation)
    #[error(transparent)]
    Core(#[from] conduit_core::Error),

    /// Index name was never registered
    #[error("index '{0}' does not exist")]
    UnknownIndex(String),
}

impl InformerError {
    /// Check if this error is a lost conditional write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
