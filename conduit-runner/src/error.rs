//! Error types for runners

use thiserror::Error;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors raised while driving a workload
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The action does not carry what this runner needs
    #[error("invalid runner parameters: {0}")]
    InvalidParams(String),

    /// The backend tool could not be started
    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend tool exited unsuccessfully
    #[error("'{command}' failed (exit code {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The step carries no handle to its workload
    #[error("step '{step}' has no '{key}' in its response")]
    MissingCorrelation { step: String, key: String },

    /// The workload is not known to this runner
    #[error("unknown workload '{0}'")]
    UnknownWorkload(String),

    /// The operation is not available on this backend
    #[error("{0} is not supported by this runner")]
    Unsupported(&'static str),

    /// Local I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Check if this error is a missing correlation id
    pub fn is_missing_correlation(&self) -> bool {
        matches!(self, Self::MissingCorrelation { .. })
    }
}
