//! Core domain types
//!
//! This module contains the domain structures shared by every Conduit
//! process. Nodes, pipelines and steps are each owned by exactly one key in
//! the remote store; the types here are what gets serialized under those keys.

pub mod action;
pub mod node;
pub mod pipeline;
pub mod step;
pub mod webhook;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub use action::{Action, ActionRef, RunnerType};
pub use node::{Node, NodeType};
pub use pipeline::{Flow, Mount, NextStep, Pipeline, PipelineState, PipelineStatus, Stage, Trigger};
pub use step::{Audit, AuditState, Step, StepState, StepStatus};
pub use webhook::WebHook;

/// An object persisted under a single key of the remote store
///
/// The key returned by [`Resource::key`] is relative to the collection
/// prefix and doubles as the key of the local cache entry.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection segment of the storage key (`nodes`, `pipelines`, `steps`)
    const COLLECTION: &'static str;

    /// Key relative to the collection prefix
    fn key(&self) -> String;

    /// Rebuilds an identity-only object from a key
    ///
    /// Delete events carry no value, so this is all a watcher has to
    /// report which object disappeared.
    fn tombstone(key: &str) -> Result<Self>;

    /// Store revision of the last write observed for this object
    fn resource_version(&self) -> i64;

    /// Stamps the store revision onto the object
    fn set_resource_version(&mut self, revision: i64);
}

/// Checks that an identity segment can be embedded in storage keys
///
/// Segments are joined with `/` and `.`, so neither may appear inside one.
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", kind)));
    }

    if value.contains('/') || value.contains('.') {
        return Err(Error::validation(format!(
            "{} '{}' must not contain '/' or '.'",
            kind, value
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_segment() {
        assert!(validate_segment("namespace", "default").is_ok());
        assert!(validate_segment("namespace", "").is_err());
        assert!(validate_segment("namespace", "  ").is_err());
        assert!(validate_segment("pipeline id", "a.b").is_err());
        assert!(validate_segment("pipeline id", "a/b").is_err());
    }
}
