//! Action catalog contract
//!
//! Actions are owned by an external catalog service. The scheduler consults
//! it when validating a new pipeline and the execution engine when resolving
//! a step's parameters and runner.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::domain::{Action, ActionRef};

/// Errors reported by an action catalog
///
/// An absent action and an unreachable catalog are distinct: the first is a
/// permanent failure of the step, the second is retried.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog has no such action
    #[error("action '{name}@{version}' not found in namespace '{namespace}'")]
    NotFound {
        namespace: String,
        name: String,
        version: String,
    },

    /// The catalog could not be reached or answered with garbage
    #[error("catalog request failed: {0}")]
    Transport(String),
}

impl CatalogError {
    pub fn not_found(namespace: &str, action: &ActionRef) -> Self {
        Self::NotFound {
            namespace: namespace.to_string(),
            name: action.name.clone(),
            version: action.version.clone(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Read-only view of the action catalog
#[async_trait]
pub trait ActionCatalog: Send + Sync {
    /// Looks up one action version visible from `namespace`
    async fn describe_action(
        &self,
        namespace: &str,
        action: &ActionRef,
    ) -> Result<Action, CatalogError>;
}

/// Catalog served from memory
///
/// Actions are visible from every namespace. Used for standalone
/// deployments with actions declared in the configuration, and in tests.
#[derive(Default)]
pub struct StaticActionCatalog {
    actions: RwLock<HashMap<(String, String), Action>>,
}

impl StaticActionCatalog {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        let catalog = Self::default();
        for action in actions {
            catalog.insert(action);
        }
        catalog
    }

    /// Adds or replaces an action
    pub fn insert(&self, action: Action) {
        let key = (action.name.clone(), action.version.clone());
        self.actions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, action);
    }

    pub fn len(&self) -> usize {
        self.actions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActionCatalog for StaticActionCatalog {
    async fn describe_action(
        &self,
        namespace: &str,
        action: &ActionRef,
    ) -> Result<Action, CatalogError> {
        self.actions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(action.name.clone(), action.version.clone()))
            .cloned()
            .ok_or_else(|| CatalogError::not_found(namespace, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn action(name: &str, version: &str) -> Action {
        Action {
            name: name.to_string(),
            version: version.to_string(),
            runner_type: "local".to_string(),
            run_params: BTreeMap::new(),
            required_params: Vec::new(),
            runner_params: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_static_catalog_lookup() {
        let catalog = StaticActionCatalog::new([action("build", "v1"), action("build", "v2")]);
        assert_eq!(catalog.len(), 2);

        let found = catalog
            .describe_action("default", &"build@v2".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(found.version, "v2");

        let err = catalog
            .describe_action("default", &"build@v3".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("build@v3"));
    }
}
