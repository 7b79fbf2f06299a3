//! Storage key layout
//!
//! Every resource lives under `<org>/<service>/<collection>/<key>`, where
//! `<key>` is the resource's own [`Resource::key`]:
//!
//! - nodes:     `<root>/nodes/<type>/<instance>`
//! - pipelines: `<root>/pipelines/<namespace>/<id>`
//! - steps:     `<root>/steps/<namespace>/<namespace>.<pipeline>.<stage>.<step>`

use crate::domain::{Resource, Step, validate_segment};
use crate::error::Result;

/// Key prefixes shared by every process of one deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    /// Creates a layout rooted at `<org>/<service>`
    pub fn new(org: &str, service: &str) -> Self {
        Self {
            root: format!(
                "{}/{}",
                org.trim_matches('/'),
                service.trim_matches('/')
            ),
        }
    }

    /// The `<org>/<service>` root
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix every key of a collection starts with, including the trailing `/`
    pub fn prefix<T: Resource>(&self) -> String {
        format!("{}/{}/", self.root, T::COLLECTION)
    }

    /// Full storage key of an object
    pub fn storage_key<T: Resource>(&self, obj: &T) -> String {
        format!("{}{}", self.prefix::<T>(), obj.key())
    }

    /// Cache key of a storage key, if the key belongs to the collection
    pub fn cache_key<'a, T: Resource>(&self, storage_key: &'a str) -> Option<&'a str> {
        let prefix = self.prefix::<T>();
        storage_key
            .strip_prefix(prefix.as_str())
            .filter(|rest| !rest.is_empty())
    }

    /// Prefix covering all steps released by one pipeline
    ///
    /// Used for cascade deletes, so both the namespace and the pipeline id
    /// must be real segments: an empty or malformed one would widen the
    /// prefix to other pipelines.
    pub fn pipeline_steps_prefix(&self, namespace: &str, pipeline_id: &str) -> Result<String> {
        validate_segment("namespace", namespace)?;
        validate_segment("pipeline id", pipeline_id)?;

        Ok(format!(
            "{}{}/{}.{}.",
            self.prefix::<Step>(),
            namespace,
            namespace,
            pipeline_id
        ))
    }

    /// Key holding a process's configuration document
    pub fn config_key(&self, instance: &str) -> String {
        format!("{}/config/{}", self.root, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Node, NodeType, Pipeline};

    #[test]
    fn test_prefixes() {
        let layout = KeyLayout::new("acme", "conduit");
        assert_eq!(layout.prefix::<Node>(), "acme/conduit/nodes/");
        assert_eq!(layout.prefix::<Pipeline>(), "acme/conduit/pipelines/");
        assert_eq!(layout.prefix::<Step>(), "acme/conduit/steps/");
    }

    #[test]
    fn test_storage_and_cache_keys() {
        let layout = KeyLayout::new("/acme/", "conduit");
        let node = Node::new("conduit", "n1", NodeType::Node, 10);
        let key = layout.storage_key(&node);
        assert_eq!(key, "acme/conduit/nodes/node/n1");
        assert_eq!(layout.cache_key::<Node>(&key), Some("node/n1"));
        assert_eq!(layout.cache_key::<Pipeline>(&key), None);
        assert_eq!(layout.cache_key::<Node>("acme/conduit/nodes/"), None);
    }

    #[test]
    fn test_pipeline_steps_prefix_structural_guard() {
        let layout = KeyLayout::new("acme", "conduit");
        assert_eq!(
            layout.pipeline_steps_prefix("default", "p1").unwrap(),
            "acme/conduit/steps/default/default.p1."
        );
        assert!(layout.pipeline_steps_prefix("", "p1").is_err());
        assert!(layout.pipeline_steps_prefix("default", "").is_err());
        assert!(layout.pipeline_steps_prefix("default", "p1.2").is_err());
    }

    #[test]
    fn test_pipeline_steps_prefix_covers_only_its_steps() {
        let layout = KeyLayout::new("acme", "conduit");
        let prefix = layout.pipeline_steps_prefix("default", "p1").unwrap();

        let mut own = Step::new("a", "build@v1");
        own.namespace = "default".to_string();
        own.pipeline_id = "p1".to_string();
        own.stage = 1;

        let mut other = own.clone();
        other.pipeline_id = "p10".to_string();

        assert!(layout.storage_key(&own).starts_with(&prefix));
        assert!(!layout.storage_key(&other).starts_with(&prefix));
    }
}
