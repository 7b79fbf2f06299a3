//! Indexed store
//!
//! A concurrent map from key to object plus named secondary indexes. Every
//! operation takes the single internal lock, so a [`Indexer::replace`] is
//! never interleaved with a concurrent add, update or delete.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use conduit_core::Resource;

use crate::error::{InformerError, Result};

/// Maps an object to the index values it is filed under
pub type IndexFunc<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

type KeyFunc<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

struct Inner<T> {
    items: HashMap<String, Arc<T>>,
    indexers: HashMap<String, IndexFunc<T>>,

    /// index name -> index value -> keys
    indices: HashMap<String, HashMap<String, HashSet<String>>>,
    resource_version: i64,
}

impl<T> Inner<T> {
    fn unindex(&mut self, key: &str, obj: &T) {
        for (name, func) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in func(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn index(&mut self, key: &str, obj: &T) {
        for (name, func) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in func(obj) {
                index.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn put(&mut self, key: String, obj: Arc<T>) -> Option<Arc<T>> {
        let previous = self.items.remove(&key);
        if let Some(old) = &previous {
            self.unindex(&key, old);
        }
        self.index(&key, &obj);
        self.items.insert(key, obj);
        previous
    }

    fn remove(&mut self, key: &str) -> Option<Arc<T>> {
        let previous = self.items.remove(key);
        if let Some(old) = &previous {
            self.unindex(key, old);
        }
        previous
    }

    fn rebuild(&mut self) {
        self.indices.clear();
        let items: Vec<(String, Arc<T>)> = self
            .items
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        for (key, obj) in items {
            self.index(&key, &obj);
        }
    }

    fn keys_for(&self, name: &str, value: &str) -> Result<Vec<String>> {
        if !self.indexers.contains_key(name) {
            return Err(InformerError::UnknownIndex(name.to_string()));
        }

        let mut keys: Vec<String> = self
            .indices
            .get(name)
            .and_then(|index| index.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

/// Thread-safe keyed cache with secondary indexes
pub struct Indexer<T> {
    key_func: KeyFunc<T>,
    inner: RwLock<Inner<T>>,
}

impl<T: Resource> Indexer<T> {
    /// Creates an indexer keyed by [`Resource::key`]
    pub fn for_resource() -> Self {
        Self::new(|obj: &T| obj.key())
    }
}

impl<T> Indexer<T> {
    /// Creates an indexer with a custom key function
    pub fn new(key_func: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        Self {
            key_func: Arc::new(key_func),
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                indexers: HashMap::new(),
                indices: HashMap::new(),
                resource_version: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Key the object is stored under
    pub fn key_of(&self, obj: &T) -> String {
        (self.key_func)(obj)
    }

    /// Registers additional indexes and files existing items under them
    pub fn add_indexers(&self, indexers: Vec<(&str, IndexFunc<T>)>) {
        let mut inner = self.write();
        for (name, func) in indexers {
            inner.indexers.insert(name.to_string(), func);
        }
        inner.rebuild();
    }

    /// Inserts an object, returning the one it replaced
    pub fn add(&self, obj: T) -> Option<Arc<T>> {
        let key = self.key_of(&obj);
        self.write().put(key, Arc::new(obj))
    }

    /// Replaces an object, returning the previous one
    pub fn update(&self, obj: T) -> Option<Arc<T>> {
        self.add(obj)
    }

    /// Removes an object by the key of the given one
    pub fn delete(&self, obj: &T) -> Option<Arc<T>> {
        let key = self.key_of(obj);
        self.write().remove(&key)
    }

    /// Removes an object by key
    pub fn delete_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.write().remove(key)
    }

    /// Looks up the stored version of an object
    pub fn get(&self, obj: &T) -> Option<Arc<T>> {
        let key = self.key_of(obj);
        self.get_by_key(&key)
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.read().items.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().items.contains_key(key)
    }

    /// Snapshot of every object
    pub fn list(&self) -> Vec<Arc<T>> {
        self.read().items.values().cloned().collect()
    }

    /// Sorted snapshot of every key
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().items.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically swaps the whole content for a freshly listed one
    pub fn replace(&self, items: Vec<T>, resource_version: i64) {
        let items: HashMap<String, Arc<T>> = items
            .into_iter()
            .map(|obj| (self.key_of(&obj), Arc::new(obj)))
            .collect();

        let mut inner = self.write();
        inner.items = items;
        inner.resource_version = resource_version;
        inner.rebuild();
    }

    /// Revision the last replace was listed at
    pub fn resource_version(&self) -> i64 {
        self.read().resource_version
    }

    /// Objects sharing any value of the named index with `obj`
    pub fn index(&self, name: &str, obj: &T) -> Result<Vec<Arc<T>>> {
        let inner = self.read();
        let func = inner
            .indexers
            .get(name)
            .ok_or_else(|| InformerError::UnknownIndex(name.to_string()))?;

        let mut keys: Vec<String> = Vec::new();
        for value in func(obj) {
            for key in inner.keys_for(name, &value)? {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys.sort();

        Ok(keys
            .iter()
            .filter_map(|k| inner.items.get(k).cloned())
            .collect())
    }

    /// Objects filed under one value of the named index
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<T>>> {
        let inner = self.read();
        Ok(inner
            .keys_for(name, value)?
            .iter()
            .filter_map(|k| inner.items.get(k).cloned())
            .collect())
    }

    /// Keys filed under one value of the named index
    pub fn index_keys(&self, name: &str, value: &str) -> Result<Vec<String>> {
        self.read().keys_for(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::{Node, NodeType};
    use std::thread;

    fn node(name: &str, node_type: NodeType) -> Node {
        Node::new("conduit", name, node_type, 10)
    }

    fn type_index() -> IndexFunc<Node> {
        Arc::new(|n: &Node| vec![n.node_type.to_string()])
    }

    #[test]
    fn test_add_get_delete() {
        let indexer = Indexer::for_resource();
        assert!(indexer.add(node("n1", NodeType::Node)).is_none());
        assert!(indexer.add(node("n1", NodeType::Node)).is_some());
        assert_eq!(indexer.len(), 1);

        let found = indexer.get_by_key("node/n1").unwrap();
        assert_eq!(found.instance_name, "n1");

        assert!(indexer.delete(&node("n1", NodeType::Node)).is_some());
        assert!(indexer.is_empty());
        assert!(indexer.delete_by_key("node/n1").is_none());
    }

    #[test]
    fn test_indexes_follow_updates() {
        let indexer: Indexer<Node> = Indexer::for_resource();
        indexer.add_indexers(vec![("type", type_index())]);

        indexer.add(node("n1", NodeType::Node));
        indexer.add(node("n2", NodeType::Node));
        indexer.add(node("s1", NodeType::Scheduler));

        assert_eq!(
            indexer.index_keys("type", "node").unwrap(),
            vec!["node/n1", "node/n2"]
        );
        assert_eq!(indexer.by_index("type", "scheduler").unwrap().len(), 1);
        assert_eq!(indexer.index("type", &node("x", NodeType::Node)).unwrap().len(), 2);

        indexer.delete_by_key("node/n2");
        assert_eq!(indexer.index_keys("type", "node").unwrap(), vec!["node/n1"]);
    }

    #[test]
    fn test_unknown_index() {
        let indexer: Indexer<Node> = Indexer::for_resource();
        assert!(matches!(
            indexer.by_index("missing", "x"),
            Err(InformerError::UnknownIndex(_))
        ));
    }

    #[test]
    fn test_add_indexers_files_existing_items() {
        let indexer: Indexer<Node> = Indexer::for_resource();
        indexer.add(node("n1", NodeType::Node));
        indexer.add_indexers(vec![("type", type_index())]);
        assert_eq!(indexer.index_keys("type", "node").unwrap(), vec!["node/n1"]);
    }

    #[test]
    fn test_replace_supersedes_contents() {
        let indexer: Indexer<Node> = Indexer::for_resource();
        indexer.add_indexers(vec![("type", type_index())]);
        indexer.add(node("old", NodeType::Node));

        indexer.replace(
            vec![node("a", NodeType::Scheduler), node("b", NodeType::Node)],
            42,
        );

        assert_eq!(indexer.list_keys(), vec!["node/b", "scheduler/a"]);
        assert_eq!(indexer.index_keys("type", "node").unwrap(), vec!["node/b"]);
        assert_eq!(indexer.resource_version(), 42);
    }

    #[test]
    fn test_concurrent_writers_and_replace() {
        let indexer: Arc<Indexer<Node>> = Arc::new(Indexer::for_resource());
        indexer.add_indexers(vec![("type", type_index())]);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let indexer = Arc::clone(&indexer);
                thread::spawn(move || {
                    for i in 0..100 {
                        indexer.add(node(&format!("n{}-{}", t, i), NodeType::Node));
                        if i % 25 == 0 {
                            indexer.replace(vec![node("r", NodeType::Node)], i);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // The index must agree with the items whatever the interleaving was.
        let keys = indexer.list_keys();
        assert_eq!(indexer.index_keys("type", "node").unwrap(), keys);
    }
}
