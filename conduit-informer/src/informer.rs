//! Generic informer
//!
//! One [`Informer`] mirrors one collection prefix of the store:
//! - Lister: prefix scan decoded into domain objects
//! - Watcher: prefix subscription feeding the [`Indexer`] and an [`EventHandler`]
//! - Recorder: writes objects back under their canonical key

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::domain::{Node, Pipeline, Step};
use conduit_core::{KeyLayout, Resource};
use conduit_kv::{EventKind, KeyValue, KvError, KvStore, Revision, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{InformerError, Result};
use crate::handler::EventHandler;
use crate::indexer::Indexer;

/// Delay before retrying a failed list or watch
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Predicate deciding which objects the informer delivers
pub type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub type NodeInformer = Informer<Node>;
pub type PipelineInformer = Informer<Pipeline>;
pub type StepInformer = Informer<Step>;

/// Lister, Watcher and Recorder for one resource collection
pub struct Informer<T: Resource> {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
    indexer: Arc<Indexer<T>>,
    filter: Option<Filter<T>>,
}

impl<T: Resource> Informer<T> {
    /// Creates an informer over `<root>/<collection>/`
    pub fn new(kv: Arc<dyn KvStore>, layout: KeyLayout) -> Self {
        Self {
            kv,
            layout,
            indexer: Arc::new(Indexer::for_resource()),
            filter: None,
        }
    }

    /// Restricts the cache and callbacks to objects matching `filter`
    pub fn with_filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// The local cache
    pub fn indexer(&self) -> &Arc<Indexer<T>> {
        &self.indexer
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Prefix this informer watches
    pub fn prefix(&self) -> String {
        self.layout.prefix::<T>()
    }

    fn accepts(&self, obj: &T) -> bool {
        self.filter.as_ref().is_none_or(|f| f(obj))
    }

    fn decode(kv: &KeyValue) -> Result<T> {
        let mut obj: T = serde_json::from_slice(&kv.value).map_err(|e| InformerError::Decode {
            key: kv.key.clone(),
            source: e,
        })?;
        obj.set_resource_version(kv.mod_revision);
        Ok(obj)
    }

    fn encode(&self, obj: &T) -> Result<(String, Vec<u8>)> {
        let key = self.layout.storage_key(obj);
        let value = serde_json::to_vec(obj).map_err(|e| InformerError::Encode {
            key: key.clone(),
            source: e,
        })?;
        Ok((key, value))
    }

    // ============================================================================
    // Lister
    // ============================================================================

    /// Scans the whole collection
    ///
    /// Returns every decodable object, unfiltered, and the revision the scan
    /// was served at. Undecodable values are skipped with a warning.
    pub async fn list(&self) -> Result<(Vec<T>, Revision)> {
        let resp = self.kv.list(&self.prefix()).await?;

        let mut items = Vec::with_capacity(resp.kvs.len());
        for kv in &resp.kvs {
            match Self::decode(kv) {
                Ok(obj) => items.push(obj),
                Err(e) => warn!("Skipping undecodable value: {}", e),
            }
        }

        Ok((items, resp.revision))
    }

    /// Reads one object straight from the store by cache key
    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        let storage_key = format!("{}{}", self.prefix(), key);
        match self.kv.get(&storage_key).await? {
            Some(kv) => Ok(Some(Self::decode(&kv)?)),
            None => Ok(None),
        }
    }

    /// Reads one object from the local cache
    pub fn cached(&self, key: &str) -> Option<Arc<T>> {
        self.indexer.get_by_key(key)
    }

    // ============================================================================
    // Recorder
    // ============================================================================

    /// Writes an object back under its canonical key
    ///
    /// The written revision is stamped onto `obj`.
    pub async fn update(&self, obj: &mut T) -> Result<Revision> {
        let (key, value) = self.encode(obj)?;
        let revision = self.kv.put(&key, value, None).await?;
        obj.set_resource_version(revision);
        debug!("Recorded {} at revision {}", key, revision);
        Ok(revision)
    }

    /// Writes an object only if the stored revision still matches its own
    ///
    /// A concurrent writer surfaces as a conflict error; the caller should
    /// re-read and try again.
    pub async fn claim(&self, obj: &mut T) -> Result<Revision> {
        let (key, value) = self.encode(obj)?;
        let revision = self
            .kv
            .put_if(&key, value, obj.resource_version())
            .await?;
        obj.set_resource_version(revision);
        debug!("Claimed {} at revision {}", key, revision);
        Ok(revision)
    }

    /// Writes an object only if its key does not exist yet
    pub async fn create(&self, obj: &mut T) -> Result<Revision> {
        let (key, value) = self.encode(obj)?;
        let revision = self.kv.put_if(&key, value, 0).await?;
        obj.set_resource_version(revision);
        Ok(revision)
    }

    /// Deletes an object's key
    pub async fn delete(&self, obj: &T) -> Result<bool> {
        Ok(self.kv.delete(&self.layout.storage_key(obj)).await?)
    }

    /// Deletes every key under a full storage prefix
    ///
    /// The prefix must lie inside this informer's collection.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        if self.layout.cache_key::<T>(prefix).is_none() {
            return Err(conduit_core::Error::InvalidKey(prefix.to_string()).into());
        }

        Ok(self.kv.delete_prefix(prefix).await?)
    }

    // ============================================================================
    // Watcher
    // ============================================================================

    /// Re-lists the collection and replaces the cache
    ///
    /// Differences between the old and new cache contents are reported to
    /// `handler` as add, update and delete callbacks. Returns the revision
    /// the listing was served at.
    pub async fn resync(&self, handler: &dyn EventHandler<T>) -> Result<Revision> {
        let (items, revision) = self.list().await?;
        let items: Vec<T> = items.into_iter().filter(|o| self.accepts(o)).collect();

        let mut previous: HashMap<String, Arc<T>> = self
            .indexer
            .list()
            .into_iter()
            .map(|o| (self.indexer.key_of(&o), o))
            .collect();

        self.indexer.replace(items.clone(), revision);

        for obj in &items {
            match previous.remove(&self.indexer.key_of(obj)) {
                None => handler.on_add(obj),
                Some(old) if old.resource_version() != obj.resource_version() => {
                    handler.on_update(&old, obj)
                }
                Some(_) => {}
            }
        }
        for old in previous.values() {
            handler.on_delete(old);
        }

        debug!(
            "Resynced {} {} at revision {}",
            items.len(),
            T::COLLECTION,
            revision
        );
        Ok(revision)
    }

    /// Applies one watch event to the cache and notifies `handler`
    pub fn handle_event(&self, event: WatchEvent, handler: &dyn EventHandler<T>) {
        let Some(key) = self.layout.cache_key::<T>(&event.key) else {
            return;
        };

        match event.kind {
            EventKind::Put => {
                let kv = KeyValue {
                    key: event.key.clone(),
                    value: event.value.unwrap_or_default(),
                    create_revision: 0,
                    mod_revision: event.revision,
                    lease: None,
                };

                let obj = match Self::decode(&kv) {
                    Ok(obj) => obj,
                    Err(e) => {
                        warn!("Ignoring watch event: {}", e);
                        return;
                    }
                };

                if !self.accepts(&obj) {
                    if let Some(old) = self.indexer.delete_by_key(key) {
                        handler.on_delete(&old);
                    }
                    return;
                }

                match self.indexer.update(obj.clone()) {
                    Some(old) => handler.on_update(&old, &obj),
                    None => handler.on_add(&obj),
                }
            }
            EventKind::Delete => {
                if let Some(old) = self.indexer.delete_by_key(key) {
                    handler.on_delete(&old);
                    return;
                }

                // A filtered informer never saw the object, so it was not ours.
                if self.filter.is_some() {
                    return;
                }

                match T::tombstone(key) {
                    Ok(obj) => handler.on_delete(&obj),
                    Err(e) => warn!("Ignoring delete of malformed key '{}': {}", key, e),
                }
            }
        }
    }

    /// Runs the watch loop until `cancel` fires
    ///
    /// Watching starts right after `start_revision`. A closed subscription or
    /// a compacted start revision triggers a [`Informer::resync`] and a new
    /// subscription from the relisted revision.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn EventHandler<T>>,
        start_revision: Revision,
        cancel: CancellationToken,
    ) {
        let prefix = self.prefix();
        let mut revision = start_revision;
        let mut needs_resync = false;

        info!("Watching {} from revision {}", prefix, revision + 1);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if needs_resync {
                match self.resync(handler.as_ref()).await {
                    Ok(rev) => {
                        revision = rev;
                        needs_resync = false;
                    }
                    Err(e) => {
                        warn!("Failed to relist {}: {}", prefix, e);
                        if Self::pause(&cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let mut stream = match self.kv.watch(&prefix, Some(revision + 1)).await {
                Ok(stream) => stream,
                Err(KvError::Compacted(rev)) => {
                    warn!("Revision {} of {} was compacted, relisting", rev, prefix);
                    needs_resync = true;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to watch {}: {}", prefix, e);
                    if Self::pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Stopped watching {}", prefix);
                        return;
                    }
                    event = stream.next() => match event {
                        Some(event) => {
                            revision = revision.max(event.revision);
                            self.handle_event(event, handler.as_ref());
                        }
                        None => {
                            warn!("Watch on {} closed, relisting", prefix);
                            needs_resync = true;
                            break;
                        }
                    }
                }
            }
        }

        info!("Stopped watching {}", prefix);
    }

    /// Sleeps for the retry delay; returns `true` if cancelled meanwhile
    async fn pause(cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(RETRY_DELAY) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::NodeType;
    use conduit_kv::MemoryKv;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl Recording {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn len(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    impl EventHandler<Node> for Recording {
        fn on_add(&self, obj: &Node) {
            self.events.lock().unwrap().push(format!("add {}", obj.key()));
        }

        fn on_update(&self, _old: &Node, new: &Node) {
            self.events.lock().unwrap().push(format!("update {}", new.key()));
        }

        fn on_delete(&self, obj: &Node) {
            self.events.lock().unwrap().push(format!("delete {}", obj.key()));
        }
    }

    fn layout() -> KeyLayout {
        KeyLayout::new("acme", "conduit")
    }

    fn node(name: &str) -> Node {
        Node::new("conduit", name, NodeType::Node, 10)
    }

    fn put_event(key: &str, node: &Node, revision: Revision) -> WatchEvent {
        WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: Some(serde_json::to_vec(node).unwrap()),
            revision,
        }
    }

    async fn wait_for(handler: &Recording, count: usize) {
        for _ in 0..200 {
            if handler.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} events, saw {:?}", count, handler.take());
    }

    #[tokio::test]
    async fn test_list_stamps_revision() {
        let kv = MemoryKv::new();
        let informer = NodeInformer::new(kv.clone(), layout());

        let mut n1 = node("n1");
        informer.update(&mut n1).await.unwrap();
        kv.put("acme/conduit/nodes/node/bad", b"not json".to_vec(), None)
            .await
            .unwrap();

        let (items, revision) = informer.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource_version, n1.resource_version);
        assert_eq!(revision, kv.revision());

        let fetched = informer.get("node/n1").await.unwrap().unwrap();
        assert_eq!(fetched.instance_name, "n1");
        assert!(informer.get("node/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redelivered_add_is_update() {
        let informer = NodeInformer::new(MemoryKv::new(), layout());
        let handler = Recording::default();
        let key = "acme/conduit/nodes/node/n1";

        informer.handle_event(put_event(key, &node("n1"), 5), &handler);
        informer.handle_event(put_event(key, &node("n1"), 5), &handler);

        assert_eq!(handler.take(), vec!["add node/n1", "update node/n1"]);
        assert_eq!(informer.indexer().len(), 1);
        assert_eq!(informer.cached("node/n1").unwrap().resource_version, 5);
    }

    #[tokio::test]
    async fn test_delete_reconstructs_identity() {
        let informer = NodeInformer::new(MemoryKv::new(), layout());
        let handler = Recording::default();

        informer.handle_event(
            WatchEvent {
                kind: EventKind::Delete,
                key: "acme/conduit/nodes/scheduler/s1".to_string(),
                value: None,
                revision: 3,
            },
            &handler,
        );

        assert_eq!(handler.take(), vec!["delete scheduler/s1"]);
    }

    #[tokio::test]
    async fn test_filter_evicts_objects_that_stop_matching() {
        let informer = NodeInformer::new(MemoryKv::new(), layout())
            .with_filter(|n: &Node| n.address != "drained");
        let handler = Recording::default();
        let key = "acme/conduit/nodes/node/n1";

        informer.handle_event(put_event(key, &node("n1"), 2), &handler);
        informer.handle_event(
            put_event(key, &node("n1").with_address("drained"), 3),
            &handler,
        );
        informer.handle_event(put_event("acme/conduit/nodes/node/n2", &node("n2").with_address("drained"), 4), &handler);

        assert_eq!(handler.take(), vec!["add node/n1", "delete node/n1"]);
        assert!(informer.indexer().is_empty());
    }

    #[tokio::test]
    async fn test_resync_reports_differences() {
        let kv = MemoryKv::new();
        let informer = NodeInformer::new(kv.clone(), layout());
        let handler = Recording::default();

        let mut a = node("a");
        let mut b = node("b");
        informer.update(&mut a).await.unwrap();
        informer.update(&mut b).await.unwrap();
        informer.resync(&handler).await.unwrap();
        assert_eq!(handler.take(), vec!["add node/a", "add node/b"]);

        informer.update(&mut a).await.unwrap();
        informer.delete(&b).await.unwrap();
        let mut c = node("c");
        informer.update(&mut c).await.unwrap();

        informer.resync(&handler).await.unwrap();
        let mut events = handler.take();
        events.sort();
        assert_eq!(events, vec!["add node/c", "delete node/b", "update node/a"]);
    }

    #[tokio::test]
    async fn test_run_follows_store_and_recovers_from_closed_watch() {
        let kv = MemoryKv::new();
        let informer = Arc::new(NodeInformer::new(kv.clone(), layout()));
        let handler = Arc::new(Recording::default());
        let cancel = CancellationToken::new();

        let revision = informer.resync(handler.as_ref()).await.unwrap();
        let task = tokio::spawn(Arc::clone(&informer).run(
            handler.clone(),
            revision,
            cancel.clone(),
        ));

        let mut n1 = node("n1");
        informer.update(&mut n1).await.unwrap();
        wait_for(&handler, 1).await;
        assert_eq!(handler.take(), vec!["add node/n1"]);

        kv.close_watchers();
        kv.compact();
        let mut n2 = node("n2");
        informer.update(&mut n2).await.unwrap();
        wait_for(&handler, 1).await;
        assert_eq!(handler.take(), vec!["add node/n2"]);

        informer.delete(&n1).await.unwrap();
        wait_for(&handler, 1).await;
        assert_eq!(handler.take(), vec!["delete node/n1"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_detects_concurrent_writer() {
        let informer = NodeInformer::new(MemoryKv::new(), layout());

        let mut first = node("n1");
        informer.create(&mut first).await.unwrap();

        let mut stale = first.clone();
        informer.update(&mut first).await.unwrap();

        let err = informer.claim(&mut stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(informer.claim(&mut first).await.is_ok());
        assert!(informer.create(&mut node("n1")).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_delete_prefix_stays_inside_collection() {
        let informer = NodeInformer::new(MemoryKv::new(), layout());
        assert!(informer.delete_prefix("acme/conduit/").await.is_err());
        assert!(informer.delete_prefix("acme/conduit/nodes/node/").await.is_ok());
    }
}
