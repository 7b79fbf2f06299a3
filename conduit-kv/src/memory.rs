//! In-memory store backend
//!
//! A single-process implementation of [`KvStore`] with real revisions,
//! lease expiry and watch history. Used for standalone deployments and as
//! the store double in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{KvError, Result};
use crate::{EventKind, KeyValue, KvStore, LeaseId, ListResponse, Revision, WatchEvent, WatchStream};

/// Number of events retained for watch replay
const HISTORY_LIMIT: usize = 10_000;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: Revision,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct State {
    revision: Revision,
    data: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    history: VecDeque<WatchEvent>,

    /// Highest revision no longer replayable
    compacted: Revision,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    fn publish(&mut self, event: WatchEvent) {
        self.subscribers
            .retain(|s| !event.key.starts_with(&s.prefix) || s.tx.send(event.clone()).is_ok());

        self.history.push_back(event);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
    }

    fn remove_key(&mut self, key: &str, revision: Revision) -> bool {
        let Some(entry) = self.data.remove(key) else {
            return false;
        };

        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }

        self.publish(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: None,
            revision,
        });
        true
    }

    fn insert(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(KvError::LeaseNotFound(id));
            }
        }

        let revision = self.next_revision();
        let previous = self.data.get(key).cloned();

        if let Some(old) = previous.as_ref().and_then(|e| e.lease) {
            if Some(old) != lease {
                if let Some(l) = self.leases.get_mut(&old) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.insert(key.to_string());
        }

        self.data.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                create_revision: previous.map(|e| e.create_revision).unwrap_or(revision),
                mod_revision: revision,
                lease,
            },
        );

        self.publish(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: Some(value),
            revision,
        });

        Ok(revision)
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };

        if !lease.keys.is_empty() {
            let revision = self.next_revision();
            let mut keys: Vec<String> = lease.keys.into_iter().collect();
            keys.sort();
            for key in keys {
                self.remove_key(&key, revision);
            }
        }
        true
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!("Lease {} expired", id);
            self.drop_lease(id);
        }
    }
}

/// In-memory [`KvStore`]
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<State>,
}

impl MemoryKv {
    /// Creates an empty store wrapped in Arc
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Locks the state and applies pending lease expiries
    fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.expire_leases(Instant::now());
        state
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// Ends every open watch subscription, as a store restart would
    pub fn close_watchers(&self) {
        let mut state = self.lock();
        info!("Closing {} watch subscription(s)", state.subscribers.len());
        state.subscribers.clear();
    }

    /// Forgets all history up to the current revision
    pub fn compact(&self) {
        let mut state = self.lock();
        state.compacted = state.revision;
        state.history.clear();
    }

    /// Periodically expires leases so deletes are published without traffic
    pub fn spawn_lease_reaper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        drop(store.lock());
                    }
                }
            }
        });
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.lock();
        Ok(state.data.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            create_revision: e.create_revision,
            mod_revision: e.mod_revision,
            lease: e.lease,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<ListResponse> {
        let state = self.lock();
        let kvs = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                create_revision: e.create_revision,
                mod_revision: e.mod_revision,
                lease: e.lease,
            })
            .collect();

        Ok(ListResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        self.lock().insert(key, value, lease)
    }

    async fn put_if(&self, key: &str, value: Vec<u8>, expected: Revision) -> Result<Revision> {
        let mut state = self.lock();
        let current = state.data.get(key).map(|e| (e.mod_revision, e.lease));
        let actual = current.map(|(rev, _)| rev).unwrap_or(0);

        if actual != expected {
            return Err(KvError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let lease = current.and_then(|(_, lease)| lease);
        state.insert(key, value, lease)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.lock();
        if !state.data.contains_key(key) {
            return Ok(false);
        }

        let revision = state.next_revision();
        Ok(state.remove_key(key, revision))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut state = self.lock();
        let keys: Vec<String> = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();

        if keys.is_empty() {
            return Ok(0);
        }

        let revision = state.next_revision();
        for key in &keys {
            state.remove_key(key, revision);
        }

        Ok(keys.len() as u64)
    }

    async fn watch(&self, prefix: &str, start_revision: Option<Revision>) -> Result<WatchStream> {
        let mut state = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(start) = start_revision {
            if start <= state.compacted {
                return Err(KvError::Compacted(start));
            }

            for event in state
                .history
                .iter()
                .filter(|e| e.revision >= start && e.key.starts_with(prefix))
            {
                // Receiver is held locally, so the send cannot fail.
                let _ = tx.send(event.clone());
            }
        }

        state.subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.lock();
        state.next_lease += 1;
        let id = state.next_lease;

        state.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );

        debug!("Granted lease {} (ttl {:?})", id, ttl);
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(KvError::LeaseNotFound(lease))?;

        entry.expires_at = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock();
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(KvError::LeaseNotFound(lease))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let kv = MemoryKv::new();
        let r1 = kv.put("a/x", b"1".to_vec(), None).await.unwrap();
        let r2 = kv.put("a/y", b"2".to_vec(), None).await.unwrap();
        kv.put("b/z", b"3".to_vec(), None).await.unwrap();
        assert!(r2 > r1);

        let got = kv.get("a/x").await.unwrap().unwrap();
        assert_eq!(got.value, b"1".to_vec());
        assert_eq!(got.mod_revision, r1);

        let list = kv.list("a/").await.unwrap();
        assert_eq!(list.kvs.len(), 2);
        assert_eq!(list.revision, 3);
    }

    #[tokio::test]
    async fn test_update_keeps_create_revision() {
        let kv = MemoryKv::new();
        let r1 = kv.put("k", b"1".to_vec(), None).await.unwrap();
        let r2 = kv.put("k", b"2".to_vec(), None).await.unwrap();

        let got = kv.get("k").await.unwrap().unwrap();
        assert_eq!(got.create_revision, r1);
        assert_eq!(got.mod_revision, r2);
    }

    #[tokio::test]
    async fn test_put_if_detects_conflict() {
        let kv = MemoryKv::new();
        let r1 = kv.put_if("k", b"1".to_vec(), 0).await.unwrap();
        assert!(kv.put_if("k", b"x".to_vec(), 0).await.unwrap_err().is_conflict());

        let r2 = kv.put_if("k", b"2".to_vec(), r1).await.unwrap();
        let err = kv.put_if("k", b"3".to_vec(), r1).await.unwrap_err();
        match err {
            KvError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, r1);
                assert_eq!(actual, r2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let kv = MemoryKv::new();
        kv.put("steps/a.1", b"1".to_vec(), None).await.unwrap();
        kv.put("steps/a.2", b"2".to_vec(), None).await.unwrap();
        kv.put("steps/b.1", b"3".to_vec(), None).await.unwrap();

        assert_eq!(kv.delete_prefix("steps/a.").await.unwrap(), 2);
        assert_eq!(kv.list("steps/").await.unwrap().kvs.len(), 1);
        assert!(!kv.delete("steps/a.1").await.unwrap());
        assert!(kv.delete("steps/b.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_delivers_in_revision_order() {
        let kv = MemoryKv::new();
        let mut stream = kv.watch("p/", None).await.unwrap();

        kv.put("p/1", b"a".to_vec(), None).await.unwrap();
        kv.put("other", b"x".to_vec(), None).await.unwrap();
        kv.put("p/1", b"b".to_vec(), None).await.unwrap();
        kv.delete("p/1").await.unwrap();

        let e1 = stream.next().await.unwrap();
        let e2 = stream.next().await.unwrap();
        let e3 = stream.next().await.unwrap();
        assert_eq!(e1.kind, EventKind::Put);
        assert_eq!(e2.value, Some(b"b".to_vec()));
        assert_eq!(e3.kind, EventKind::Delete);
        assert!(e1.revision < e2.revision && e2.revision < e3.revision);
        assert_eq!(e3.value, None);
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let kv = MemoryKv::new();
        kv.put("p/1", b"a".to_vec(), None).await.unwrap();
        let r2 = kv.put("p/2", b"b".to_vec(), None).await.unwrap();

        let mut stream = kv.watch("p/", Some(r2)).await.unwrap();
        let replayed = stream.next().await.unwrap();
        assert_eq!(replayed.key, "p/2");

        kv.compact();
        assert!(matches!(
            kv.watch("p/", Some(r2)).await,
            Err(KvError::Compacted(_))
        ));
    }

    #[tokio::test]
    async fn test_close_watchers_ends_streams() {
        let kv = MemoryKv::new();
        let mut stream = kv.watch("p/", None).await.unwrap();
        kv.close_watchers();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_bound_keys() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        kv.put("nodes/n1", b"n".to_vec(), Some(lease)).await.unwrap();
        let mut stream = kv.watch("nodes/", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        kv.keep_alive(lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(kv.get("nodes/n1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(kv.get("nodes/n1").await.unwrap().is_none());
        assert!(kv.keep_alive(lease).await.unwrap_err().is_lease_not_found());

        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, "nodes/n1");
    }

    #[tokio::test]
    async fn test_revoke_lease() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        kv.put("nodes/n1", b"n".to_vec(), Some(lease)).await.unwrap();

        kv.revoke_lease(lease).await.unwrap();
        assert!(kv.get("nodes/n1").await.unwrap().is_none());
        assert!(kv.revoke_lease(lease).await.is_err());
        assert!(kv.put("nodes/n2", b"n".to_vec(), Some(lease)).await.is_err());
    }
}
