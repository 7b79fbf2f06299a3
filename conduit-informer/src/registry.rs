//! Node registry
//!
//! Registers this process's [`Node`] record bound to a store lease and keeps
//! the lease alive. A lapsed lease is the only way a node is considered gone,
//! so a "lease not found" on renewal is healed by registering again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_core::KeyLayout;
use conduit_core::domain::Node;
use conduit_kv::{KvStore, LeaseId};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{InformerError, Result};

/// Outcome of one keep-alive round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// The existing lease was renewed
    Renewed,

    /// The lease was gone; a new one was granted and the record rewritten
    Reregistered,
}

/// Lease-bound registration of one node
pub struct Registry {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
    node: Node,
    lease: Mutex<Option<LeaseId>>,
}

impl Registry {
    /// Creates a registry for `node`; nothing is written until [`Registry::register`]
    pub fn new(kv: Arc<dyn KvStore>, layout: KeyLayout, node: Node) -> Self {
        Self {
            kv,
            layout,
            node,
            lease: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Storage key of the node record
    pub fn key(&self) -> String {
        self.layout.storage_key(&self.node)
    }

    /// Current lease, if registered
    pub fn lease(&self) -> Option<LeaseId> {
        *self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_lease(&self, lease: Option<LeaseId>) {
        *self.lease.lock().unwrap_or_else(|e| e.into_inner()) = lease;
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.node.lease_ttl_secs.max(1))
    }

    /// Interval between keep-alive rounds
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.node.refresh_interval_secs.max(1))
    }

    /// Grants a lease and writes the node record bound to it
    pub async fn register(&self) -> Result<LeaseId> {
        let lease = self.kv.grant_lease(self.ttl()).await?;

        let value = serde_json::to_vec(&self.node).map_err(|e| InformerError::Encode {
            key: self.key(),
            source: e,
        })?;
        self.kv.put(&self.key(), value, Some(lease)).await?;
        self.set_lease(Some(lease));

        info!(
            "Registered {} with lease {} (ttl {:?})",
            self.key(),
            lease,
            self.ttl()
        );
        Ok(lease)
    }

    /// Registers, retrying with exponential backoff
    ///
    /// The store may not be reachable yet when a process boots.
    pub async fn register_with_retry(&self, max_retries: u32) -> Result<LeaseId> {
        const INITIAL_DELAY_MS: u64 = 500;
        const MAX_DELAY_MS: u64 = 30_000;

        let mut attempt = 0;
        let mut delay_ms = INITIAL_DELAY_MS;

        loop {
            attempt += 1;

            match self.register().await {
                Ok(lease) => {
                    if attempt > 1 {
                        info!("Registered after {} attempt(s)", attempt);
                    }
                    return Ok(lease);
                }
                Err(e) => {
                    if attempt >= max_retries {
                        error!("Failed to register after {} attempts", max_retries);
                        return Err(e);
                    }

                    warn!(
                        "Failed to register (attempt {}/{}): {}",
                        attempt, max_retries, e
                    );
                    time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
                }
            }
        }
    }

    /// Runs one keep-alive round
    ///
    /// If the store no longer knows the lease, exactly one re-registration
    /// is attempted before returning.
    pub async fn keep_alive_once(&self) -> Result<KeepAlive> {
        let Some(lease) = self.lease() else {
            self.register().await?;
            return Ok(KeepAlive::Reregistered);
        };

        match self.kv.keep_alive(lease).await {
            Ok(()) => {
                debug!("Renewed lease {}", lease);
                Ok(KeepAlive::Renewed)
            }
            Err(e) if e.is_lease_not_found() => {
                warn!("Lease {} not found, registering again", lease);
                self.set_lease(None);
                self.register().await?;
                Ok(KeepAlive::Reregistered)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Starts the heartbeat loop
    ///
    /// Keeps the lease alive every refresh interval until `cancel` fires,
    /// then unregisters.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.refresh_interval());
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            // The first tick completes immediately and the lease is fresh.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.keep_alive_once().await {
                            warn!("Failed to keep {} alive: {}", self.key(), e);
                        }
                    }
                }
            }

            if let Err(e) = self.unregister().await {
                warn!("Failed to unregister {}: {}", self.key(), e);
            }
        })
    }

    /// Deletes the node record and revokes its lease
    pub async fn unregister(&self) -> Result<()> {
        self.kv.delete(&self.key()).await?;

        if let Some(lease) = self.lease() {
            self.set_lease(None);
            match self.kv.revoke_lease(lease).await {
                Ok(()) => {}
                Err(e) if e.is_lease_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("Unregistered {}", self.key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_core::domain::NodeType;
    use conduit_kv::{KeyValue, KvError, ListResponse, MemoryKv, Revision, WatchStream};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Store wrapper that can fail the next keep-alive with "lease not found"
    struct FlakyKv {
        inner: Arc<MemoryKv>,
        lose_lease: AtomicBool,
        grants: AtomicUsize,
    }

    impl FlakyKv {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryKv::new(),
                lose_lease: AtomicBool::new(false),
                grants: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl KvStore for FlakyKv {
        async fn get(&self, key: &str) -> conduit_kv::Result<Option<KeyValue>> {
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> conduit_kv::Result<ListResponse> {
            self.inner.list(prefix).await
        }

        async fn put(
            &self,
            key: &str,
            value: Vec<u8>,
            lease: Option<LeaseId>,
        ) -> conduit_kv::Result<Revision> {
            self.inner.put(key, value, lease).await
        }

        async fn put_if(
            &self,
            key: &str,
            value: Vec<u8>,
            expected: Revision,
        ) -> conduit_kv::Result<Revision> {
            self.inner.put_if(key, value, expected).await
        }

        async fn delete(&self, key: &str) -> conduit_kv::Result<bool> {
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> conduit_kv::Result<u64> {
            self.inner.delete_prefix(prefix).await
        }

        async fn watch(
            &self,
            prefix: &str,
            start_revision: Option<Revision>,
        ) -> conduit_kv::Result<WatchStream> {
            self.inner.watch(prefix, start_revision).await
        }

        async fn grant_lease(&self, ttl: Duration) -> conduit_kv::Result<LeaseId> {
            self.grants.fetch_add(1, Ordering::SeqCst);
            self.inner.grant_lease(ttl).await
        }

        async fn keep_alive(&self, lease: LeaseId) -> conduit_kv::Result<()> {
            if self.lose_lease.swap(false, Ordering::SeqCst) {
                return Err(KvError::LeaseNotFound(lease));
            }
            self.inner.keep_alive(lease).await
        }

        async fn revoke_lease(&self, lease: LeaseId) -> conduit_kv::Result<()> {
            self.inner.revoke_lease(lease).await
        }
    }

    fn registry(kv: Arc<dyn KvStore>) -> Registry {
        Registry::new(
            kv,
            KeyLayout::new("acme", "conduit"),
            Node::new("conduit", "n1", NodeType::Node, 10).with_address("10.0.0.1:7000"),
        )
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let kv = MemoryKv::new();
        let registry = registry(kv.clone());

        registry.register().await.unwrap();
        let stored = kv.get("acme/conduit/nodes/node/n1").await.unwrap().unwrap();
        assert_eq!(stored.lease, registry.lease());

        registry.unregister().await.unwrap();
        assert!(kv.get("acme/conduit/nodes/node/n1").await.unwrap().is_none());
        assert!(registry.lease().is_none());
    }

    #[tokio::test]
    async fn test_lost_lease_reregisters_exactly_once() {
        let kv = FlakyKv::new();
        let registry = registry(kv.clone());

        let first = registry.register().await.unwrap();
        assert_eq!(kv.grants.load(Ordering::SeqCst), 1);

        assert_eq!(registry.keep_alive_once().await.unwrap(), KeepAlive::Renewed);
        assert_eq!(kv.grants.load(Ordering::SeqCst), 1);

        kv.lose_lease.store(true, Ordering::SeqCst);
        assert_eq!(
            registry.keep_alive_once().await.unwrap(),
            KeepAlive::Reregistered
        );
        assert_eq!(kv.grants.load(Ordering::SeqCst), 2);
        assert_ne!(registry.lease(), Some(first));

        let stored = kv.get("acme/conduit/nodes/node/n1").await.unwrap().unwrap();
        assert_eq!(stored.lease, registry.lease());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_without_heartbeat() {
        let kv = MemoryKv::new();
        let registry = registry(kv.clone());
        registry.register().await.unwrap();

        time::advance(Duration::from_secs(11)).await;
        assert!(kv.get("acme/conduit/nodes/node/n1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_record_and_unregisters_on_cancel() {
        let kv = MemoryKv::new();
        let registry = Arc::new(registry(kv.clone()));
        registry.register().await.unwrap();

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&registry).spawn(cancel.clone());

        for _ in 0..10 {
            time::sleep(Duration::from_secs(2)).await;
        }
        assert!(kv.get("acme/conduit/nodes/node/n1").await.unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap();
        assert!(kv.get("acme/conduit/nodes/node/n1").await.unwrap().is_none());
    }
}
