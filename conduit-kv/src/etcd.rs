//! etcd store backend
//!
//! Maps the [`KvStore`] contract onto etcd v3: prefix scans and watches use
//! range options, conditional writes are single-compare transactions and
//! leases are etcd leases.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{KvError, Result};
use crate::{EventKind, KeyValue, KvStore, LeaseId, ListResponse, Revision, WatchEvent, WatchStream};

impl From<etcd_client::Error> for KvError {
    fn from(err: etcd_client::Error) -> Self {
        KvError::Backend(err.to_string())
    }
}

/// [`KvStore`] backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// Connects to the given endpoints
    ///
    /// # Arguments
    /// * `endpoints` - etcd client URLs, e.g. `["http://127.0.0.1:2379"]`
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    fn convert(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
        let key = kv
            .key_str()
            .map_err(|e| KvError::Backend(format!("non-utf8 key: {}", e)))?;

        Ok(KeyValue {
            key: key.to_string(),
            value: kv.value().to_vec(),
            create_revision: kv.create_revision(),
            mod_revision: kv.mod_revision(),
            lease: Some(kv.lease()).filter(|l| *l != 0),
        })
    }
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        resp.kvs().first().map(Self::convert).transpose()
    }

    async fn list(&self, prefix: &str) -> Result<ListResponse> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let kvs = resp
            .kvs()
            .iter()
            .map(Self::convert)
            .collect::<Result<Vec<_>>>()?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();

        Ok(ListResponse { kvs, revision })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let resp = client.put(key, value, options).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn put_if(&self, key: &str, value: Vec<u8>, expected: Revision) -> Result<Revision> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::mod_revision(key, CompareOp::Equal, expected)])
            .and_then([TxnOp::put(key, value, None)]);

        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            let actual = self
                .get(key)
                .await?
                .map(|kv| kv.mod_revision)
                .unwrap_or(0);
            return Err(KvError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut client = self.client.clone();
        let resp = client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn watch(&self, prefix: &str, start_revision: Option<Revision>) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if let Some(start) = start_revision {
            options = options.with_start_revision(start);
        }

        let (watcher, mut stream) = client.watch(prefix, Some(options)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            // Dropping the watcher cancels the subscription server-side.
            let _watcher = watcher;

            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Watch on '{}' failed: {}", prefix, e);
                        break;
                    }
                };

                if resp.compact_revision() > 0 || resp.canceled() {
                    warn!(
                        "Watch on '{}' ended (compact_revision={}, canceled={})",
                        prefix,
                        resp.compact_revision(),
                        resp.canceled()
                    );
                    break;
                }

                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };

                    let watch_event = match event.event_type() {
                        EventType::Put => WatchEvent {
                            kind: EventKind::Put,
                            key: key.to_string(),
                            value: Some(kv.value().to_vec()),
                            revision: kv.mod_revision(),
                        },
                        EventType::Delete => WatchEvent {
                            kind: EventKind::Delete,
                            key: key.to_string(),
                            value: None,
                            revision: kv.mod_revision(),
                        },
                    };

                    if tx.send(watch_event).is_err() {
                        debug!("Watch receiver for '{}' dropped", prefix);
                        return;
                    }
                }
            }
        });

        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;

        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(KvError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }
}
