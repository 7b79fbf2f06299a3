//! Conduit KV
//!
//! The remote key-value store contract every Conduit process shares, and its
//! backends. The store is the single source of truth and the event bus:
//! writes are plain puts, reads are prefix scans or single-key gets, and
//! change notification is a prefix-scoped watch carrying a monotonic global
//! revision. Node records are bound to leases that expire without renewal.

pub mod error;
mod memory;
#[cfg(feature = "etcd")]
mod etcd;

pub use error::{KvError, Result};
pub use memory::MemoryKv;
#[cfg(feature = "etcd")]
pub use etcd::EtcdKv;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Global store revision
pub type Revision = i64;

/// Lease identifier
pub type LeaseId = i64;

/// A stored value with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// Result of a prefix scan
#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    pub kvs: Vec<KeyValue>,

    /// Store revision the scan was served at
    pub revision: Revision,
}

/// Kind of change carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change observed on a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,

    /// New value; `None` for deletes
    pub value: Option<Vec<u8>>,

    /// Revision of the change
    pub revision: Revision,
}

/// Ordered change feed for one prefix
///
/// The stream ends when the subscription is lost; callers re-list and
/// watch again.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    /// Wraps a channel receiving events in revision order
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the subscription is gone
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Remote key-value store interface
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a single key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Scans every key under a prefix
    async fn list(&self, prefix: &str) -> Result<ListResponse>;

    /// Writes a key, optionally bound to a lease
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision>;

    /// Writes a key only if its mod revision still equals `expected`
    ///
    /// An `expected` of 0 means the key must not exist. A mismatch returns
    /// [`KvError::Conflict`].
    async fn put_if(&self, key: &str, value: Vec<u8>, expected: Revision) -> Result<Revision>;

    /// Deletes a single key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes every key under a prefix, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Subscribes to changes under a prefix
    ///
    /// With a start revision, changes from that revision on are replayed
    /// first; [`KvError::Compacted`] is returned if they are gone.
    async fn watch(&self, prefix: &str, start_revision: Option<Revision>) -> Result<WatchStream>;

    /// Requests a lease that expires after `ttl` without renewal
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renews a lease; [`KvError::LeaseNotFound`] if it already expired
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revokes a lease and deletes every key bound to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}
