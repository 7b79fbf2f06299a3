//! Node domain model
//!
//! A node is a running Conduit process. Its record is bound to a store lease
//! and vanishes on its own when the process stops renewing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Resource;
use crate::error::{Error, Result};

/// Role of a Conduit process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// API server (external to the core, registers for visibility)
    Api,

    /// Execution node running steps
    Node,

    /// Scheduler instance running pipelines
    Scheduler,
}

impl NodeType {
    /// Lowercase name used in storage keys
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Api => "api",
            NodeType::Node => "node",
            NodeType::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api" => Ok(NodeType::Api),
            "node" => Ok(NodeType::Node),
            "scheduler" => Ok(NodeType::Scheduler),
            other => Err(Error::validation(format!("unknown node type '{}'", other))),
        }
    }
}

/// Liveness record of a Conduit process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Logical service the process belongs to
    pub service_name: String,

    /// Unique name of this process instance
    pub instance_name: String,

    /// Role of the process
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Network address other tools can reach the process at
    #[serde(default)]
    pub address: String,

    /// Lease TTL in seconds
    pub lease_ttl_secs: u64,

    /// Keep-alive interval in seconds
    pub refresh_interval_secs: u64,

    /// Build version
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub git_commit: Option<String>,

    #[serde(default)]
    pub build_time: Option<String>,

    /// When the process registered
    pub start_at: DateTime<Utc>,

    #[serde(default)]
    pub resource_version: i64,
}

impl Node {
    /// Creates a node record with a refresh interval of TTL/5
    pub fn new(
        service_name: impl Into<String>,
        instance_name: impl Into<String>,
        node_type: NodeType,
        lease_ttl_secs: u64,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_name: instance_name.into(),
            node_type,
            address: String::new(),
            lease_ttl_secs,
            refresh_interval_secs: (lease_ttl_secs / 5).max(1),
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_commit: None,
            build_time: None,
            start_at: Utc::now(),
            resource_version: 0,
        }
    }

    /// Sets the advertised address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}

impl Resource for Node {
    const COLLECTION: &'static str = "nodes";

    fn key(&self) -> String {
        format!("{}/{}", self.node_type, self.instance_name)
    }

    fn tombstone(key: &str) -> Result<Self> {
        let (node_type, instance) = key
            .split_once('/')
            .ok_or_else(|| Error::InvalidKey(key.to_string()))?;

        if instance.is_empty() || instance.contains('/') {
            return Err(Error::InvalidKey(key.to_string()));
        }

        let node_type = node_type
            .parse::<NodeType>()
            .map_err(|_| Error::InvalidKey(key.to_string()))?;

        Ok(Node::new(String::new(), instance, node_type, 0))
    }

    fn resource_version(&self) -> i64 {
        self.resource_version
    }

    fn set_resource_version(&mut self, revision: i64) {
        self.resource_version = revision;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_interval_is_fifth_of_ttl() {
        let node = Node::new("conduit", "n1", NodeType::Node, 10);
        assert_eq!(node.refresh_interval_secs, 2);

        let short = Node::new("conduit", "n1", NodeType::Node, 3);
        assert_eq!(short.refresh_interval_secs, 1);
    }

    #[test]
    fn test_node_key_round_trips_through_tombstone() {
        let node = Node::new("conduit", "sched-1", NodeType::Scheduler, 10);
        assert_eq!(node.key(), "scheduler/sched-1");

        let tombstone = Node::tombstone(&node.key()).unwrap();
        assert_eq!(tombstone.instance_name, "sched-1");
        assert_eq!(tombstone.node_type, NodeType::Scheduler);
    }

    #[test]
    fn test_tombstone_rejects_bad_keys() {
        assert!(Node::tombstone("scheduler").is_err());
        assert!(Node::tombstone("worker/n1").is_err());
        assert!(Node::tombstone("node/").is_err());
    }

    #[test]
    fn test_node_type_serializes_lowercase() {
        let json = serde_json::to_string(&NodeType::Scheduler).unwrap();
        assert_eq!(json, "\"scheduler\"");
    }
}
