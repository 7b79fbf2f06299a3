//! Node controller
//!
//! Keeps the node cache that feeds the pickers. Liveness is decided by the
//! store's leases, so there is nothing to reconcile beyond logging joins and
//! departures.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use conduit_core::domain::Node;
use tracing::info;

use crate::controller::Reconciler;

#[derive(Debug, Default)]
pub struct NodeReconciler;

impl NodeReconciler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Reconciler for NodeReconciler {
    type Object = Node;

    fn name(&self) -> &'static str {
        "node"
    }

    fn on_update(&self, old: &Node, new: &Node) -> bool {
        if old.address != new.address || old.version != new.version {
            info!(
                "Node {} re-registered ({} {} -> {} {})",
                new.instance_name, old.address, old.version, new.address, new.version
            );
        }
        false
    }

    async fn sync(&self, key: &str, obj: Arc<Node>) -> Result<()> {
        info!(
            "Node {} joined ({}, version {})",
            key, obj.address, obj.version
        );
        Ok(())
    }

    async fn on_missing(&self, key: &str) -> Result<()> {
        info!("Node {} left", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::NodeType;

    #[test]
    fn test_updates_are_not_queued() {
        let reconciler = NodeReconciler::new();
        let old = Node::new("conduit", "n1", NodeType::Node, 10);
        let new = old.clone().with_address("10.0.0.2:7000");
        assert!(!reconciler.on_update(&old, &new));
        assert!(reconciler.wants(&new));
    }
}
