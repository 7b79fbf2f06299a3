//! Node selection
//!
//! Two independent pickers exist per scheduler: one choosing the scheduler
//! instance that owns a pipeline, one choosing the execution node a step runs
//! on. Both draw from the live node set mirrored by the node informer.

use std::sync::{Arc, Mutex};

use conduit_core::domain::{Node, NodeType};
use conduit_core::{Error, Result};
use conduit_informer::{IndexFunc, Indexer};

/// Index of nodes by [`NodeType`]
pub const NODE_TYPE_INDEX: &str = "node_type";

/// Chooses a node for a schedulable unit
pub trait Picker: Send + Sync {
    /// Returns the next node, or [`Error::Schedule`] if none is available
    fn pick(&self) -> Result<Node>;
}

/// Live nodes of one type, read from the node cache
#[derive(Clone)]
pub struct NodeSet {
    indexer: Arc<Indexer<Node>>,
    node_type: NodeType,
}

impl NodeSet {
    /// Creates a view over `indexer`, registering the type index on it
    pub fn new(indexer: Arc<Indexer<Node>>, node_type: NodeType) -> Self {
        let by_type: IndexFunc<Node> = Arc::new(|n: &Node| vec![n.node_type.to_string()]);
        indexer.add_indexers(vec![(NODE_TYPE_INDEX, by_type)]);
        Self { indexer, node_type }
    }

    /// Current nodes, ordered by key
    pub fn nodes(&self) -> Vec<Node> {
        self.indexer
            .by_index(NODE_TYPE_INDEX, self.node_type.as_str())
            .map(|nodes| nodes.iter().map(|n| n.as_ref().clone()).collect())
            .unwrap_or_default()
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }
}

/// Round-robin over the current node set
///
/// Health and capacity are not considered.
pub struct RoundRobin {
    nodes: NodeSet,
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new(nodes: NodeSet) -> Self {
        Self {
            nodes,
            cursor: Mutex::new(0),
        }
    }
}

impl Picker for RoundRobin {
    fn pick(&self) -> Result<Node> {
        let nodes = self.nodes.nodes();
        if nodes.is_empty() {
            return Err(Error::Schedule(format!(
                "no available nodes of type {}",
                self.nodes.node_type()
            )));
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let idx = *cursor % nodes.len();
        *cursor = (idx + 1) % nodes.len();

        Ok(nodes[idx].clone())
    }
}
