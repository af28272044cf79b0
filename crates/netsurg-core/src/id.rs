//! Stable ID newtypes for graph entities.
//!
//! [`NodeId`] and [`OpId`] are distinct newtype wrappers over `u32`, so a node
//! instance can never be looked up where an operation is expected.
//! [`TensorRef`] names one output slot of one node instance and is the unit of
//! substitution and memoization during graph surgery.
//!
//! All three are scoped to the [`ModelGraph`](crate::graph::ModelGraph) that
//! issued them.

use std::fmt;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

/// Stable node-instance identifier. Maps to a petgraph `NodeIndex<u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Stable operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u32);

/// Handle to the output of node instance `node` at output slot `slot`.
///
/// Equality is by (node identity, slot). Handles from different graphs must
/// not be compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TensorRef {
    pub node: NodeId,
    pub slot: u16,
}

impl TensorRef {
    /// Handle to the first (usually only) output of `node`.
    pub fn output_of(node: NodeId) -> Self {
        TensorRef { node, slot: 0 }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node.0, self.slot)
    }
}

// Bridge between NodeId and petgraph's NodeIndex<u32>.

impl From<NodeIndex<u32>> for NodeId {
    fn from(idx: NodeIndex<u32>) -> Self {
        NodeId(idx.index() as u32)
    }
}

impl From<NodeId> for NodeIndex<u32> {
    fn from(id: NodeId) -> Self {
        NodeIndex::new(id.0 as usize)
    }
}
