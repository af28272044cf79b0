//! Depth of node instances relative to the graph outputs.
//!
//! The depth of a node instance is the length, in edges, of the longest path
//! from it to any declared output; an output node has depth 0. Node instances
//! that cannot reach an output have no depth.
//!
//! Depths are only used to order edits on several instances of one
//! operation: deepest first, so instances nearer the inputs are rebuilt
//! before the instances that consume their results.

use std::collections::HashMap;

use petgraph::algo::toposort;

use netsurg_core::error::CoreError;
use netsurg_core::graph::ModelGraph;
use netsurg_core::id::NodeId;

/// Computes the depth of every node instance that reaches an output.
///
/// Each node is visited once, in reverse topological order.
pub fn node_depths(graph: &ModelGraph) -> Result<HashMap<NodeId, usize>, CoreError> {
    let order = toposort(graph.nodes(), None).map_err(|cycle| CoreError::Cycle {
        node: NodeId::from(cycle.node_id()),
    })?;

    let mut depths = HashMap::with_capacity(order.len());
    for idx in order.into_iter().rev() {
        let id = NodeId::from(idx);
        let mut depth = graph.is_output_node(id).then_some(0);
        for consumer in graph.consumers(id) {
            if let Some(d) = depths.get(&consumer) {
                depth = Some(depth.map_or(d + 1, |cur: usize| cur.max(d + 1)));
            }
        }
        if let Some(d) = depth {
            depths.insert(id, d);
        }
    }
    Ok(depths)
}

/// Depth of a single node instance, `None` if it cannot reach an output.
pub fn node_depth(graph: &ModelGraph, node: NodeId) -> Result<Option<usize>, CoreError> {
    Ok(node_depths(graph)?.get(&node).copied())
}

/// Orders `nodes` from largest depth to smallest.
///
/// Ties keep their given order; nodes without a depth go last.
pub fn order_by_depth(nodes: &[NodeId], depths: &HashMap<NodeId, usize>) -> Vec<NodeId> {
    let mut ordered = nodes.to_vec();
    ordered.sort_by_key(|n| std::cmp::Reverse(depths.get(n).map(|d| d + 1).unwrap_or(0)));
    ordered
}
