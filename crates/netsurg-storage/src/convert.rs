//! Decompose/recompose conversions between ModelGraph and flat storage rows.
//!
//! [`decompose`] breaks a ModelGraph into a [`DecomposedModel`] of flat
//! vectors. [`recompose`] rebuilds the graph, keeping every `NodeId` even when
//! the source `StableGraph` had index gaps from removed nodes.
//!
//! Weight tensors are encoded by [`encode_weights`] as little-endian `f32`
//! bytes so they round-trip bit-exactly.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Directed;

use netsurg_core::graph::ModelGraph;
use netsurg_core::id::{NodeId, OpId, TensorRef};
use netsurg_core::node::{NodeInstance, TensorEdge};
use netsurg_core::ops::Operation;

use crate::error::StorageError;

/// All components of a ModelGraph as flat vectors.
#[derive(Debug, Clone, Default)]
pub struct DecomposedModel {
    /// Operations in registration order.
    pub operations: Vec<(OpId, Operation)>,
    pub nodes: Vec<(NodeId, NodeInstance)>,
    /// Edges: (source, target, edge)
    pub edges: Vec<(NodeId, NodeId, TensorEdge)>,
    pub inputs: Vec<TensorRef>,
    pub outputs: Vec<TensorRef>,
    pub next_op_id: u32,
}

/// Decomposes a ModelGraph into flat vectors suitable for storage.
pub fn decompose(graph: &ModelGraph) -> DecomposedModel {
    let operations = graph
        .operations()
        .iter()
        .map(|(&id, op)| (id, op.as_ref().clone()))
        .collect();

    let nodes = graph
        .nodes()
        .node_indices()
        .filter_map(|idx| {
            graph
                .nodes()
                .node_weight(idx)
                .map(|node| (NodeId::from(idx), node.clone()))
        })
        .collect();

    let edges = graph
        .nodes()
        .edge_references()
        .map(|e| (NodeId::from(e.source()), NodeId::from(e.target()), *e.weight()))
        .collect();

    DecomposedModel {
        operations,
        nodes,
        edges,
        inputs: graph.inputs().to_vec(),
        outputs: graph.outputs().to_vec(),
        next_op_id: graph.next_op_id(),
    }
}

/// Rebuilds a ModelGraph from decomposed rows and validates it.
pub fn recompose(decomposed: DecomposedModel) -> Result<ModelGraph, StorageError> {
    let nodes = rebuild_node_graph(&decomposed.nodes, &decomposed.edges)?;
    let operations: IndexMap<OpId, Arc<Operation>> = decomposed
        .operations
        .into_iter()
        .map(|(id, op)| (id, Arc::new(op)))
        .collect();

    let graph = ModelGraph::from_parts(
        nodes,
        operations,
        decomposed.inputs,
        decomposed.outputs,
        decomposed.next_op_id,
    );
    graph.validate()?;
    Ok(graph)
}

/// Rebuilds the node-instance StableGraph, handling index gaps.
///
/// Nodes are added in index order with placeholders filling the gaps, then
/// the placeholders are removed so every stored `NodeId` maps to the same
/// `NodeIndex` as before.
fn rebuild_node_graph(
    nodes: &[(NodeId, NodeInstance)],
    edges: &[(NodeId, NodeId, TensorEdge)],
) -> Result<StableGraph<NodeInstance, TensorEdge, Directed, u32>, StorageError> {
    let mut graph = StableGraph::<NodeInstance, TensorEdge, Directed, u32>::new();
    let node_map: HashMap<u32, &NodeInstance> = nodes.iter().map(|(id, n)| (id.0, n)).collect();
    let Some(max_idx) = node_map.keys().copied().max() else {
        if !edges.is_empty() {
            return Err(StorageError::ReconstructionError {
                reason: format!("{} edges stored for a model without nodes", edges.len()),
            });
        }
        return Ok(graph);
    };

    let mut gaps = Vec::new();
    for i in 0..=max_idx {
        match node_map.get(&i) {
            Some(node) => {
                graph.add_node((*node).clone());
            }
            None => {
                graph.add_node(NodeInstance::new(OpId(u32::MAX), 0, Vec::new()));
                gaps.push(i);
            }
        }
    }

    for (source, target, edge) in edges {
        for end in [source, target] {
            if !node_map.contains_key(&end.0) {
                return Err(StorageError::ReconstructionError {
                    reason: format!("edge endpoint {} is not a stored node", end),
                });
            }
        }
        graph.add_edge((*source).into(), (*target).into(), *edge);
    }

    for i in gaps {
        graph.remove_node(NodeIndex::new(i as usize));
    }
    Ok(graph)
}

/// Encodes a weight tensor as little-endian `f32` bytes in row-major order.
pub fn encode_weights(weights: &ArrayD<f32>) -> Vec<u8> {
    weights.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Decodes a weight tensor written by [`encode_weights`].
pub fn decode_weights(bytes: &[u8], shape: &[usize]) -> Result<ArrayD<f32>, StorageError> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::ReconstructionError {
            reason: format!("weight blob of {} bytes is not a whole number of f32s", bytes.len()),
        });
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| StorageError::ReconstructionError {
        reason: format!("weight shape {:?}: {}", shape, e),
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array4};
    use netsurg_core::ops::{ActivationFn, ConvOptions};

    use super::*;

    fn model() -> ModelGraph {
        let mut graph = ModelGraph::new();
        let x = graph.add_input(Operation::input("x", vec![6, 6, 1])).unwrap();
        // Applied and then pruned, leaving a gap at node index 1.
        let relu = graph.add_operation(Operation::activation("relu", ActivationFn::Relu));
        graph.apply(relu, &[x]).unwrap();

        let conv = graph.add_operation(
            Operation::conv2d(
                "conv",
                Array4::from_shape_fn((3, 3, 1, 2), |(a, b, _, d)| (a + b + d) as f32 * 0.1),
                None,
                ConvOptions::new(),
            )
            .unwrap(),
        );
        let flatten = graph.add_operation(Operation::flatten("flatten"));
        let dense = graph.add_operation(
            Operation::dense(
                "dense",
                Array2::from_elem((32, 3), -1.5),
                None,
                ActivationFn::Softmax,
            )
            .unwrap(),
        );
        let c = graph.apply(conv, &[x]).unwrap();
        let f = graph.apply(flatten, &[c]).unwrap();
        let d = graph.apply(dense, &[f]).unwrap();
        graph.set_outputs(vec![d]).unwrap();
        assert_eq!(graph.retain_reachable(), 1);
        graph
    }

    #[test]
    fn weights_round_trip_bit_exactly() {
        let w = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.1, -0.0, f32::MIN_POSITIVE, 3.0e38])
            .unwrap();
        let bytes = encode_weights(&w);
        assert_eq!(bytes.len(), 16);
        let back = decode_weights(&bytes, &[2, 2]).unwrap();
        let bits = |a: &ArrayD<f32>| a.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back), bits(&w));
    }

    #[test]
    fn decode_rejects_bad_lengths() {
        assert!(decode_weights(&[0, 0, 0], &[1]).is_err());
        assert!(decode_weights(&[0; 8], &[3]).is_err());
    }

    #[test]
    fn recompose_preserves_ids_across_gaps() {
        let graph = model();
        let decomposed = decompose(&graph);
        assert_eq!(decomposed.nodes.len(), 4);

        let back = recompose(decomposed).unwrap();
        assert_eq!(back.node_count(), graph.node_count());
        assert_eq!(back.outputs(), graph.outputs());
        for idx in graph.nodes().node_indices() {
            let id = NodeId::from(idx);
            assert_eq!(back.node(id), graph.node(id));
            assert_eq!(back.inbound(id), graph.inbound(id));
        }
        let ids: Vec<OpId> = back.operations().keys().copied().collect();
        let expected: Vec<OpId> = graph.operations().keys().copied().collect();
        assert_eq!(ids, expected);
        assert!(!back.shares_operations_with(&graph));
    }

    #[test]
    fn dangling_edges_are_rejected() {
        let mut decomposed = decompose(&model());
        decomposed.edges.push((
            NodeId(40),
            NodeId(0),
            TensorEdge {
                source_slot: 0,
                target_port: 1,
            },
        ));
        let err = recompose(decomposed).unwrap_err();
        assert!(matches!(err, StorageError::ReconstructionError { .. }));
    }
}
