//! Deterministic content hashing for operations and model graphs using blake3.
//!
//! Hashes are derived state and never stored. They make byte-identity checks
//! cheap: two operations with equal [`hash_weights`] carry bit-identical
//! weight tensors.
//!
//! # Determinism
//!
//! - Kind and configuration are serialized with `serde_json::to_vec`; `OpKind`
//!   holds no `HashMap`, so the bytes are canonical.
//! - Weights are hashed as shape followed by little-endian `f32` bytes.
//! - Nodes are visited by `NodeId` and inbound edges by port.

use netsurg_core::graph::ModelGraph;
use netsurg_core::id::{NodeId, TensorRef};
use netsurg_core::ops::Operation;

use crate::convert::encode_weights;
use crate::error::StorageError;

/// Hashes the weight tensors of an operation, shapes included.
pub fn hash_weights(op: &Operation) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(op.weights.len() as u64).to_le_bytes());
    for w in &op.weights {
        hasher.update(&(w.ndim() as u64).to_le_bytes());
        for &dim in w.shape() {
            hasher.update(&(dim as u64).to_le_bytes());
        }
        hasher.update(&encode_weights(w));
    }
    hasher.finalize()
}

/// Hashes an operation's name, kind, configuration and weights.
pub fn hash_operation(op: &Operation) -> Result<blake3::Hash, StorageError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(op.name.as_bytes());
    hasher.update(&[0]);
    hasher.update(&serde_json::to_vec(&op.kind)?);
    hasher.update(hash_weights(op).as_bytes());
    Ok(hasher.finalize())
}

/// Hashes a whole model: operations in registration order, node instances
/// by `NodeId` with their ordered inbound tensors, and the declared inputs
/// and outputs.
pub fn hash_model(graph: &ModelGraph) -> Result<blake3::Hash, StorageError> {
    let mut hasher = blake3::Hasher::new();

    for (id, op) in graph.operations() {
        hasher.update(&id.0.to_le_bytes());
        hasher.update(hash_operation(op)?.as_bytes());
    }

    let mut nodes: Vec<NodeId> = graph.nodes().node_indices().map(NodeId::from).collect();
    nodes.sort();
    for id in nodes {
        let Some(node) = graph.node(id) else {
            continue;
        };
        hasher.update(&id.0.to_le_bytes());
        hasher.update(&node.op.0.to_le_bytes());
        hasher.update(&node.call_index.to_le_bytes());
        for t in graph.inbound(id) {
            update_tensor(&mut hasher, t);
        }
        hasher.update(&[0xff]);
    }

    hasher.update(b"inputs");
    for &t in graph.inputs() {
        update_tensor(&mut hasher, t);
    }
    hasher.update(b"outputs");
    for &t in graph.outputs() {
        update_tensor(&mut hasher, t);
    }
    Ok(hasher.finalize())
}

fn update_tensor(hasher: &mut blake3::Hasher, t: TensorRef) {
    hasher.update(&t.node.0.to_le_bytes());
    hasher.update(&t.slot.to_le_bytes());
}
