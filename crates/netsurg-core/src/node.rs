//! Node instances and the tensor edges between them.
//!
//! A [`NodeInstance`] is one application of an operation inside a
//! [`ModelGraph`](crate::graph::ModelGraph). A [`TensorEdge`] connects the
//! output slot of a producer instance to an inbound port of a consumer.

use serde::{Deserialize, Serialize};

use crate::id::OpId;

/// One application of an operation within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInstance {
    /// The operation applied here.
    pub op: OpId,
    /// Which application of `op` this is, in the order they were placed.
    pub call_index: u32,
    /// Output shape of this application, batch dimension excluded.
    pub output_shape: Vec<usize>,
}

impl NodeInstance {
    pub fn new(op: OpId, call_index: u32, output_shape: Vec<usize>) -> Self {
        NodeInstance {
            op,
            call_index,
            output_shape,
        }
    }
}

/// Data dependency from a producer's output slot to a consumer's inbound port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEdge {
    /// Which output slot of the producer (0 for every current kind).
    pub source_slot: u16,
    /// Position of this tensor in the consumer's ordered inbound list.
    pub target_port: u16,
}
