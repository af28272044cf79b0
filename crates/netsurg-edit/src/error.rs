//! Error types for graph edits.
//!
//! Every variant aborts the whole edit: no partially rebuilt graph is ever
//! returned, and the input graph is never modified.

use netsurg_core::error::CoreError;
use netsurg_core::id::{NodeId, OpId};
use thiserror::Error;

/// Errors produced while editing a model graph.
#[derive(Debug, Error)]
pub enum EditError {
    /// The target operation has no application in the graph.
    #[error("operation not found in graph: OpId({id})", id = id.0)]
    OperationNotFound { id: OpId },

    /// An explicit node selector named a node that does not apply the target.
    #[error("node {node} is not an application of operation {op}")]
    NodeNotInstance { node: NodeId, op: OpId },

    /// Insert or delete-operation on a node instance with several inputs.
    #[error("node '{label}' has {inbound} inbound tensors; only single-input nodes can be edited this way")]
    MultiInputUnsupported {
        node: NodeId,
        label: String,
        inbound: usize,
    },

    /// Insert or delete-operation on a node instance with no input at all.
    #[error("node '{label}' has no inbound tensor")]
    NoInboundTensor { node: NodeId, label: String },

    /// Reconstruction reached a node with no inputs that is neither a graph
    /// input nor substituted.
    #[error("dangling operation at node '{label}': no inbound tensors and not a graph input")]
    DanglingOperation { node: NodeId, label: String },

    /// A deleting mask reached a kind without a mask rule.
    #[error("'{kind}' operations cannot absorb a channel deletion (operation '{op}')")]
    UnsupportedOperationKind { kind: &'static str, op: String },

    /// A requested channel index is not below the channel count.
    #[error("channel index {index} out of range: operation '{op}' has {count} channels")]
    ChannelIndexOutOfRange {
        op: String,
        index: usize,
        count: usize,
    },

    /// The operation has neither a unit count nor a filter count.
    #[error("operation '{op}' has neither a unit count nor a filter count")]
    MissingChannelDimension { op: String },

    /// A mask does not remove whole input channels of a convolution window.
    #[error("delete mask for '{op}' does not select whole channels: {reason}")]
    IrregularMask { op: String, reason: String },

    /// A mask's shape disagrees with the weights it is applied to.
    #[error("shape mismatch in '{op}': {reason}")]
    ShapeMismatch { op: String, reason: String },

    /// A channel selector returned an unusable selection.
    #[error("invalid channel selection: {reason}")]
    InvalidSelector { reason: String },

    /// The graph model rejected a construction step.
    #[error(transparent)]
    Core(#[from] CoreError),
}
