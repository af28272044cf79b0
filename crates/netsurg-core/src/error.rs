//! Core error types for netsurg-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! failure modes of building and querying a model graph.

use crate::id::{NodeId, OpId};
use thiserror::Error;

/// Core errors produced by the netsurg-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A node instance was not found in the graph.
    #[error("node not found: NodeId({id})", id = id.0)]
    NodeNotFound { id: NodeId },

    /// An operation ID was not found in the graph.
    #[error("operation not found: OpId({id})", id = id.0)]
    OperationNotFound { id: OpId },

    /// An operation was applied to the wrong number of inputs.
    #[error("operation '{op}' expects {expected} input(s), got {got}")]
    ArityMismatch {
        op: String,
        expected: usize,
        got: usize,
    },

    /// Input shapes or weight shapes are incompatible with the operation.
    #[error("shape mismatch in '{op}': {reason}")]
    ShapeMismatch { op: String, reason: String },

    /// An operation cannot be placed the way it was requested.
    #[error("invalid application of '{op}': {reason}")]
    InvalidApplication { op: String, reason: String },

    /// The graph contains a cycle through the given node.
    #[error("graph contains a cycle through node {node}")]
    Cycle { node: NodeId },

    /// A structural graph invariant was violated.
    #[error("graph inconsistency: {reason}")]
    GraphInconsistency { reason: String },
}
