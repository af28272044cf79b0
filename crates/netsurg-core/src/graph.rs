//! ModelGraph: the DAG of node instances that makes up a model.
//!
//! [`ModelGraph`] is the single entry point for constructing and querying
//! models. It owns:
//! - a petgraph `StableGraph<NodeInstance, TensorEdge>` holding every
//!   application of an operation and the tensors flowing between them,
//! - an insertion-ordered table of [`Operation`]s keyed by [`OpId`], each
//!   behind an `Arc` so that graphs derived from one another can share
//!   unchanged operations cheaply,
//! - the ordered lists of declared input and output tensors.
//!
//! # Sharing and isolation
//!
//! `Clone` shares operation storage between the two graphs; mutation through
//! [`ModelGraph::operation_mut`] is copy-on-write, so neither graph observes
//! the other's changes. [`ModelGraph::deep_copy`] additionally guarantees that
//! no operation allocation is shared at all.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{Dfs, EdgeRef, Reversed};
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::id::{NodeId, OpId, TensorRef};
use crate::node::{NodeInstance, TensorEdge};
use crate::ops::Operation;

/// Ordered inbound tensors of a node instance. Almost every kind has one.
pub type Inbound = SmallVec<[TensorRef; 2]>;

/// A model as a DAG of operation applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGraph {
    nodes: StableGraph<NodeInstance, TensorEdge, Directed, u32>,
    operations: IndexMap<OpId, Arc<Operation>>,
    inputs: Vec<TensorRef>,
    outputs: Vec<TensorRef>,
    next_op_id: u32,
}

impl Default for ModelGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelGraph {
    /// Creates an empty graph with no inputs or outputs.
    pub fn new() -> Self {
        ModelGraph {
            nodes: StableGraph::new(),
            operations: IndexMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            next_op_id: 0,
        }
    }

    /// Constructs a `ModelGraph` from all its component parts.
    ///
    /// Used by the storage layer to reconstruct a graph from loaded data. Call
    /// [`validate`](Self::validate) afterwards to check the invariants.
    pub fn from_parts(
        nodes: StableGraph<NodeInstance, TensorEdge, Directed, u32>,
        operations: IndexMap<OpId, Arc<Operation>>,
        inputs: Vec<TensorRef>,
        outputs: Vec<TensorRef>,
        next_op_id: u32,
    ) -> Self {
        ModelGraph {
            nodes,
            operations,
            inputs,
            outputs,
            next_op_id,
        }
    }

    /// Chains `operations` one after another behind a single input, keeping
    /// every operation's weights.
    pub fn sequential(
        input: Operation,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Result<Self, CoreError> {
        let mut graph = ModelGraph::new();
        let mut current = graph.add_input(input)?;
        for op in operations {
            let id = graph.add_operation(op);
            current = graph.apply(id, &[current])?;
        }
        graph.set_outputs(vec![current])?;
        Ok(graph)
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    /// Returns a read-only reference to the node-instance graph.
    pub fn nodes(&self) -> &StableGraph<NodeInstance, TensorEdge, Directed, u32> {
        &self.nodes
    }

    /// Returns the operation table in insertion order.
    pub fn operations(&self) -> &IndexMap<OpId, Arc<Operation>> {
        &self.operations
    }

    /// Declared input tensors, in order.
    pub fn inputs(&self) -> &[TensorRef] {
        &self.inputs
    }

    /// Declared output tensors, in order.
    pub fn outputs(&self) -> &[TensorRef] {
        &self.outputs
    }

    /// Returns the next operation ID counter value.
    pub fn next_op_id(&self) -> u32 {
        self.next_op_id
    }

    /// Looks up an operation by ID.
    pub fn operation(&self, id: OpId) -> Option<&Operation> {
        self.operations.get(&id).map(Arc::as_ref)
    }

    /// Looks up the shared handle of an operation by ID.
    pub fn operation_arc(&self, id: OpId) -> Option<&Arc<Operation>> {
        self.operations.get(&id)
    }

    /// Mutable access to an operation. Copy-on-write: any other graph sharing
    /// this operation keeps its own unmodified value.
    pub fn operation_mut(&mut self, id: OpId) -> Option<&mut Operation> {
        self.operations.get_mut(&id).map(Arc::make_mut)
    }

    /// Returns the ID of the first operation named `name`.
    pub fn find_operation(&self, name: &str) -> Option<OpId> {
        self.operations
            .iter()
            .find(|(_, op)| op.name == name)
            .map(|(&id, _)| id)
    }

    /// Returns `true` if `id` names an operation of this graph.
    pub fn contains_operation(&self, id: OpId) -> bool {
        self.operations.contains_key(&id)
    }

    /// Looks up a node instance by ID.
    pub fn node(&self, id: NodeId) -> Option<&NodeInstance> {
        self.nodes.node_weight(id.into())
    }

    /// Returns the operation applied at node instance `id`.
    pub fn node_operation(&self, id: NodeId) -> Option<&Arc<Operation>> {
        self.node(id).and_then(|n| self.operations.get(&n.op))
    }

    /// Human-readable label `name#call_index` for diagnostics.
    pub fn describe(&self, id: NodeId) -> String {
        match (self.node(id), self.node_operation(id)) {
            (Some(node), Some(op)) => format!("{}#{}", op.name, node.call_index),
            _ => format!("<missing node {}>", id),
        }
    }

    /// Output shape of the tensor `t`, batch dimension excluded.
    pub fn tensor_shape(&self, t: TensorRef) -> Option<&[usize]> {
        self.node(t.node).map(|n| n.output_shape.as_slice())
    }

    /// Ordered inbound tensors of node instance `id`.
    pub fn inbound(&self, id: NodeId) -> Inbound {
        let mut edges: SmallVec<[(u16, TensorRef); 2]> = self
            .nodes
            .edges_directed(id.into(), Direction::Incoming)
            .map(|e| {
                (
                    e.weight().target_port,
                    TensorRef {
                        node: NodeId::from(e.source()),
                        slot: e.weight().source_slot,
                    },
                )
            })
            .collect();
        edges.sort_by_key(|(port, _)| *port);
        edges.into_iter().map(|(_, t)| t).collect()
    }

    /// Node instances consuming any output of `id`, without duplicates.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.nodes
            .neighbors_directed(id.into(), Direction::Outgoing)
            .map(NodeId::from)
            .filter(|n| seen.insert(*n))
            .collect()
    }

    /// All node instances applying `op`, ordered by call index.
    pub fn instances_of(&self, op: OpId) -> Vec<NodeId> {
        let mut found: Vec<(u32, NodeId)> = self
            .nodes
            .node_indices()
            .filter_map(|idx| {
                let node = &self.nodes[idx];
                (node.op == op).then(|| (node.call_index, NodeId::from(idx)))
            })
            .collect();
        found.sort();
        found.into_iter().map(|(_, id)| id).collect()
    }

    /// Position of `t` among the declared inputs.
    pub fn input_position(&self, t: TensorRef) -> Option<usize> {
        self.inputs.iter().position(|i| *i == t)
    }

    /// Returns `true` if node instance `id` produces a declared output.
    pub fn is_output_node(&self, id: NodeId) -> bool {
        self.outputs.iter().any(|t| t.node == id)
    }

    /// Returns the number of node instances.
    pub fn node_count(&self) -> usize {
        self.nodes.node_count()
    }

    /// Returns the number of tensor edges.
    pub fn edge_count(&self) -> usize {
        self.nodes.edge_count()
    }

    /// Returns the number of operations.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Registers an operation without applying it. Returns its new [`OpId`].
    pub fn add_operation(&mut self, op: impl Into<Arc<Operation>>) -> OpId {
        let id = OpId(self.next_op_id);
        self.next_op_id += 1;
        self.operations.insert(id, op.into());
        id
    }

    /// Registers an `Input` operation and declares its output a graph input.
    pub fn add_input(&mut self, op: Operation) -> Result<TensorRef, CoreError> {
        if !op.is_input() {
            return Err(CoreError::InvalidApplication {
                op: op.name,
                reason: "only Input operations can be declared graph inputs".to_string(),
            });
        }
        let id = self.add_operation(op);
        self.add_input_instance(id)
    }

    /// Places a registered `Input` operation and declares its output a graph
    /// input.
    pub fn add_input_instance(&mut self, op: OpId) -> Result<TensorRef, CoreError> {
        let operation = self
            .operations
            .get(&op)
            .ok_or(CoreError::OperationNotFound { id: op })?;
        if !operation.is_input() {
            return Err(CoreError::InvalidApplication {
                op: operation.name.clone(),
                reason: "only Input operations can be declared graph inputs".to_string(),
            });
        }
        let shape = operation.output_shape(&[])?;
        let call_index = self.next_call_index(op);
        let idx = self.nodes.add_node(NodeInstance::new(op, call_index, shape));
        let t = TensorRef::output_of(NodeId::from(idx));
        self.inputs.push(t);
        Ok(t)
    }

    /// Applies operation `op` to `inputs`, adding one node instance.
    ///
    /// The output shape is inferred from the input shapes; incompatible shapes
    /// or arity fail without modifying the graph.
    pub fn apply(&mut self, op: OpId, inputs: &[TensorRef]) -> Result<TensorRef, CoreError> {
        let operation = self
            .operations
            .get(&op)
            .ok_or(CoreError::OperationNotFound { id: op })?;
        if operation.is_input() {
            return Err(CoreError::InvalidApplication {
                op: operation.name.clone(),
                reason: "Input operations are placed with add_input".to_string(),
            });
        }

        // The input shapes borrow the node graph, which is mutated below.
        let output_shape = {
            let mut shapes: SmallVec<[&[usize]; 2]> = SmallVec::new();
            for t in inputs {
                let node = self
                    .nodes
                    .node_weight(t.node.into())
                    .ok_or(CoreError::NodeNotFound { id: t.node })?;
                if t.slot != 0 {
                    return Err(CoreError::InvalidApplication {
                        op: operation.name.clone(),
                        reason: format!("node {} has no output slot {}", t.node, t.slot),
                    });
                }
                shapes.push(node.output_shape.as_slice());
            }
            operation.output_shape(&shapes)?
        };

        let call_index = self.next_call_index(op);
        let idx = self
            .nodes
            .add_node(NodeInstance::new(op, call_index, output_shape));
        for (port, t) in inputs.iter().enumerate() {
            self.nodes.add_edge(
                t.node.into(),
                idx,
                TensorEdge {
                    source_slot: t.slot,
                    target_port: port as u16,
                },
            );
        }
        Ok(TensorRef::output_of(NodeId::from(idx)))
    }

    /// Declares the graph outputs. Every tensor must belong to this graph.
    pub fn set_outputs(&mut self, outputs: Vec<TensorRef>) -> Result<(), CoreError> {
        for t in &outputs {
            if self.node(t.node).is_none() {
                return Err(CoreError::NodeNotFound { id: t.node });
            }
        }
        self.outputs = outputs;
        Ok(())
    }

    fn next_call_index(&self, op: OpId) -> u32 {
        self.nodes
            .node_weights()
            .filter(|n| n.op == op)
            .map(|n| n.call_index + 1)
            .max()
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Whole-graph transformations
    // -----------------------------------------------------------------------

    /// Returns a copy sharing no operation allocation with `self`.
    ///
    /// Node and operation IDs are preserved, so references resolved against
    /// `self` stay valid against the copy.
    pub fn deep_copy(&self) -> ModelGraph {
        let mut copy = self.clone();
        for op in copy.operations.values_mut() {
            *op = Arc::new(op.as_ref().clone());
        }
        copy
    }

    /// Returns `true` if any operation allocation is shared with `other`.
    pub fn shares_operations_with(&self, other: &ModelGraph) -> bool {
        let mine: HashSet<*const Operation> =
            self.operations.values().map(Arc::as_ptr).collect();
        other
            .operations
            .values()
            .any(|op| mine.contains(&Arc::as_ptr(op)))
    }

    /// Removes node instances that cannot reach a declared output, then drops
    /// operations left without any application. Declared inputs are kept.
    ///
    /// Returns the number of node instances removed.
    pub fn retain_reachable(&mut self) -> usize {
        let mut keep: HashSet<NodeIndex<u32>> =
            self.inputs.iter().map(|t| t.node.into()).collect();
        let reversed = Reversed(&self.nodes);
        let mut dfs = Dfs::empty(reversed);
        for t in &self.outputs {
            dfs.move_to(t.node.into());
            while let Some(idx) = dfs.next(reversed) {
                keep.insert(idx);
            }
        }

        let doomed: Vec<NodeIndex<u32>> = self
            .nodes
            .node_indices()
            .filter(|idx| !keep.contains(idx))
            .collect();
        for idx in &doomed {
            self.nodes.remove_node(*idx);
        }

        let used: HashSet<OpId> = self.nodes.node_weights().map(|n| n.op).collect();
        self.operations.retain(|id, _| used.contains(id));
        doomed.len()
    }

    /// Checks the structural invariants of the graph:
    /// - every node applies a known operation,
    /// - inbound ports of each node are exactly `0..n`,
    /// - every node without inbound edges is a declared input,
    /// - declared inputs are `Input` instances and outputs exist,
    /// - the graph is acyclic.
    pub fn validate(&self) -> Result<(), CoreError> {
        for idx in self.nodes.node_indices() {
            let id = NodeId::from(idx);
            let node = &self.nodes[idx];
            if !self.operations.contains_key(&node.op) {
                return Err(CoreError::OperationNotFound { id: node.op });
            }

            let mut ports: Vec<u16> = self
                .nodes
                .edges_directed(idx, Direction::Incoming)
                .map(|e| e.weight().target_port)
                .collect();
            ports.sort_unstable();
            if ports.iter().enumerate().any(|(i, p)| *p as usize != i) {
                return Err(CoreError::GraphInconsistency {
                    reason: format!("node {} has non-contiguous inbound ports {:?}", id, ports),
                });
            }
            if ports.is_empty() && !self.inputs.iter().any(|t| t.node == id) {
                return Err(CoreError::GraphInconsistency {
                    reason: format!(
                        "node {} ({}) has no inbound tensors and is not a declared input",
                        id,
                        self.describe(id)
                    ),
                });
            }
        }

        for t in &self.inputs {
            match self.node_operation(t.node) {
                Some(op) if op.is_input() => {}
                Some(op) => {
                    return Err(CoreError::GraphInconsistency {
                        reason: format!("declared input {} applies non-Input '{}'", t, op.name),
                    })
                }
                None => return Err(CoreError::NodeNotFound { id: t.node }),
            }
        }
        for t in &self.outputs {
            if self.node(t.node).is_none() {
                return Err(CoreError::NodeNotFound { id: t.node });
            }
        }

        toposort(&self.nodes, None).map_err(|cycle| CoreError::Cycle {
            node: NodeId::from(cycle.node_id()),
        })?;
        Ok(())
    }
}
