//! Reconstruction of a graph around substituted tensors.
//!
//! A [`Rebuilder`] walks a source graph backwards from the tensors it is
//! asked for and re-applies every operation it meets into a fresh
//! [`ModelGraph`]. Tensors of the source graph are resolved, in order, from:
//!
//! 1. the caller's substitutions,
//! 2. the nodes already rebuilt in this pass,
//! 3. the declared graph inputs.
//!
//! Anything else is rebuilt from its own inbound tensors, after passing the
//! inbound delete masks through [`propagate`]. Each source node instance is
//! rebuilt at most once per pass, so a node consumed by several successors
//! maps to one node in the result.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use tracing::{debug, trace};

use netsurg_core::error::CoreError;
use netsurg_core::graph::ModelGraph;
use netsurg_core::id::{NodeId, OpId, TensorRef};
use netsurg_core::ops::Operation;

use crate::error::EditError;
use crate::mask::DeleteMask;
use crate::propagate::propagate;

/// A tensor of the graph under construction with its pending delete mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Rebuilt {
    pub tensor: TensorRef,
    pub mask: Option<DeleteMask>,
}

impl Rebuilt {
    pub fn new(tensor: TensorRef, mask: Option<DeleteMask>) -> Self {
        Rebuilt { tensor, mask }
    }
}

/// Source-graph tensors mapped to their replacements in the new graph.
pub type Substitutions = HashMap<TensorRef, Rebuilt>;

/// One reconstruction pass from a source graph into a new graph.
pub struct Rebuilder<'g> {
    source: &'g ModelGraph,
    target: ModelGraph,
    inputs: HashMap<TensorRef, Rebuilt>,
    finished: HashMap<NodeId, Rebuilt>,
    interned: HashMap<*const Operation, OpId>,
    applied: usize,
}

impl<'g> Rebuilder<'g> {
    /// Starts a pass over `source`, recreating its declared inputs.
    ///
    /// `input_masks`, when given, holds one optional mask per declared input
    /// in declaration order.
    pub fn new(
        source: &'g ModelGraph,
        input_masks: Option<Vec<Option<DeleteMask>>>,
    ) -> Result<Self, EditError> {
        toposort(source.nodes(), None).map_err(|cycle| CoreError::Cycle {
            node: NodeId::from(cycle.node_id()),
        })?;

        let masks = input_masks.unwrap_or_default();
        if !masks.is_empty() && masks.len() != source.inputs().len() {
            return Err(EditError::ShapeMismatch {
                op: "<inputs>".to_string(),
                reason: format!(
                    "{} input masks given for {} graph inputs",
                    masks.len(),
                    source.inputs().len()
                ),
            });
        }

        let mut rebuilder = Rebuilder {
            source,
            target: ModelGraph::new(),
            inputs: HashMap::new(),
            finished: HashMap::new(),
            interned: HashMap::new(),
            applied: 0,
        };
        let mut masks = masks.into_iter();
        for &t in source.inputs() {
            let op = source
                .node_operation(t.node)
                .ok_or(CoreError::NodeNotFound { id: t.node })?;
            let id = rebuilder.intern(op);
            let placed = rebuilder.target.add_input_instance(id)?;
            let mask = masks.next().flatten();
            rebuilder.inputs.insert(t, Rebuilt::new(placed, mask));
        }
        Ok(rebuilder)
    }

    /// The graph being rebuilt.
    pub fn source(&self) -> &'g ModelGraph {
        self.source
    }

    /// The graph under construction.
    pub fn graph(&self) -> &ModelGraph {
        &self.target
    }

    /// Number of operation applications performed while resolving tensors.
    ///
    /// Applications made through [`Rebuilder::apply`] are not counted.
    pub fn applied_count(&self) -> usize {
        self.applied
    }

    /// Returns `true` if source node `node` has been rebuilt in this pass.
    pub fn is_finished(&self, node: NodeId) -> bool {
        self.finished.contains_key(&node)
    }

    /// Applies `op` to tensors of the graph under construction.
    ///
    /// Passing the same allocation twice applies one shared operation.
    pub fn apply(&mut self, op: &Arc<Operation>, inputs: &[TensorRef]) -> Result<TensorRef, EditError> {
        let id = self.intern(op);
        Ok(self.target.apply(id, inputs)?)
    }

    /// Resolves each source tensor in `frontier` to the new graph.
    pub fn rebuild(
        &mut self,
        frontier: &[TensorRef],
        subs: &Substitutions,
    ) -> Result<Vec<Rebuilt>, EditError> {
        frontier.iter().map(|t| self.rebuild_one(*t, subs)).collect()
    }

    /// Declares `outputs` and drops whatever cannot reach them.
    pub fn finish(mut self, outputs: Vec<TensorRef>) -> Result<ModelGraph, EditError> {
        self.target.set_outputs(outputs)?;
        let removed = self.target.retain_reachable();
        if removed > 0 {
            debug!(removed, "dropped unreachable node instances");
        }
        self.target.validate()?;
        Ok(self.target)
    }

    fn intern(&mut self, op: &Arc<Operation>) -> OpId {
        *self
            .interned
            .entry(Arc::as_ptr(op))
            .or_insert_with(|| self.target.add_operation(Arc::clone(op)))
    }

    fn lookup(&self, t: TensorRef, subs: &Substitutions) -> Option<Rebuilt> {
        if let Some(r) = subs.get(&t) {
            debug!(tensor = %t, new = %r.tensor, "using substitution");
            return Some(r.clone());
        }
        if let Some(r) = self.finished.get(&t.node) {
            trace!(tensor = %t, "already rebuilt");
            return Some(Rebuilt::new(
                TensorRef {
                    node: r.tensor.node,
                    slot: t.slot,
                },
                r.mask.clone(),
            ));
        }
        let input = self.inputs.get(&t).cloned();
        if input.is_some() {
            trace!(tensor = %t, "graph input");
        }
        input
    }

    /// Post-order walk with an explicit stack: a node is rebuilt once all of
    /// its inbound tensors resolve.
    fn rebuild_one(&mut self, root: TensorRef, subs: &Substitutions) -> Result<Rebuilt, EditError> {
        if let Some(r) = self.lookup(root, subs) {
            return Ok(r);
        }

        let mut stack = vec![root.node];
        while let Some(&node) = stack.last() {
            if self.finished.contains_key(&node) {
                stack.pop();
                continue;
            }
            let inbound = self.source.inbound(node);
            if inbound.is_empty() {
                return Err(EditError::DanglingOperation {
                    node,
                    label: self.source.describe(node),
                });
            }

            let mut resolved = Vec::with_capacity(inbound.len());
            let mut pending = false;
            for &t in &inbound {
                match self.lookup(t, subs) {
                    Some(r) => resolved.push(r),
                    None => {
                        stack.push(t.node);
                        pending = true;
                    }
                }
            }
            if pending {
                continue;
            }
            stack.pop();
            self.finish_node(node, resolved)?;
        }

        self.lookup(root, subs).ok_or_else(|| {
            CoreError::GraphInconsistency {
                reason: format!("tensor {} did not resolve", root),
            }
            .into()
        })
    }

    fn finish_node(&mut self, node: NodeId, resolved: Vec<Rebuilt>) -> Result<(), EditError> {
        let op = self
            .source
            .node_operation(node)
            .ok_or(CoreError::NodeNotFound { id: node })?;
        let masks: Vec<Option<&DeleteMask>> = resolved.iter().map(|r| r.mask.as_ref()).collect();
        let (op, mask) = propagate(op, &masks)?;
        let tensors: Vec<TensorRef> = resolved.iter().map(|r| r.tensor).collect();
        let out = self.apply(&op, &tensors)?;
        self.applied += 1;
        debug!(node = %self.source.describe(node), new = %out, "rebuilt node instance");
        self.finished.insert(node, Rebuilt::new(out, mask));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use netsurg_core::ops::ActivationFn;

    use super::*;

    fn dense(name: &str, rows: usize, cols: usize) -> Operation {
        Operation::dense(name, Array2::ones((rows, cols)), None, ActivationFn::Linear).unwrap()
    }

    /// x -> trunk -> {head_a, head_b}, both heads are outputs.
    fn two_heads() -> ModelGraph {
        let mut graph = ModelGraph::new();
        let x = graph.add_input(Operation::input("x", vec![4])).unwrap();
        let trunk = graph.add_operation(dense("trunk", 4, 3));
        let head_a = graph.add_operation(dense("head_a", 3, 2));
        let head_b = graph.add_operation(dense("head_b", 3, 1));
        let t = graph.apply(trunk, &[x]).unwrap();
        let a = graph.apply(head_a, &[t]).unwrap();
        let b = graph.apply(head_b, &[t]).unwrap();
        graph.set_outputs(vec![a, b]).unwrap();
        graph
    }

    #[test]
    fn shared_predecessor_is_rebuilt_once() {
        let graph = two_heads();
        let mut rebuilder = Rebuilder::new(&graph, None).unwrap();
        let outputs = rebuilder.rebuild(graph.outputs(), &Substitutions::new()).unwrap();
        assert_eq!(rebuilder.applied_count(), 3);

        let new_graph = rebuilder.graph();
        let a_in = new_graph.inbound(outputs[0].tensor.node);
        let b_in = new_graph.inbound(outputs[1].tensor.node);
        assert_eq!(a_in, b_in);

        let rebuilt = rebuilder
            .finish(outputs.iter().map(|r| r.tensor).collect())
            .unwrap();
        assert_eq!(rebuilt.node_count(), 4);
        assert_eq!(rebuilt.operation_count(), 4);
    }

    #[test]
    fn unchanged_operations_are_shared_with_source() {
        let graph = two_heads();
        let mut rebuilder = Rebuilder::new(&graph, None).unwrap();
        let outputs = rebuilder.rebuild(graph.outputs(), &Substitutions::new()).unwrap();
        let rebuilt = rebuilder
            .finish(outputs.into_iter().map(|r| r.tensor).collect())
            .unwrap();
        assert!(rebuilt.shares_operations_with(&graph));
    }

    #[test]
    fn substitution_takes_precedence() {
        let graph = two_heads();
        let trunk_node = graph.instances_of(graph.find_operation("trunk").unwrap())[0];
        let x = graph.inputs()[0];

        let mut rebuilder = Rebuilder::new(&graph, None).unwrap();
        let new_x = rebuilder.rebuild(&[x], &Substitutions::new()).unwrap()[0].clone();
        let alt = Arc::new(dense("alt", 4, 3));
        let alt_out = rebuilder.apply(&alt, &[new_x.tensor]).unwrap();
        let subs = Substitutions::from([(TensorRef::output_of(trunk_node), Rebuilt::new(alt_out, None))]);
        let outputs = rebuilder.rebuild(graph.outputs(), &subs).unwrap();
        assert_eq!(rebuilder.applied_count(), 2);
        assert!(!rebuilder.is_finished(trunk_node));

        let head_inbound = rebuilder.graph().inbound(outputs[0].tensor.node);
        assert_eq!(head_inbound[0], alt_out);
    }

    #[test]
    fn dangling_node_is_reported() {
        let mut graph = two_heads();
        // A second Input application that was never declared a graph input.
        let x_op = graph.node(graph.inputs()[0].node).unwrap().op;
        let stray = graph.add_input_instance(x_op).unwrap();
        let declared = vec![graph.inputs()[0]];
        let outputs = graph.outputs().to_vec();
        let trunk = graph.find_operation("trunk").unwrap();
        let extra = graph.apply(trunk, &[stray]).unwrap();
        let graph = ModelGraph::from_parts(
            graph.nodes().clone(),
            graph.operations().clone(),
            declared,
            [outputs, vec![extra]].concat(),
            graph.next_op_id(),
        );

        let mut rebuilder = Rebuilder::new(&graph, None).unwrap();
        let err = rebuilder
            .rebuild(graph.outputs(), &Substitutions::new())
            .unwrap_err();
        assert!(matches!(err, EditError::DanglingOperation { node, .. } if node == stray.node));
    }

    #[test]
    fn keep_all_input_masks_change_nothing() {
        let graph = two_heads();
        let mask = DeleteMask::keep_all(&[4]);
        let mut rebuilder = Rebuilder::new(&graph, Some(vec![Some(mask)])).unwrap();
        let outputs = rebuilder.rebuild(graph.outputs(), &Substitutions::new()).unwrap();
        assert!(outputs.iter().all(|r| r.mask.is_none()));
        let rebuilt = rebuilder
            .finish(outputs.into_iter().map(|r| r.tensor).collect())
            .unwrap();
        let trunk = rebuilt.find_operation("trunk").unwrap();
        assert!(Arc::ptr_eq(
            rebuilt.operation_arc(trunk).unwrap(),
            graph.operation_arc(graph.find_operation("trunk").unwrap()).unwrap()
        ));
    }

    #[test]
    fn input_mask_count_must_match() {
        let graph = two_heads();
        let err = Rebuilder::new(&graph, Some(vec![None, None])).err().unwrap();
        assert!(matches!(err, EditError::ShapeMismatch { .. }));
    }
}
