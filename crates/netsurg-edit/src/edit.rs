//! The generic edit driver shared by every graph edit.
//!
//! [`apply_edit`] locates the node instances of one target operation, lets a
//! caller-supplied callback decide what each instance becomes, and rebuilds
//! the rest of the graph around the result. The source graph is never
//! modified; on error nothing is returned but the error.

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use netsurg_core::graph::{Inbound, ModelGraph};
use netsurg_core::id::{NodeId, OpId, TensorRef};
use netsurg_core::ops::Operation;

use crate::depth::{node_depths, order_by_depth};
use crate::error::EditError;
use crate::mask::DeleteMask;
use crate::rebuild::{Rebuilder, Rebuilt, Substitutions};

/// Which instances of the target to edit, and whether the result may share
/// operations with the source graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditOptions {
    /// Node instances to edit. `None` edits every instance of the target.
    pub nodes: Option<Vec<NodeId>>,
    /// Work on a deep copy and deep-copy the result, so that the edited graph
    /// shares no operation with the source.
    pub isolate: bool,
}

impl Default for EditOptions {
    fn default() -> Self {
        EditOptions {
            nodes: None,
            isolate: true,
        }
    }
}

impl EditOptions {
    /// Edit only the given node instances.
    pub fn at_nodes(nodes: impl Into<Vec<NodeId>>) -> Self {
        EditOptions {
            nodes: Some(nodes.into()),
            ..Default::default()
        }
    }

    /// Let unchanged operations be shared between source and result.
    pub fn shared(mut self) -> Self {
        self.isolate = false;
        self
    }
}

/// One node instance being edited, as seen by an edit callback.
#[derive(Debug)]
pub struct EditSite<'a> {
    /// The target operation.
    pub op_id: OpId,
    pub operation: &'a Arc<Operation>,
    /// The instance in the graph being rebuilt.
    pub node: NodeId,
    /// The instance's inbound tensors in the graph being rebuilt.
    pub inbound: Inbound,
    /// The same tensors resolved into the new graph, with their masks.
    pub inputs: Vec<Rebuilt>,
}

impl EditSite<'_> {
    /// Tensors of the new graph feeding this instance, in port order.
    pub fn input_tensors(&self) -> Vec<TensorRef> {
        self.inputs.iter().map(|r| r.tensor).collect()
    }
}

/// Resolves the node instances an edit applies to.
///
/// With no selector every instance of `target` is returned in application
/// order. A selector must name instances of `target` only.
pub fn resolve_targets(
    graph: &ModelGraph,
    target: OpId,
    nodes: Option<&[NodeId]>,
) -> Result<Vec<NodeId>, EditError> {
    let instances = graph.instances_of(target);
    if !graph.contains_operation(target) || instances.is_empty() {
        return Err(EditError::OperationNotFound { id: target });
    }
    match nodes {
        None => Ok(instances),
        Some(selected) => {
            let mut resolved = Vec::with_capacity(selected.len());
            for &node in selected {
                if !instances.contains(&node) {
                    return Err(EditError::NodeNotInstance { node, op: target });
                }
                if !resolved.contains(&node) {
                    resolved.push(node);
                }
            }
            Ok(resolved)
        }
    }
}

/// Applies an edit to the instances of `target` and returns the rebuilt graph.
///
/// For each selected instance, deepest first, the instance's inbound tensors
/// are rebuilt, then `edit` returns substitutions for tensors of the source
/// graph. Substitutions accumulate across instances. Finally the graph
/// outputs are rebuilt against all of them.
///
/// `input_masks`, when given, seeds one optional delete mask per declared
/// graph input.
pub fn apply_edit<F>(
    graph: &ModelGraph,
    target: OpId,
    options: &EditOptions,
    input_masks: Option<Vec<Option<DeleteMask>>>,
    mut edit: F,
) -> Result<ModelGraph, EditError>
where
    F: FnMut(&mut Rebuilder<'_>, &EditSite<'_>) -> Result<Substitutions, EditError>,
{
    resolve_targets(graph, target, options.nodes.as_deref())?;

    let working: Cow<'_, ModelGraph> = if options.isolate {
        Cow::Owned(graph.deep_copy())
    } else {
        Cow::Borrowed(graph)
    };
    let working: &ModelGraph = &working;

    // Identifiers survive the deep copy, so resolving again against the
    // working graph selects the same instances.
    let selected = resolve_targets(working, target, options.nodes.as_deref())?;
    let depths = node_depths(working)?;
    let ordered = order_by_depth(&selected, &depths);
    let operation = working
        .operation_arc(target)
        .ok_or(EditError::OperationNotFound { id: target })?;

    info!(
        op = %operation.name,
        instances = ordered.len(),
        isolate = options.isolate,
        "applying graph edit"
    );

    let mut rebuilder = Rebuilder::new(working, input_masks)?;
    let mut subs = Substitutions::new();
    for node in ordered {
        let inbound = working.inbound(node);
        let inputs = rebuilder.rebuild(&inbound, &subs)?;
        let site = EditSite {
            op_id: target,
            operation,
            node,
            inbound,
            inputs,
        };
        let produced = edit(&mut rebuilder, &site)?;
        debug!(
            node = %working.describe(node),
            substitutions = produced.len(),
            "edited node instance"
        );
        subs.extend(produced);
    }

    let outputs = rebuilder.rebuild(working.outputs(), &subs)?;
    let rebuilt = rebuilder.finish(outputs.into_iter().map(|r| r.tensor).collect())?;
    debug!(
        nodes = rebuilt.node_count(),
        operations = rebuilt.operation_count(),
        "graph rebuilt"
    );

    Ok(if options.isolate {
        rebuilt.deep_copy()
    } else {
        rebuilt
    })
}
