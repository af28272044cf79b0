//! The four graph edits: insert, replace, delete-operation and
//! delete-channels.
//!
//! Each is a thin callback over [`apply_edit`]. All of them return a new
//! graph and leave the source untouched.

use std::collections::BTreeSet;
use std::sync::Arc;

use ndarray::Axis;
use tracing::info;

use netsurg_core::error::CoreError;
use netsurg_core::graph::ModelGraph;
use netsurg_core::id::{OpId, TensorRef};
use netsurg_core::ops::{OpKind, Operation};

use crate::edit::{apply_edit, resolve_targets, EditOptions, EditSite};
use crate::error::EditError;
use crate::mask::DeleteMask;
use crate::rebuild::{Rebuilt, Substitutions};

/// Inserts `new_op` between the target and its single inbound tensor.
///
/// Every selected instance gets its own application of one shared `new_op`.
pub fn insert(
    graph: &ModelGraph,
    target: OpId,
    new_op: Operation,
    options: &EditOptions,
) -> Result<ModelGraph, EditError> {
    check_single_input(graph, target, options)?;
    let new_op = Arc::new(new_op);
    apply_edit(graph, target, options, None, |rebuilder, site| {
        let input = single_input(rebuilder.source(), site)?;
        let out = rebuilder.apply(&new_op, &[input.tensor])?;
        Ok(Substitutions::from([(site.inbound[0], Rebuilt::new(out, None))]))
    })
}

/// Replaces the target with `new_op`, applied to the same inputs.
pub fn replace(
    graph: &ModelGraph,
    target: OpId,
    new_op: Operation,
    options: &EditOptions,
) -> Result<ModelGraph, EditError> {
    let new_op = Arc::new(new_op);
    apply_edit(graph, target, options, None, |rebuilder, site| {
        let out = rebuilder.apply(&new_op, &site.input_tensors())?;
        Ok(Substitutions::from([(
            TensorRef::output_of(site.node),
            Rebuilt::new(out, None),
        )]))
    })
}

/// Removes the target, wiring its single inbound tensor to its consumers.
pub fn delete_operation(
    graph: &ModelGraph,
    target: OpId,
    options: &EditOptions,
) -> Result<ModelGraph, EditError> {
    check_single_input(graph, target, options)?;
    apply_edit(graph, target, options, None, |rebuilder, site| {
        let input = single_input(rebuilder.source(), site)?;
        Ok(Substitutions::from([(
            TensorRef::output_of(site.node),
            Rebuilt::new(input.tensor, None),
        )]))
    })
}

/// Removes output channels from the target and trims every downstream
/// operation that consumes them.
///
/// Channels are units for `Dense` and filters for `Conv2D`. Duplicate
/// indices are ignored.
pub fn delete_channels(
    graph: &ModelGraph,
    target: OpId,
    channels: &[usize],
    options: &EditOptions,
) -> Result<ModelGraph, EditError> {
    let op = graph
        .operation(target)
        .ok_or(EditError::OperationNotFound { id: target })?;
    let channels: BTreeSet<usize> = channels.iter().copied().collect();
    let trimmed = Arc::new(delete_channel_weights(op, &channels)?);
    info!(op = %op.name, channels = ?channels, "deleting channels");

    let input_masks = graph
        .inputs()
        .iter()
        .map(|t| graph.tensor_shape(*t).map(DeleteMask::keep_all))
        .collect();

    apply_edit(graph, target, options, Some(input_masks), |rebuilder, site| {
        let shape = rebuilder
            .source()
            .tensor_shape(TensorRef::output_of(site.node))
            .ok_or(CoreError::NodeNotFound { id: site.node })?;
        let mask = make_delete_mask(site.operation, shape, &channels)?;
        let out = rebuilder.apply(&trimmed, &site.input_tensors())?;
        Ok(Substitutions::from([(
            TensorRef::output_of(site.node),
            Rebuilt::new(out, Some(mask)),
        )]))
    })
}

/// Returns a copy of `op` without the given output channels.
///
/// Every weight tensor loses the channels along its last axis, and the unit
/// or filter count shrinks to match.
pub fn delete_channel_weights(
    op: &Operation,
    channels: &BTreeSet<usize>,
) -> Result<Operation, EditError> {
    let count = op.channel_count().ok_or_else(|| EditError::MissingChannelDimension {
        op: op.name.clone(),
    })?;
    if let Some(&index) = channels.iter().find(|&&c| c >= count) {
        return Err(EditError::ChannelIndexOutOfRange {
            op: op.name.clone(),
            index,
            count,
        });
    }

    let kept: Vec<usize> = (0..count).filter(|c| !channels.contains(c)).collect();
    let weights = op
        .weights
        .iter()
        .map(|w| w.select(Axis(w.ndim() - 1), &kept))
        .collect();

    let mut kind = op.kind.clone();
    match &mut kind {
        OpKind::Dense { units, .. } => *units = kept.len(),
        OpKind::Conv2D { filters, .. } => *filters = kept.len(),
        _ => {
            return Err(EditError::MissingChannelDimension {
                op: op.name.clone(),
            })
        }
    }
    Ok(Operation::from_parts(op.name.clone(), kind, weights)?)
}

/// Builds the delete mask for one instance of `op` whose output has
/// `output_shape`.
pub fn make_delete_mask(
    op: &Operation,
    output_shape: &[usize],
    channels: &BTreeSet<usize>,
) -> Result<DeleteMask, EditError> {
    let axis = op.channel_axis(output_shape.len());
    DeleteMask::for_channels(output_shape, axis, channels).ok_or_else(|| {
        EditError::ChannelIndexOutOfRange {
            op: op.name.clone(),
            index: channels.last().copied().unwrap_or_default(),
            count: output_shape.get(axis).copied().unwrap_or_default(),
        }
    })
}

/// Fails before any rebuilding if a selected instance has several inputs.
fn check_single_input(
    graph: &ModelGraph,
    target: OpId,
    options: &EditOptions,
) -> Result<(), EditError> {
    for node in resolve_targets(graph, target, options.nodes.as_deref())? {
        let inbound = graph.inbound(node).len();
        if inbound >= 2 {
            return Err(EditError::MultiInputUnsupported {
                node,
                label: graph.describe(node),
                inbound,
            });
        }
    }
    Ok(())
}

fn single_input<'s>(source: &ModelGraph, site: &'s EditSite<'_>) -> Result<&'s Rebuilt, EditError> {
    match site.inputs.as_slice() {
        [input] => Ok(input),
        [] => Err(EditError::NoInboundTensor {
            node: site.node,
            label: source.describe(site.node),
        }),
        inputs => Err(EditError::MultiInputUnsupported {
            node: site.node,
            label: source.describe(site.node),
            inbound: inputs.len(),
        }),
    }
}
