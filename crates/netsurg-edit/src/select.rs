//! The channel-selection seam.
//!
//! Edits take explicit channel indices and never rank channels themselves.
//! A [`ChannelSelector`] is the caller's policy for picking them, and
//! [`prune_channels`] feeds its choice straight into
//! [`delete_channels`](crate::operations::delete_channels).

use std::collections::BTreeSet;

use tracing::debug;

use netsurg_core::graph::ModelGraph;
use netsurg_core::id::OpId;

use crate::edit::EditOptions;
use crate::error::EditError;
use crate::operations::delete_channels;

/// Picks output channels of an operation to delete.
///
/// The returned set is treated as opaque; range checks happen in
/// [`delete_channels`].
pub trait ChannelSelector {
    fn select_channels(&self, graph: &ModelGraph, op: OpId) -> Result<BTreeSet<usize>, EditError>;
}

impl<F> ChannelSelector for F
where
    F: Fn(&ModelGraph, OpId) -> Result<BTreeSet<usize>, EditError>,
{
    fn select_channels(&self, graph: &ModelGraph, op: OpId) -> Result<BTreeSet<usize>, EditError> {
        self(graph, op)
    }
}

/// A fixed selection, whatever the graph.
impl ChannelSelector for BTreeSet<usize> {
    fn select_channels(&self, _: &ModelGraph, _: OpId) -> Result<BTreeSet<usize>, EditError> {
        Ok(self.clone())
    }
}

/// Deletes the channels `selector` picks from `target`.
///
/// A selection that covers every channel of `target` is rejected with
/// [`EditError::InvalidSelector`]; at least one channel must survive.
pub fn prune_channels(
    graph: &ModelGraph,
    target: OpId,
    selector: &impl ChannelSelector,
    options: &EditOptions,
) -> Result<ModelGraph, EditError> {
    let op = graph
        .operation(target)
        .ok_or(EditError::OperationNotFound { id: target })?;
    let count = op.channel_count().ok_or_else(|| EditError::MissingChannelDimension {
        op: op.name.clone(),
    })?;

    let selected = selector.select_channels(graph, target)?;
    if count > 0 && (0..count).all(|c| selected.contains(&c)) {
        return Err(EditError::InvalidSelector {
            reason: format!("selection removes all {count} channels of '{}'", op.name),
        });
    }
    debug!(op = %op.name, selected = selected.len(), of = count, "channel selection");

    let channels: Vec<usize> = selected.into_iter().collect();
    delete_channels(graph, target, &channels, options)
}
