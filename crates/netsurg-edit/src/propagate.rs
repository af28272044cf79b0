//! Delete-mask propagation through a single operation.
//!
//! When channels are removed from an operation's output, every consumer must
//! drop the matching slices of its own weights. [`propagate`] computes the
//! replacement for one consumer given the masks on its inbound tensors, and
//! the mask to hand on to its own consumers.
//!
//! | Kind                    | Weights                                   | Outbound mask      |
//! |-------------------------|-------------------------------------------|--------------------|
//! | `Dense`                 | kernel rows of deleted inputs removed     | none               |
//! | `Conv2D`                | kernel input channels removed (axis 2)    | none               |
//! | `Flatten`               | unchanged                                 | inbound, flattened |
//! | everything else         | rejected                                  |                    |
//!
//! A mask that deletes nothing is treated exactly like an absent one.

use std::sync::Arc;

use ndarray::{s, Axis, Ix3};
use tracing::trace;

use netsurg_core::ops::{DataFormat, OpKind, Operation};

use crate::error::EditError;
use crate::mask::DeleteMask;

/// Computes the replacement for `op` and its outbound mask.
///
/// `inbound` holds one entry per inbound tensor, in port order. When no entry
/// deletes anything the original allocation is returned unchanged, so shared
/// operations stay shared in the rebuilt graph.
pub fn propagate(
    op: &Arc<Operation>,
    inbound: &[Option<&DeleteMask>],
) -> Result<(Arc<Operation>, Option<DeleteMask>), EditError> {
    let active: Vec<&DeleteMask> = inbound
        .iter()
        .flatten()
        .copied()
        .filter(|m| !m.deletes_nothing())
        .collect();
    let Some(&mask) = active.first() else {
        return Ok((Arc::clone(op), None));
    };

    match &op.kind {
        OpKind::Dense { .. } | OpKind::Conv2D { .. } | OpKind::Flatten if active.len() > 1 => {
            Err(EditError::ShapeMismatch {
                op: op.name.clone(),
                reason: format!("{} inbound masks delete channels, expected one", active.len()),
            })
        }
        OpKind::Dense { .. } => {
            let trimmed = trim_dense(op, mask)?;
            trace!(op = %op.name, kept = mask.kept_count(), "trimmed dense inputs");
            Ok((Arc::new(trimmed), None))
        }
        OpKind::Conv2D { .. } => {
            let trimmed = trim_conv2d(op, mask)?;
            trace!(op = %op.name, "trimmed convolution input channels");
            Ok((Arc::new(trimmed), None))
        }
        OpKind::Flatten => Ok((Arc::clone(op), Some(mask.flattened()))),
        OpKind::Input { .. } | OpKind::MaxPool2D { .. } | OpKind::Activation { .. } | OpKind::Add => {
            Err(EditError::UnsupportedOperationKind {
                kind: op.kind_name(),
                op: op.name.clone(),
            })
        }
    }
}

/// Removes the kernel rows whose input units are deleted. The bias runs over
/// output units and is kept as is.
fn trim_dense(op: &Operation, mask: &DeleteMask) -> Result<Operation, EditError> {
    let kernel = op.kernel().ok_or_else(|| missing_kernel(op))?;
    if mask.ndim() != 1 || mask.shape()[0] != kernel.shape()[0] {
        return Err(EditError::ShapeMismatch {
            op: op.name.clone(),
            reason: format!(
                "mask of shape {:?} cannot select rows of a {:?} kernel",
                mask.shape(),
                kernel.shape()
            ),
        });
    }

    let kept = mask.kept_indices();
    let mut weights = op.weights.clone();
    weights[0] = kernel.select(Axis(0), &kept);

    let mut kind = op.kind.clone();
    if let OpKind::Dense { input_units, .. } = &mut kind {
        *input_units = kept.len();
    }
    Ok(Operation::from_parts(op.name.clone(), kind, weights)?)
}

/// Removes kernel input channels whose feature maps are deleted.
///
/// The mask is brought to `[height, width, channels]` and cropped to the
/// kernel window; each channel must then be kept or deleted as a whole.
fn trim_conv2d(op: &Operation, mask: &DeleteMask) -> Result<Operation, EditError> {
    let OpKind::Conv2D {
        kernel_size,
        data_format,
        ..
    } = &op.kind
    else {
        return Err(missing_kernel(op));
    };
    let kernel = op.kernel().ok_or_else(|| missing_kernel(op))?;

    let view = mask
        .as_array()
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| EditError::ShapeMismatch {
            op: op.name.clone(),
            reason: format!("expected a rank-3 mask, got shape {:?}", mask.shape()),
        })?;
    let hwc = match data_format {
        DataFormat::ChannelsLast => view,
        DataFormat::ChannelsFirst => view.permuted_axes([1, 2, 0]),
    };
    let (h, w, channels) = hwc.dim();
    if channels != kernel.shape()[2] {
        return Err(EditError::ShapeMismatch {
            op: op.name.clone(),
            reason: format!(
                "mask has {} channels, kernel expects {}",
                channels,
                kernel.shape()[2]
            ),
        });
    }

    let window = hwc.slice(s![..kernel_size[0].min(h), ..kernel_size[1].min(w), ..]);
    let mut kept = Vec::with_capacity(channels);
    for c in 0..channels {
        let lane = window.index_axis(Axis(2), c);
        let keep_all = lane.iter().all(|k| *k);
        let drop_all = lane.iter().all(|k| !*k);
        match (keep_all, drop_all) {
            (true, _) => kept.push(c),
            (false, true) => {}
            (false, false) => {
                return Err(EditError::IrregularMask {
                    op: op.name.clone(),
                    reason: format!("input channel {} is only partially deleted", c),
                })
            }
        }
    }

    let mut weights = op.weights.clone();
    weights[0] = kernel.select(Axis(2), &kept);
    Ok(Operation::from_parts(op.name.clone(), op.kind.clone(), weights)?)
}

fn missing_kernel(op: &Operation) -> EditError {
    EditError::ShapeMismatch {
        op: op.name.clone(),
        reason: "operation has no kernel".to_string(),
    }
}
