//! Boolean delete masks over an operation's output.
//!
//! A [`DeleteMask`] is shaped like one node instance's output (batch dimension
//! excluded). `false` marks an element whose channel is being removed.

use std::collections::BTreeSet;

use ndarray::{Array1, ArrayD, Axis, IxDyn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteMask(ArrayD<bool>);

impl DeleteMask {
    /// A mask of `shape` that deletes nothing.
    pub fn keep_all(shape: &[usize]) -> Self {
        DeleteMask(ArrayD::from_elem(IxDyn(shape), true))
    }

    /// A mask of `shape` deleting `channels` along `axis`.
    ///
    /// Returns `None` if `axis` is not a dimension of `shape` or a channel
    /// index is not below its length.
    pub fn for_channels(shape: &[usize], axis: usize, channels: &BTreeSet<usize>) -> Option<Self> {
        let len = *shape.get(axis)?;
        if channels.last().is_some_and(|&c| c >= len) {
            return None;
        }
        let mut mask = ArrayD::from_elem(IxDyn(shape), true);
        for &c in channels {
            mask.index_axis_mut(Axis(axis), c).fill(false);
        }
        Some(DeleteMask(mask))
    }

    pub fn from_array(mask: ArrayD<bool>) -> Self {
        DeleteMask(mask)
    }

    pub fn as_array(&self) -> &ArrayD<bool> {
        &self.0
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn ndim(&self) -> usize {
        self.0.ndim()
    }

    /// Returns `true` when no element is marked for deletion.
    pub fn deletes_nothing(&self) -> bool {
        self.0.iter().all(|keep| *keep)
    }

    /// Number of elements kept.
    pub fn kept_count(&self) -> usize {
        self.0.iter().filter(|keep| **keep).count()
    }

    /// The mask flattened to 1-D in row-major order.
    pub fn flattened(&self) -> DeleteMask {
        DeleteMask(Array1::from_iter(self.0.iter().copied()).into_dyn())
    }

    /// Flat indices of kept elements, in row-major order.
    pub fn kept_indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect()
    }
}
