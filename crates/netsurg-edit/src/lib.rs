//! Structural edits on model graphs.
//!
//! Every edit takes a [`ModelGraph`](netsurg_core::graph::ModelGraph) and
//! returns a new one. Deleting channels from an operation also trims the
//! weights of the operations that consume them, so the edited graph stays
//! shape-consistent.

pub mod depth;
pub mod edit;
pub mod error;
pub mod mask;
pub mod operations;
pub mod propagate;
pub mod rebuild;
pub mod select;

pub use edit::{apply_edit, resolve_targets, EditOptions, EditSite};
pub use error::EditError;
pub use mask::DeleteMask;
pub use operations::{delete_channels, delete_operation, insert, replace};
pub use rebuild::{Rebuilder, Rebuilt, Substitutions};
pub use select::{prune_channels, ChannelSelector};
