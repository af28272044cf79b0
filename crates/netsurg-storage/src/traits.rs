//! The [`ModelStore`] trait defining the storage contract for model graphs.
//!
//! Every backend stores whole graphs: an edit always produces a new graph,
//! so there is no partial update to persist.

use netsurg_core::graph::ModelGraph;
use netsurg_core::id::OpId;
use netsurg_core::ops::Operation;

use crate::error::StorageError;
use crate::types::{ModelId, ModelSummary};

/// The storage contract for model graphs.
///
/// The trait is synchronous; backends are used from one thread at a time.
pub trait ModelStore {
    /// Creates a new empty model with the given name.
    fn create_model(&mut self, name: &str) -> Result<ModelId, StorageError>;

    /// Saves `graph` under `id`, replacing whatever was stored before.
    fn save_model(&mut self, id: ModelId, graph: &ModelGraph) -> Result<(), StorageError>;

    /// Loads a complete model graph.
    ///
    /// The loaded graph shares no operation with any graph in memory.
    fn load_model(&self, id: ModelId) -> Result<ModelGraph, StorageError>;

    /// Deletes a model and all its associated data.
    fn delete_model(&mut self, id: ModelId) -> Result<(), StorageError>;

    /// Lists all stored models, ordered by ID.
    fn list_models(&self) -> Result<Vec<ModelSummary>, StorageError>;

    /// Loads a single operation with its weights.
    fn get_operation(&self, id: ModelId, op: OpId) -> Result<Operation, StorageError>;
}
