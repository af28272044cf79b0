//! In-memory implementation of [`ModelStore`].
//!
//! [`InMemoryStore`] keeps decomposed models in a HashMap with the same
//! semantics as the SQLite backend. Loading always recomposes, so a loaded
//! graph never shares operations with the graph that was saved.

use std::collections::HashMap;

use netsurg_core::graph::ModelGraph;
use netsurg_core::id::OpId;
use netsurg_core::ops::Operation;

use crate::convert::{decompose, recompose, DecomposedModel};
use crate::error::StorageError;
use crate::traits::ModelStore;
use crate::types::{ModelId, ModelSummary};

#[derive(Debug, Clone)]
struct StoredModel {
    name: String,
    decomposed: DecomposedModel,
}

/// In-memory implementation of [`ModelStore`].
#[derive(Debug)]
pub struct InMemoryStore {
    models: HashMap<ModelId, StoredModel>,
    next_model_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            models: HashMap::new(),
            next_model_id: 1,
        }
    }

    fn get_stored(&self, id: ModelId) -> Result<&StoredModel, StorageError> {
        self.models
            .get(&id)
            .ok_or(StorageError::ModelNotFound(id.0))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelStore for InMemoryStore {
    fn create_model(&mut self, name: &str) -> Result<ModelId, StorageError> {
        let id = ModelId(self.next_model_id);
        self.next_model_id += 1;
        self.models.insert(
            id,
            StoredModel {
                name: name.to_string(),
                decomposed: DecomposedModel::default(),
            },
        );
        Ok(id)
    }

    fn save_model(&mut self, id: ModelId, graph: &ModelGraph) -> Result<(), StorageError> {
        let stored = self
            .models
            .get_mut(&id)
            .ok_or(StorageError::ModelNotFound(id.0))?;
        stored.decomposed = decompose(graph);
        Ok(())
    }

    fn load_model(&self, id: ModelId) -> Result<ModelGraph, StorageError> {
        recompose(self.get_stored(id)?.decomposed.clone())
    }

    fn delete_model(&mut self, id: ModelId) -> Result<(), StorageError> {
        self.models
            .remove(&id)
            .ok_or(StorageError::ModelNotFound(id.0))?;
        Ok(())
    }

    fn list_models(&self) -> Result<Vec<ModelSummary>, StorageError> {
        let mut summaries: Vec<ModelSummary> = self
            .models
            .iter()
            .map(|(&id, stored)| ModelSummary {
                id,
                name: stored.name.clone(),
            })
            .collect();
        summaries.sort_by_key(|s| s.id.0);
        Ok(summaries)
    }

    fn get_operation(&self, id: ModelId, op: OpId) -> Result<Operation, StorageError> {
        self.get_stored(id)?
            .decomposed
            .operations
            .iter()
            .find(|(op_id, _)| *op_id == op)
            .map(|(_, operation)| operation.clone())
            .ok_or(StorageError::OperationNotFound {
                model: id.0,
                op: op.0,
            })
    }
}
