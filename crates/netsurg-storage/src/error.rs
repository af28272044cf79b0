//! Storage error types for netsurg-storage.
//!
//! [`StorageError`] covers the failure modes of the storage layer:
//! serialization, database access, missing models, and reconstruction of a
//! graph from stored rows.

use netsurg_core::error::CoreError;
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The SQLite backend reported an error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// A model with the given ID was not found.
    #[error("model not found: {0}")]
    ModelNotFound(i64),

    /// An operation was not found in the given model.
    #[error("operation not found: model={model}, op={op}")]
    OperationNotFound { model: i64, op: u32 },

    /// Stored rows describe an invalid graph.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Failed to rebuild a ModelGraph from stored data.
    #[error("reconstruction error: {reason}")]
    ReconstructionError { reason: String },
}
