//! Storage for netsurg model graphs.
//!
//! Provides the [`ModelStore`] trait defining the storage contract, plus the
//! [`InMemoryStore`] and [`SqliteStore`] backends.
//!
//! Graphs are saved whole. An edit never mutates a stored graph; it produces
//! a new one that can be saved under the same or a fresh [`ModelId`].
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`types`]: ModelId, ModelSummary storage-layer types
//! - [`traits`]: ModelStore trait definition
//! - [`convert`]: ModelGraph decompose/recompose and weight encoding
//! - [`hash`]: blake3 content hashes for operations and models
//! - [`memory`]: InMemoryStore implementation
//! - [`schema`]: SQL migrations and connection setup
//! - [`sqlite`]: SqliteStore implementation

pub mod convert;
pub mod error;
pub mod hash;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use error::StorageError;
pub use hash::{hash_model, hash_operation, hash_weights};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::ModelStore;
pub use types::{ModelId, ModelSummary};
