//! Storage-layer types for model identity and metadata.
//!
//! [`ModelId`] lives here rather than in netsurg-core: a model only gains an
//! ID when it is persisted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a stored model.
///
/// The inner `i64` aligns with SQLite's `INTEGER PRIMARY KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId(pub i64);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelId({})", self.0)
    }
}

/// Summary of a stored model (for listing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: ModelId,
    pub name: String,
}
