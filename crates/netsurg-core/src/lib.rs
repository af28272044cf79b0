pub mod error;
pub mod graph;
pub mod id;
pub mod node;
pub mod ops;

// Re-export commonly used types
pub use error::CoreError;
pub use graph::{Inbound, ModelGraph};
pub use id::{NodeId, OpId, TensorRef};
pub use node::{NodeInstance, TensorEdge};
pub use ops::{ActivationFn, ConvOptions, DataFormat, OpKind, Operation, Padding};
