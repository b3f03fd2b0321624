//! Pipeline topology: node descriptors, the static template graph, and the
//! per-request runtime graph.

pub mod dag;
pub mod node;

pub use dag::{GraphError, NodeId, OrchestrationGraph, RuntimeGraph};
pub use node::{Address, Capability, NodeDescriptor, NodeRole};
