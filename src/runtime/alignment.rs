//! Alignment hooks
//!
//! Translate between the orchestrator's generic keyed payloads and each
//! node's own request/response schema. Shapers are plain functions picked by
//! capability tag (or overridden per node name) and resolved once when the
//! orchestrator is assembled.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::graph::{Capability, GraphError, NodeDescriptor, RuntimeGraph};
use crate::runtime::context::{ExecutionContext, Payload};

#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("Node '{node}' requires field '{field}' from upstream")]
    MissingField { node: String, field: String },

    #[error("Node '{node}' payload could not be shaped: {reason}")]
    Malformed { node: String, reason: String },

    #[error("Topology change failed: {0}")]
    Graph(#[from] GraphError),
}

/// What an input-shaper can see
pub struct InputShape<'a> {
    pub node: &'a NodeDescriptor,
    pub graph: &'a RuntimeGraph,
    pub ctx: &'a ExecutionContext,
    /// Handoff key this node waited on, if any; its value sits in the inputs
    pub rendezvous: Option<&'a str>,
}

/// What an output-shaper can see and change
pub struct OutputShape<'a> {
    pub node: &'a NodeDescriptor,
    pub graph: &'a mut RuntimeGraph,
    pub ctx: &'a ExecutionContext,
    /// Inputs gathered for the node, before input shaping
    pub inputs: &'a Payload,
    /// The request the node was invoked with
    pub request: &'a Value,
}

/// Gathered inputs -> node-specific request
pub type InputShaper = fn(Payload, &InputShape<'_>) -> Result<Value, AlignmentError>;

/// Raw (or drained) response -> value stored in the result map.
/// May rewire `OutputShape::graph`.
pub type OutputShaper = fn(Value, &mut OutputShape<'_>) -> Result<Value, AlignmentError>;

/// Re-frames one chunk of a passthrough stream; `None` drops the chunk
pub type StreamShaper = fn(&NodeDescriptor, String) -> Option<String>;

#[derive(Clone, Copy)]
pub struct ShaperPair {
    pub input: InputShaper,
    pub output: OutputShaper,
}

impl ShaperPair {
    pub const PASSTHROUGH: ShaperPair = ShaperPair {
        input: passthrough_inputs,
        output: passthrough_outputs,
    };

    pub fn new(input: InputShaper, output: OutputShaper) -> Self {
        Self { input, output }
    }
}

impl std::fmt::Debug for ShaperPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShaperPair")
    }
}

pub fn passthrough_inputs(inputs: Payload, _cx: &InputShape<'_>) -> Result<Value, AlignmentError> {
    Ok(Value::Object(inputs))
}

pub fn passthrough_outputs(raw: Value, _cx: &mut OutputShape<'_>) -> Result<Value, AlignmentError> {
    Ok(raw)
}

pub fn passthrough_stream(_node: &NodeDescriptor, chunk: String) -> Option<String> {
    Some(chunk)
}

/// Shapers bound to one node after resolution
#[derive(Debug, Clone)]
pub struct ResolvedAlignment {
    pub shapers: ShaperPair,
    pub rendezvous: Option<String>,
}

/// Pipeline-specific dispatch table, installed once per orchestrator
#[derive(Clone, Debug)]
pub struct AlignmentTable {
    by_capability: HashMap<Capability, ShaperPair>,
    by_node: HashMap<String, ShaperPair>,
    rendezvous: HashMap<String, String>,
    stream: StreamShaper,
}

impl Default for AlignmentTable {
    fn default() -> Self {
        Self {
            by_capability: HashMap::new(),
            by_node: HashMap::new(),
            rendezvous: HashMap::new(),
            stream: passthrough_stream,
        }
    }
}

impl AlignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_capability(mut self, capability: Capability, pair: ShaperPair) -> Self {
        self.by_capability.insert(capability, pair);
        self
    }

    /// Per-node override; wins over the capability entry
    pub fn on_node(mut self, node: impl Into<String>, pair: ShaperPair) -> Self {
        self.by_node.insert(node.into(), pair);
        self
    }

    /// Make `node` wait for the request-scoped handoff `key` before shaping
    pub fn rendezvous(mut self, node: impl Into<String>, key: impl Into<String>) -> Self {
        self.rendezvous.insert(node.into(), key.into());
        self
    }

    pub fn stream_shaper(mut self, shaper: StreamShaper) -> Self {
        self.stream = shaper;
        self
    }

    pub fn stream(&self) -> StreamShaper {
        self.stream
    }

    pub fn resolve(&self, node: &NodeDescriptor) -> ResolvedAlignment {
        let shapers = self
            .by_node
            .get(&node.name)
            .or_else(|| self.by_capability.get(&node.capability))
            .copied()
            .unwrap_or(ShaperPair::PASSTHROUGH);

        ResolvedAlignment {
            shapers,
            rendezvous: self.rendezvous.get(&node.name).cloned(),
        }
    }
}

// ============================================================================
// SBIO: Pure helpers for shapers
// ============================================================================

/// Fetch a required field, failing loudly when an upstream node did not
/// provide it
pub fn require<'v>(
    payload: &'v Payload,
    field: &str,
    node: &NodeDescriptor,
) -> Result<&'v Value, AlignmentError> {
    payload.get(field).ok_or_else(|| AlignmentError::MissingField {
        node: node.name.clone(),
        field: field.to_string(),
    })
}

pub fn require_str<'v>(
    payload: &'v Payload,
    field: &str,
    node: &NodeDescriptor,
) -> Result<&'v str, AlignmentError> {
    require(payload, field, node)?
        .as_str()
        .ok_or_else(|| AlignmentError::Malformed {
            node: node.name.clone(),
            reason: format!("field '{}' is not a string", field),
        })
}

pub fn require_array<'v>(
    payload: &'v Payload,
    field: &str,
    node: &NodeDescriptor,
) -> Result<&'v Vec<Value>, AlignmentError> {
    require(payload, field, node)?
        .as_array()
        .ok_or_else(|| AlignmentError::Malformed {
            node: node.name.clone(),
            reason: format!("field '{}' is not an array", field),
        })
}
