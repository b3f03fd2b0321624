use std::collections::HashMap;

use serde_json::Value;

use crate::graph::{Capability, RuntimeGraph};
use crate::runtime::stream::StreamHandle;
use crate::runtime::OrchestratorError;

/// What one node left behind after it ran
#[derive(Debug)]
pub enum NodeResult {
    Data(Value),
    Stream(StreamHandle),
}

impl NodeResult {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            NodeResult::Data(v) => Some(v),
            NodeResult::Stream(_) => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, NodeResult::Stream(_))
    }
}

/// Terminal result picked for projection
#[derive(Debug)]
pub enum Terminal {
    /// Live stream of the last completed node, untouched
    Passthrough { node: String, stream: StreamHandle },
    /// Result of the last leaf of the runtime graph
    Leaf { node: String, result: NodeResult },
}

impl Terminal {
    pub fn node(&self) -> &str {
        match self {
            Terminal::Passthrough { node, .. } | Terminal::Leaf { node, .. } => node,
        }
    }
}

/// Append-only record of one request's node results, in completion order
#[derive(Debug, Default)]
pub struct ResultMap {
    entries: HashMap<String, NodeResult>,
    order: Vec<String>,
    failures: Vec<(String, OrchestratorError)>,
}

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. Returns false (and keeps the first entry) when the
    /// node already has one.
    pub fn insert(&mut self, node: impl Into<String>, result: NodeResult) -> bool {
        let node = node.into();
        if self.entries.contains_key(&node) {
            return false;
        }
        self.order.push(node.clone());
        self.entries.insert(node, result);
        true
    }

    pub fn get(&self, node: &str) -> Option<&NodeResult> {
        self.entries.get(node)
    }

    /// Materialized payload of a node, if it has one
    pub fn data(&self, node: &str) -> Option<&Value> {
        self.get(node).and_then(NodeResult::as_data)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.entries.contains_key(node)
    }

    /// Move a result out. The node stays in the completion order.
    pub fn take(&mut self, node: &str) -> Option<NodeResult> {
        self.entries.remove(node)
    }

    /// Node names in the order their results were stored
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn last_completed(&self) -> Option<&str> {
        self.order.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn record_failure(&mut self, node: impl Into<String>, err: OrchestratorError) {
        self.failures.push((node.into(), err));
    }

    /// Nodes that failed, with the reason, in the order they failed
    pub fn failures(&self) -> &[(String, OrchestratorError)] {
        &self.failures
    }

    pub fn is_failed(&self, node: &str) -> bool {
        self.failures.iter().any(|(n, _)| n == node)
    }

    /// Pick the terminal result.
    ///
    /// The last completed node wins as a passthrough when it holds a live
    /// stream and its capability matches `expected` (any capability when
    /// `expected` is `None`). Otherwise the last of `graph.all_leaves()` is
    /// the terminal node. A terminal node without a result fails with the
    /// first recorded failure, if there was one.
    pub fn take_terminal(
        &mut self,
        graph: &RuntimeGraph,
        expected: Option<&Capability>,
    ) -> Result<Terminal, OrchestratorError> {
        if let Some(last) = self.last_completed().map(String::from) {
            let capability_matches = graph
                .node(&last)
                .map(|n| expected.map_or(true, |c| &n.capability == c))
                .unwrap_or(false);

            if capability_matches && matches!(self.get(&last), Some(NodeResult::Stream(_))) {
                if let Some(NodeResult::Stream(stream)) = self.take(&last) {
                    return Ok(Terminal::Passthrough { node: last, stream });
                }
            }
        }

        let leaf = graph
            .all_leaves()
            .last()
            .map(|n| n.name.clone())
            .ok_or_else(|| OrchestratorError::MissingTerminal("<empty graph>".to_string()))?;

        match self.take(&leaf) {
            Some(result) => Ok(Terminal::Leaf { node: leaf, result }),
            None => {
                if self.failures.is_empty() {
                    Err(OrchestratorError::MissingTerminal(leaf))
                } else {
                    Err(self.failures.remove(0).1)
                }
            }
        }
    }
}
