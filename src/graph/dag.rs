use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use super::node::NodeDescriptor;

/// Arena index of a node; stable for the lifetime of a template and every
/// runtime graph cloned from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Duplicate node name: '{0}'")]
    DuplicateNode(String),

    #[error("Node '{0}' is not part of the graph")]
    UnknownNode(String),

    #[error("Edge '{from}' -> '{to}' would create a cycle")]
    Cycle { from: String, to: String },

    #[error("Runtime graph is sealed: scheduling has already finished")]
    Sealed,
}

// ============================================================================
// SBIO: Pure adjacency structure (no I/O)
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Adjacency {
    successors: Vec<Vec<NodeId>>,
    removed: Vec<bool>,
}

impl Adjacency {
    fn push_node(&mut self) {
        self.successors.push(Vec::new());
        self.removed.push(false);
    }

    fn is_live(&self, id: NodeId) -> bool {
        id.0 < self.removed.len() && !self.removed[id.0]
    }

    fn live_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.successors.len())
            .map(NodeId)
            .filter(move |id| self.is_live(*id))
    }

    fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.successors[id.0]
    }

    fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.live_ids()
            .filter(|p| self.successors[p.0].contains(&id))
            .collect()
    }

    /// Depth-first reachability over current edges
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.successors.len()];

        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            stack.extend(self.successors[id.0].iter().copied());
        }

        false
    }

    /// Returns false if the edge would close a cycle. Duplicate edges are a no-op.
    fn add_edge(&mut self, from: NodeId, to: NodeId) -> bool {
        if from == to || self.reaches(to, from) {
            return false;
        }
        if !self.successors[from.0].contains(&to) {
            self.successors[from.0].push(to);
        }
        true
    }

    /// Remove `id`, splicing its successors into each predecessor's list at
    /// the position `id` used to occupy.
    fn remove(&mut self, id: NodeId) {
        let succs = std::mem::take(&mut self.successors[id.0]);

        for pred in self.predecessors(id) {
            let list = &mut self.successors[pred.0];
            let Some(pos) = list.iter().position(|s| *s == id) else {
                continue;
            };
            list.remove(pos);

            let mut insert_at = pos;
            for succ in &succs {
                if !list.contains(succ) {
                    list.insert(insert_at, *succ);
                    insert_at += 1;
                }
            }
        }

        self.removed[id.0] = true;
    }

    fn leaves(&self) -> Vec<NodeId> {
        self.live_ids()
            .filter(|id| self.successors[id.0].is_empty())
            .collect()
    }

    fn roots(&self) -> Vec<NodeId> {
        let mut has_pred = vec![false; self.successors.len()];
        for id in self.live_ids() {
            for s in &self.successors[id.0] {
                has_pred[s.0] = true;
            }
        }
        self.live_ids().filter(|id| !has_pred[id.0]).collect()
    }

    /// Kahn's algorithm with insertion-order tie breaking
    fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree = vec![0usize; self.successors.len()];
        for id in self.live_ids() {
            for s in &self.successors[id.0] {
                in_degree[s.0] += 1;
            }
        }

        let mut queue: VecDeque<NodeId> = self.roots().into_iter().collect();
        let mut order = Vec::new();

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for s in &self.successors[id.0] {
                in_degree[s.0] -= 1;
                if in_degree[s.0] == 0 {
                    queue.push_back(*s);
                }
            }
        }

        order
    }
}

// ============================================================================
// Static pipeline template
// ============================================================================

/// Pipeline topology assembled once at startup.
///
/// Never scheduled directly: every request works on its own
/// [`RuntimeGraph`] obtained from [`OrchestrationGraph::instantiate`].
#[derive(Debug, Clone, Default)]
pub struct OrchestrationGraph {
    nodes: Arc<Vec<Arc<NodeDescriptor>>>,
    index: Arc<HashMap<String, NodeId>>,
    adjacency: Adjacency,
}

impl OrchestrationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node
    pub fn add(&mut self, node: NodeDescriptor) -> Result<NodeId, GraphError> {
        if self.index.contains_key(&node.name) {
            return Err(GraphError::DuplicateNode(node.name));
        }

        let id = NodeId(self.nodes.len());
        Arc::make_mut(&mut self.index).insert(node.name.clone(), id);
        Arc::make_mut(&mut self.nodes).push(Arc::new(node));
        self.adjacency.push_node();
        Ok(id)
    }

    /// Add the edge `from -> to`, rejecting anything that would close a cycle
    pub fn flow_to(&mut self, from: &str, to: &str) -> Result<&mut Self, GraphError> {
        let a = self.id_of(from)?;
        let b = self.id_of(to)?;

        if !self.adjacency.add_edge(a, b) {
            return Err(GraphError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&NodeDescriptor> {
        self.index.get(name).map(|id| self.nodes[id.0].as_ref())
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter().map(|n| n.as_ref())
    }

    /// Nodes with zero out-degree, in insertion order
    pub fn all_leaves(&self) -> Vec<&NodeDescriptor> {
        self.resolve(self.adjacency.leaves())
    }

    pub fn downstream(&self, name: &str) -> Vec<&NodeDescriptor> {
        match self.index.get(name) {
            Some(id) => self.resolve(self.adjacency.successors(*id).to_vec()),
            None => Vec::new(),
        }
    }

    pub fn predecessors(&self, name: &str) -> Vec<&NodeDescriptor> {
        match self.index.get(name) {
            Some(id) => self.resolve(self.adjacency.predecessors(*id)),
            None => Vec::new(),
        }
    }

    pub fn topological_order(&self) -> Vec<&NodeDescriptor> {
        self.resolve(self.adjacency.topological_order())
    }

    /// Fresh per-request copy. Descriptors are shared; adjacency is not.
    pub fn instantiate(&self) -> RuntimeGraph {
        RuntimeGraph {
            nodes: self.nodes.clone(),
            index: self.index.clone(),
            adjacency: self.adjacency.clone(),
            sealed: false,
        }
    }

    fn id_of(&self, name: &str) -> Result<NodeId, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    fn resolve(&self, ids: Vec<NodeId>) -> Vec<&NodeDescriptor> {
        ids.into_iter().map(|id| self.nodes[id.0].as_ref()).collect()
    }
}

// ============================================================================
// Per-request graph
// ============================================================================

/// Request-exclusive copy of the pipeline topology that alignment hooks may
/// rewire while the request is being scheduled.
#[derive(Debug, Clone)]
pub struct RuntimeGraph {
    nodes: Arc<Vec<Arc<NodeDescriptor>>>,
    index: Arc<HashMap<String, NodeId>>,
    adjacency: Adjacency,
    sealed: bool,
}

impl RuntimeGraph {
    pub fn node(&self, name: &str) -> Option<&NodeDescriptor> {
        self.live_id(name).map(|id| self.nodes[id.0].as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.live_id(name).is_some()
    }

    pub fn all_leaves(&self) -> Vec<&NodeDescriptor> {
        self.resolve(self.adjacency.leaves())
    }

    pub fn downstream(&self, name: &str) -> Vec<&NodeDescriptor> {
        match self.live_id(name) {
            Some(id) => self.resolve(self.adjacency.successors(id).to_vec()),
            None => Vec::new(),
        }
    }

    pub fn predecessors(&self, name: &str) -> Vec<&NodeDescriptor> {
        match self.live_id(name) {
            Some(id) => self.resolve(self.adjacency.predecessors(id)),
            None => Vec::new(),
        }
    }

    pub fn topological_order(&self) -> Vec<&NodeDescriptor> {
        self.resolve(self.adjacency.topological_order())
    }

    /// Live nodes with no predecessors
    pub fn roots(&self) -> Vec<&NodeDescriptor> {
        self.resolve(self.adjacency.roots())
    }

    /// Add an edge between two live nodes
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        self.ensure_open()?;
        let a = self.require(from)?;
        let b = self.require(to)?;

        if !self.adjacency.add_edge(a, b) {
            return Err(GraphError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a node, connecting each of its predecessors directly to each of
    /// its successors. Returns whether anything was removed.
    pub fn delete_node_if_exists(&mut self, name: &str) -> Result<bool, GraphError> {
        self.ensure_open()?;
        match self.live_id(name) {
            Some(id) => {
                self.adjacency.remove(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Freeze the topology once scheduling is over
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    // Id-level access for the scheduler

    pub(crate) fn is_live(&self, id: NodeId) -> bool {
        self.adjacency.is_live(id)
    }

    pub(crate) fn descriptor(&self, id: NodeId) -> &Arc<NodeDescriptor> {
        &self.nodes[id.0]
    }

    pub(crate) fn live_node_ids(&self) -> Vec<NodeId> {
        self.adjacency.live_ids().collect()
    }

    pub(crate) fn successor_ids(&self, id: NodeId) -> &[NodeId] {
        self.adjacency.successors(id)
    }

    pub(crate) fn predecessor_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.adjacency.predecessors(id)
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.sealed {
            return Err(GraphError::Sealed);
        }
        Ok(())
    }

    fn live_id(&self, name: &str) -> Option<NodeId> {
        self.index
            .get(name)
            .copied()
            .filter(|id| self.adjacency.is_live(*id))
    }

    fn require(&self, name: &str) -> Result<NodeId, GraphError> {
        self.live_id(name)
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    fn resolve(&self, ids: Vec<NodeId>) -> Vec<&NodeDescriptor> {
        ids.into_iter().map(|id| self.nodes[id.0].as_ref()).collect()
    }
}
