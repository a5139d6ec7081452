//! Graph Nodes
//!
//! Nodes of the flat dependency graph. A node is nothing but its adjacency:
//! values live in the cell store, the graph only knows ids.

use std::fmt;

use smallvec::SmallVec;

/// Integer identity of a node in an acceleration backend.
///
/// Ids are dense and start at zero, so they index directly into flat
/// tables on both sides of the backend boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Get the raw ID value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Position of this node in a dense table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Adjacency of a single node.
#[derive(Debug, Default, Clone)]
pub struct Node {
    /// Nodes that this node reads from (parents in the DAG).
    dependencies: SmallVec<[NodeId; 4]>,

    /// Nodes that read from this node (children in the DAG).
    dependents: SmallVec<[NodeId; 4]>,
}

impl Node {
    /// Add a dependency. Duplicate edges are ignored.
    pub fn add_dependency(&mut self, node_id: NodeId) -> bool {
        if self.dependencies.contains(&node_id) {
            return false;
        }
        self.dependencies.push(node_id);
        true
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.retain(|id| *id != node_id);
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    /// Add a dependent. Duplicate edges are ignored.
    pub fn add_dependent(&mut self, node_id: NodeId) -> bool {
        if self.dependents.contains(&node_id) {
            return false;
        }
        self.dependents.push(node_id);
        true
    }

    /// Remove a dependent.
    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.retain(|id| *id != node_id);
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &[NodeId] {
        &self.dependents
    }
}
