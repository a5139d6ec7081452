//! Flat Graph Backend
//!
//! The bundled [`PropagationBackend`]. Nodes live in a dense vector indexed
//! by [`NodeId`]; propagation results are written into a [`LinearMemory`]
//! update buffer.
//!
//! # Algorithm
//!
//! 1. Starting from the changed node's direct dependents, collect every
//!    transitively reachable node (BFS, visited marks are epoch-stamped so
//!    no set is allocated per call).
//! 2. Count, for each reachable node, how many of its dependencies are
//!    themselves reachable.
//! 3. Emit the reachable nodes in Kahn order, so every node comes after all
//!    of its affected dependencies.
//!
//! Nodes caught in a cycle never reach an in-degree of zero and are left
//! out of the result.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::backend::{BackendError, PropagationBackend};
use super::memory::{LinearMemory, PAGE_SIZE};
use super::node::{Node, NodeId};

/// Byte offset of the update buffer. The bytes before it are reserved.
const UPDATE_BUFFER_PTR: usize = 64;

const SLOT: usize = std::mem::size_of::<i32>();

/// Integer-indexed dependency graph with topological propagation.
#[derive(Debug)]
pub struct FlatGraph {
    /// All nodes, indexed by id.
    nodes: Vec<Node>,

    /// Per-node visit stamp for the current propagation.
    marks: Vec<u64>,

    /// Per-node count of affected dependencies not yet emitted.
    in_degree: Vec<u32>,

    epoch: u64,

    memory: LinearMemory,
    capacity: usize,
}

impl FlatGraph {
    /// Create an empty graph whose update buffer holds `capacity` ids.
    pub fn with_capacity(capacity: usize) -> Result<Self, BackendError> {
        if capacity == 0 {
            return Err(BackendError::Unavailable(
                "update buffer capacity must be positive".into(),
            ));
        }
        if capacity > i32::MAX as usize {
            return Err(BackendError::BufferOutOfBounds {
                ptr: UPDATE_BUFFER_PTR,
                capacity,
                len: i32::MAX as usize,
            });
        }

        let memory = LinearMemory::new(pages_for(capacity));
        Ok(Self {
            nodes: Vec::new(),
            marks: Vec::new(),
            in_degree: Vec::new(),
            epoch: 0,
            memory,
            capacity,
        })
    }

    /// Get a reference to a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Make sure the update buffer can hold `count` ids.
    fn reserve(&mut self, count: usize) {
        if count <= self.capacity {
            return;
        }
        let capacity = count.next_power_of_two();
        let needed = pages_for(capacity);
        self.memory.grow(needed.saturating_sub(self.memory.pages()));
        debug!(from = self.capacity, to = capacity, "update buffer enlarged");
        self.capacity = capacity;
    }

    /// Collect every node reachable from `source` through dependent edges.
    fn reachable(&mut self, source: NodeId) -> Vec<NodeId> {
        self.epoch += 1;
        let epoch = self.epoch;

        let mut found = Vec::new();
        let mut queue: VecDeque<NodeId> = self.nodes[source.index()]
            .dependents()
            .iter()
            .copied()
            .collect();

        while let Some(node_id) = queue.pop_front() {
            let idx = node_id.index();
            if self.marks[idx] == epoch {
                continue;
            }
            self.marks[idx] = epoch;
            found.push(node_id);
            queue.extend(self.nodes[idx].dependents().iter().copied());
        }

        found
    }

    /// Order `affected` so dependencies come before dependents.
    fn topological_order(&mut self, affected: &[NodeId]) -> Vec<NodeId> {
        let epoch = self.epoch;
        let mut order = Vec::with_capacity(affected.len());
        let mut queue = VecDeque::new();

        // Calculate in-degrees (only counting edges within the affected set)
        for &node_id in affected {
            let degree = self.nodes[node_id.index()]
                .dependencies()
                .iter()
                .filter(|d| self.marks[d.index()] == epoch)
                .count() as u32;
            self.in_degree[node_id.index()] = degree;
            if degree == 0 {
                queue.push_back(node_id);
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            order.push(node_id);

            for &dependent in self.nodes[node_id.index()].dependents() {
                let idx = dependent.index();
                if self.marks[idx] != epoch {
                    continue;
                }
                let degree = &mut self.in_degree[idx];
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() < affected.len() {
            debug!(
                skipped = affected.len() - order.len(),
                "cyclic nodes left out of propagation order"
            );
        }

        order
    }

    fn contains(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len()
    }
}

impl PropagationBackend for FlatGraph {
    fn create_node(&mut self) -> NodeId {
        let id = NodeId::from(self.nodes.len() as u32);
        self.nodes.push(Node::default());
        self.marks.push(0);
        self.in_degree.push(0);
        id
    }

    fn add_edge(&mut self, dependent: NodeId, dependency: NodeId) {
        if !self.contains(dependent) || !self.contains(dependency) {
            return;
        }
        self.nodes[dependency.index()].add_dependent(dependent);
        self.nodes[dependent.index()].add_dependency(dependency);
    }

    fn remove_edge(&mut self, dependent: NodeId, dependency: NodeId) {
        if !self.contains(dependent) || !self.contains(dependency) {
            return;
        }
        self.nodes[dependency.index()].remove_dependent(dependent);
        self.nodes[dependent.index()].remove_dependency(dependency);
    }

    fn propagate(&mut self, source: NodeId) -> usize {
        if !self.contains(source) {
            return 0;
        }

        let affected = self.reachable(source);
        let order = self.topological_order(&affected);
        self.reserve(order.len());

        for (i, node_id) in order.iter().enumerate() {
            self.memory
                .write_i32(UPDATE_BUFFER_PTR + i * SLOT, node_id.raw() as i32);
        }

        trace!(%source, count = order.len(), "flat graph propagated");
        order.len()
    }

    fn update_buffer_ptr(&self) -> usize {
        UPDATE_BUFFER_PTR
    }

    fn update_buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn memory(&self) -> &LinearMemory {
        &self.memory
    }
}

/// Pages needed to hold the reserved header plus `capacity` slots.
fn pages_for(capacity: usize) -> usize {
    (UPDATE_BUFFER_PTR + capacity * SLOT).div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::UpdateBufferView;

    fn read_order(graph: &FlatGraph, count: usize) -> Vec<NodeId> {
        let view = UpdateBufferView::new(
            graph.memory(),
            graph.update_buffer_ptr(),
            graph.update_buffer_capacity(),
        );
        (0..count)
            .map(|i| NodeId::from(view.get(graph.memory(), i).unwrap() as u32))
            .collect()
    }

    #[test]
    fn add_and_remove_edges() {
        let mut graph = FlatGraph::with_capacity(16).unwrap();
        let source = graph.create_node();
        let derived = graph.create_node();

        graph.add_edge(derived, source);
        assert!(graph.node(source).unwrap().dependents().contains(&derived));
        assert!(graph.node(derived).unwrap().dependencies().contains(&source));

        graph.remove_edge(derived, source);
        assert!(graph.node(source).unwrap().dependents().is_empty());
        assert!(graph.node(derived).unwrap().dependencies().is_empty());
    }

    #[test]
    fn propagate_chain_in_order() {
        let mut graph = FlatGraph::with_capacity(16).unwrap();

        // Create a chain: source -> derived1 -> derived2
        let source = graph.create_node();
        let derived1 = graph.create_node();
        let derived2 = graph.create_node();
        graph.add_edge(derived1, source);
        graph.add_edge(derived2, derived1);

        let count = graph.propagate(source);
        assert_eq!(count, 2);
        assert_eq!(read_order(&graph, count), vec![derived1, derived2]);
    }

    #[test]
    fn diamond_sink_comes_last_and_once() {
        let mut graph = FlatGraph::with_capacity(16).unwrap();
        let a = graph.create_node();
        let b = graph.create_node();
        let c = graph.create_node();
        let d = graph.create_node();
        graph.add_edge(b, a);
        graph.add_edge(c, a);
        graph.add_edge(d, b);
        graph.add_edge(d, c);

        let count = graph.propagate(a);
        let order = read_order(&graph, count);
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&d));
    }

    #[test]
    fn uneven_paths_respect_dependencies() {
        // a -> b -> d and a -> c -> e -> d
        let mut graph = FlatGraph::with_capacity(16).unwrap();
        let a = graph.create_node();
        let b = graph.create_node();
        let c = graph.create_node();
        let d = graph.create_node();
        let e = graph.create_node();
        graph.add_edge(b, a);
        graph.add_edge(c, a);
        graph.add_edge(e, c);
        graph.add_edge(d, b);
        graph.add_edge(d, e);

        let count = graph.propagate(a);
        let order = read_order(&graph, count);
        let pos = |n: NodeId| order.iter().position(|&id| id == n).unwrap();
        assert!(pos(e) < pos(d));
        assert!(pos(b) < pos(d));
    }

    #[test]
    fn buffer_grows_when_too_small() {
        let mut graph = FlatGraph::with_capacity(2).unwrap();
        let generation = graph.memory().generation();
        let source = graph.create_node();
        let leaves: Vec<_> = (0..5).map(|_| graph.create_node()).collect();
        for &leaf in &leaves {
            graph.add_edge(leaf, source);
        }

        // A single page already fits far more than five ids.
        let count = graph.propagate(source);
        assert_eq!(count, 5);
        assert!(graph.update_buffer_capacity() >= 5);
        assert_eq!(graph.memory().generation(), generation);
        assert_eq!(read_order(&graph, count), leaves);
    }

    #[test]
    fn buffer_growth_reallocates_memory() {
        let capacity = 8;
        let mut graph = FlatGraph::with_capacity(capacity).unwrap();
        let source = graph.create_node();
        let fan_out = PAGE_SIZE / SLOT;
        for _ in 0..fan_out {
            let leaf = graph.create_node();
            graph.add_edge(leaf, source);
        }

        let count = graph.propagate(source);
        assert_eq!(count, fan_out);
        assert!(graph.memory().generation() > 0);
        assert!(graph.memory().pages() > 1);
    }

    #[test]
    fn unknown_source_propagates_nothing() {
        let mut graph = FlatGraph::with_capacity(4).unwrap();
        assert_eq!(graph.propagate(NodeId::from(3)), 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            FlatGraph::with_capacity(0),
            Err(BackendError::Unavailable(_))
        ));
    }
}
