//! Dependency Graph Backends
//!
//! This module implements the acceleration backend boundary: an alternate
//! propagation engine that mirrors the atom graph using integer node ids.
//!
//! # Overview
//!
//! The backend graph is a directed acyclic graph where:
//!
//! - Nodes stand in for materialized atoms (one node per cell)
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//!
//! When a source changes, the backend walks the graph and writes the ids of
//! every affected node, in topological order, into a flat update buffer.
//! The reactive runtime then re-evaluates those atoms in that order.
//!
//! # Design Decisions
//!
//! 1. The boundary ([`PropagationBackend`]) only moves integers and bytes,
//!    so a backend can live behind FFI or in a WebAssembly module.
//!
//! 2. Results are read from shared [`LinearMemory`] instead of being
//!    allocated per call; the reader caches an [`UpdateBufferView`].
//!
//! 3. The graph is indexed by node ID for O(1) lookups, and keeps both
//!    forward and reverse edges.

mod backend;
mod flat;
mod memory;
mod node;

pub use backend::{BackendError, PropagationBackend};
pub use flat::FlatGraph;
pub use memory::{LinearMemory, UpdateBufferView, PAGE_SIZE};
pub use node::{Node, NodeId};
