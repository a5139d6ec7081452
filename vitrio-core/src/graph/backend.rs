//! Acceleration Backend Boundary
//!
//! An acceleration backend mirrors the dependency graph using integer node
//! ids and performs propagation on its own. It knows nothing about values:
//! given a changed node it reports which nodes are affected and in which
//! order they must be re-evaluated.
//!
//! The boundary is deliberately narrow so it can be implemented over FFI:
//! results are written into the backend's [`LinearMemory`] rather than
//! returned as Rust collections.

use thiserror::Error;

use super::memory::LinearMemory;
use super::node::NodeId;

/// Errors raised while bringing up or talking to a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be initialized.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The update buffer does not fit in the backend's memory.
    #[error("update buffer at offset {ptr} with {capacity} slots exceeds {len} bytes of memory")]
    BufferOutOfBounds { ptr: usize, capacity: usize, len: usize },
}

/// Propagation engine operating over a flat, integer-indexed graph.
pub trait PropagationBackend {
    /// Allocate a new node and return its id.
    fn create_node(&mut self) -> NodeId;

    /// Record that `dependent` reads `dependency`.
    fn add_edge(&mut self, dependent: NodeId, dependency: NodeId);

    /// Forget an edge. Backends that never drop edges may ignore this;
    /// stale edges only cause redundant re-evaluations.
    fn remove_edge(&mut self, _dependent: NodeId, _dependency: NodeId) {}

    /// Compute the nodes affected by a change of `source`.
    ///
    /// Writes their ids, in evaluation order, into the update buffer and
    /// returns how many were written.
    fn propagate(&mut self, source: NodeId) -> usize;

    /// Byte offset of the update buffer inside [`memory`](Self::memory).
    fn update_buffer_ptr(&self) -> usize;

    /// Number of `i32` slots in the update buffer.
    fn update_buffer_capacity(&self) -> usize;

    /// The backend's memory region.
    fn memory(&self) -> &LinearMemory;
}
