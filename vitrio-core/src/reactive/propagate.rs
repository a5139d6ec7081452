//! Change Propagation
//!
//! When a cell's value changes, every derived atom that transitively reads
//! it must be brought up to date before the write returns. Two strategies
//! implement [`PropagationStrategy`]:
//!
//! - [`Fallback`]: traverses the cell store directly.
//! - [`Accelerated`]: asks a [`PropagationBackend`] for the evaluation
//!   order and only performs the re-evaluations itself.
//!
//! The runtime picks one per write: the accelerated strategy when a backend
//! is installed and the written atom has a node id, the fallback otherwise.
//! Both produce the same values and the same notifications.
//!
//! # Fallback Algorithm
//!
//! 1. Bump the epoch and collect every atom reachable from the source
//!    through `dependents` edges, stamping each cell with the epoch.
//! 2. For each stamped cell, count its dependencies that carry the same
//!    stamp (`pending`).
//! 3. Process cells whose count is zero, FIFO. A cell is re-evaluated only
//!    if one of its dependencies changed in this cycle (`dirty`); if its
//!    own value changes, its dependents become dirty. Either way its
//!    dependents' counts go down by one.
//!
//! Every affected atom is evaluated at most once, and only after all of
//! its affected dependencies, so diamonds never observe a half-updated
//! graph. Unchanged values stop propagation along their edges.
//!
//! # Dependencies Gained Mid-Cycle
//!
//! The order above is fixed from the edges that exist when the cycle
//! starts. A re-evaluation may read an atom it did not read before, and
//! that atom may be affected and not processed yet. Reads made through a
//! [`Getter`](super::Getter) while a cycle runs therefore *pull*: an
//! affected atom that has not been brought up to date is settled first,
//! together with its own affected dependencies. Both strategies do this,
//! so no read function ever observes a stale value.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::graph::{BackendError, NodeId, PropagationBackend, UpdateBufferView};

use super::cell::AtomId;
use super::runtime::Runtime;

/// Counters describing one propagation cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PropagationStats {
    /// Atoms reached from the source.
    pub affected: usize,

    /// Atoms whose read function ran.
    pub recomputed: usize,

    /// Atoms whose value changed.
    pub changed: usize,
}

/// A way of bringing dependents up to date after `source` changed.
pub(crate) trait PropagationStrategy {
    fn propagate(&self, rt: &Runtime, source: AtomId) -> Result<PropagationStats>;
}

/// Update counters that nested reads may also touch.
fn tally(stats: &Cell<PropagationStats>, f: impl FnOnce(&mut PropagationStats)) {
    let mut current = stats.get();
    f(&mut current);
    stats.set(current);
}

/// Sets a cycle marker and restores the previous one on drop.
struct CycleGuard<'a, T: Copy> {
    slot: &'a Cell<T>,
    previous: T,
}

impl<'a, T: Copy> CycleGuard<'a, T> {
    fn enter(slot: &'a Cell<T>, value: T) -> Self {
        let previous = slot.replace(value);
        Self { slot, previous }
    }
}

impl<T: Copy> Drop for CycleGuard<'_, T> {
    fn drop(&mut self) {
        self.slot.set(self.previous);
    }
}

/// In-process propagation over the cell store.
#[derive(Debug, Default)]
pub(crate) struct Fallback {
    epoch: Cell<u64>,

    /// Epoch of the cycle in progress, if any.
    active: Cell<Option<u64>>,

    /// Cells whose affected dependencies are all settled.
    ready: RefCell<VecDeque<AtomId>>,

    stats: Cell<PropagationStats>,
}

impl Fallback {
    /// Stamp and return every atom reachable from `source`.
    fn collect_affected(&self, rt: &Runtime, source: AtomId, epoch: u64) -> Vec<AtomId> {
        let mut store = rt.store.borrow_mut();
        let mut affected = Vec::new();
        let mut queue: VecDeque<AtomId> = match store.cell(source) {
            Some(cell) => cell.dependents.iter().copied().collect(),
            None => return affected,
        };

        while let Some(id) = queue.pop_front() {
            let Some(cell) = store.cell_mut(id) else {
                continue;
            };
            if cell.mark.epoch == epoch {
                continue;
            }
            cell.mark.epoch = epoch;
            cell.mark.pending = 0;
            cell.mark.dirty = false;
            cell.mark.done = false;
            affected.push(id);
            queue.extend(cell.dependents.iter().copied());
        }

        affected
    }

    /// Bring `id` up to date if the running cycle reached it and has not
    /// settled it yet.
    pub(crate) fn pull(&self, rt: &Runtime, id: AtomId) -> Result<()> {
        let Some(epoch) = self.active.get() else {
            return Ok(());
        };
        let deps = match rt.store.borrow().cell(id) {
            Some(cell) if cell.mark.epoch == epoch && !cell.mark.done => cell.deps.clone(),
            _ => return Ok(()),
        };

        trace!(atom = %id, "pulled ahead of its turn");
        for dep in deps {
            self.pull(rt, dep)?;
        }
        self.settle(rt, id, epoch)
    }

    /// Re-evaluate `id` if it is dirty, then release its dependents.
    fn settle(&self, rt: &Runtime, id: AtomId, epoch: u64) -> Result<()> {
        let dirty = {
            let mut store = rt.store.borrow_mut();
            let Some(cell) = store.cell_mut(id) else {
                return Ok(());
            };
            if cell.mark.epoch != epoch || cell.mark.done {
                return Ok(());
            }
            cell.mark.done = true;
            cell.mark.dirty
        };

        let changed = if dirty {
            tally(&self.stats, |s| s.recomputed += 1);
            rt.recompute(id)?
        } else {
            false
        };
        if changed {
            tally(&self.stats, |s| s.changed += 1);
        }

        let mut store = rt.store.borrow_mut();
        let dependents: Vec<AtomId> = store
            .cell(id)
            .map(|cell| cell.dependents.iter().copied().collect())
            .unwrap_or_default();
        let mut ready = self.ready.borrow_mut();
        for dependent in dependents {
            let Some(cell) = store.cell_mut(dependent) else {
                continue;
            };
            if cell.mark.epoch != epoch || cell.mark.done {
                continue;
            }
            if changed {
                cell.mark.dirty = true;
            }
            if cell.mark.pending > 0 {
                cell.mark.pending -= 1;
                if cell.mark.pending == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        Ok(())
    }
}

impl PropagationStrategy for Fallback {
    fn propagate(&self, rt: &Runtime, source: AtomId) -> Result<PropagationStats> {
        let epoch = self.epoch.get() + 1;
        self.epoch.set(epoch);

        let affected = self.collect_affected(rt, source, epoch);
        self.stats.set(PropagationStats {
            affected: affected.len(),
            ..Default::default()
        });
        if affected.is_empty() {
            return Ok(self.stats.get());
        }

        {
            let mut store = rt.store.borrow_mut();
            let mut ready = self.ready.borrow_mut();
            ready.clear();
            for &id in &affected {
                let pending = store.cell(id).map_or(0, |cell| {
                    cell.deps
                        .iter()
                        .filter(|dep| store.cell(**dep).is_some_and(|d| d.mark.epoch == epoch))
                        .count() as u32
                });
                if let Some(cell) = store.cell_mut(id) {
                    cell.mark.pending = pending;
                }
                if pending == 0 {
                    ready.push_back(id);
                }
            }

            // Direct dependents of the written atom are certainly stale.
            let direct: Vec<AtomId> = store
                .cell(source)
                .map(|cell| cell.dependents.iter().copied().collect())
                .unwrap_or_default();
            for id in direct {
                if let Some(cell) = store.cell_mut(id) {
                    cell.mark.dirty = true;
                }
            }
        }

        let _active = CycleGuard::enter(&self.active, Some(epoch));
        loop {
            let next = self.ready.borrow_mut().pop_front();
            let Some(id) = next else {
                break;
            };
            self.settle(rt, id, epoch)?;
        }

        let skipped = {
            let store = rt.store.borrow();
            affected
                .iter()
                .filter(|id| {
                    store
                        .cell(**id)
                        .is_some_and(|c| c.mark.epoch == epoch && !c.mark.done)
                })
                .count()
        };
        if skipped > 0 {
            warn!(
                source = %source,
                skipped,
                "atoms in a dependency cycle were not re-evaluated"
            );
        }

        let stats = self.stats.get();
        debug!(
            source = %source,
            affected = stats.affected,
            recomputed = stats.recomputed,
            changed = stats.changed,
            "fallback propagation finished"
        );
        Ok(stats)
    }
}

/// Propagation delegated to an acceleration backend.
pub(crate) struct Accelerated {
    backend: RefCell<Box<dyn PropagationBackend>>,

    /// Cached window over the backend's update buffer.
    view: Cell<UpdateBufferView>,

    /// Node id to atom table.
    atoms: RefCell<Vec<Option<AtomId>>>,

    /// Whether a cycle is in progress.
    active: Cell<bool>,

    /// Atoms of the running cycle not re-evaluated yet.
    remaining: RefCell<HashSet<AtomId>>,

    stats: Cell<PropagationStats>,
}

impl Accelerated {
    pub fn new(backend: Box<dyn PropagationBackend>) -> std::result::Result<Self, BackendError> {
        let ptr = backend.update_buffer_ptr();
        let capacity = backend.update_buffer_capacity();
        let len = backend.memory().len();
        if ptr + capacity * std::mem::size_of::<i32>() > len {
            return Err(BackendError::BufferOutOfBounds { ptr, capacity, len });
        }

        let view = UpdateBufferView::new(backend.memory(), ptr, capacity);
        Ok(Self {
            backend: RefCell::new(backend),
            view: Cell::new(view),
            atoms: RefCell::new(Vec::new()),
            active: Cell::new(false),
            remaining: RefCell::new(HashSet::new()),
            stats: Cell::new(PropagationStats::default()),
        })
    }

    /// Allocate a node for `atom`.
    pub fn create_node(&self, atom: AtomId) -> NodeId {
        let node = self.backend.borrow_mut().create_node();
        let mut atoms = self.atoms.borrow_mut();
        if atoms.len() <= node.index() {
            atoms.resize(node.index() + 1, None);
        }
        atoms[node.index()] = Some(atom);
        node
    }

    pub fn add_edge(&self, dependent: NodeId, dependency: NodeId) {
        self.backend.borrow_mut().add_edge(dependent, dependency);
    }

    pub fn remove_edge(&self, dependent: NodeId, dependency: NodeId) {
        self.backend.borrow_mut().remove_edge(dependent, dependency);
    }

    /// Ask the backend which atoms to re-evaluate, in order.
    fn affected(&self, source: NodeId) -> Vec<AtomId> {
        let mut backend = self.backend.borrow_mut();
        let count = backend.propagate(source);
        if count == 0 {
            return Vec::new();
        }

        let memory = backend.memory();
        let mut view = self.view.get();
        if !view.is_current(memory) || view.capacity() < count {
            view = UpdateBufferView::new(
                memory,
                backend.update_buffer_ptr(),
                backend.update_buffer_capacity(),
            );
            self.view.set(view);
            debug!(capacity = view.capacity(), "update buffer view rebuilt");
        }
        if count > view.capacity() {
            warn!(
                count,
                capacity = view.capacity(),
                "backend reported more nodes than its update buffer holds"
            );
        }

        let atoms = self.atoms.borrow();
        (0..count.min(view.capacity()))
            .filter_map(|i| view.get(memory, i))
            .filter_map(|raw| usize::try_from(raw).ok())
            .filter_map(|idx| atoms.get(idx).copied().flatten())
            .collect()
    }

    /// Number of nodes known to the adapter.
    pub fn node_count(&self) -> usize {
        self.atoms.borrow().len()
    }

    /// Re-evaluate `id` now if the running cycle has it still queued.
    pub(crate) fn pull(&self, rt: &Runtime, id: AtomId) -> Result<()> {
        if !self.active.get() || !self.remaining.borrow_mut().remove(&id) {
            return Ok(());
        }
        tally(&self.stats, |s| s.recomputed += 1);
        if rt.recompute(id)? {
            tally(&self.stats, |s| s.changed += 1);
        }
        Ok(())
    }
}

impl PropagationStrategy for Accelerated {
    fn propagate(&self, rt: &Runtime, source: AtomId) -> Result<PropagationStats> {
        let Some(node) = rt.node_of(source) else {
            return Ok(PropagationStats::default());
        };

        // The backend borrow is released before any read function runs.
        let order = self.affected(node);
        self.stats.set(PropagationStats {
            affected: order.len(),
            ..Default::default()
        });
        *self.remaining.borrow_mut() = order.iter().copied().collect();

        // An atom read ahead of its turn is re-evaluated by the read and
        // skipped here.
        let _active = CycleGuard::enter(&self.active, true);
        for id in order {
            self.pull(rt, id)?;
        }

        let stats = self.stats.get();
        debug!(
            source = %source,
            affected = stats.affected,
            changed = stats.changed,
            "accelerated propagation finished"
        );
        Ok(stats)
    }
}

impl Runtime {
    /// Backend node of `id`, if it has one.
    pub(crate) fn node_of(&self, id: AtomId) -> Option<NodeId> {
        self.store.borrow().slot(id).ok()?.accelerated_id
    }

    /// Give `id` a backend node if a backend is installed.
    pub(crate) fn register_node(&self, id: AtomId) -> Option<NodeId> {
        let acc = self.accelerated.borrow().clone()?;
        if let Some(node) = self.node_of(id) {
            return Some(node);
        }

        let node = acc.create_node(id);
        if let Ok(slot) = self.store.borrow_mut().slot_mut(id) {
            slot.accelerated_id = Some(node);
        }
        Some(node)
    }

    /// Mirror dependency changes of `owner` into the backend.
    pub(crate) fn mirror_edges(&self, owner: AtomId, added: &[AtomId], removed: &[AtomId]) {
        let Some(acc) = self.accelerated.borrow().clone() else {
            return;
        };
        let Some(owner_node) = self.register_node(owner) else {
            return;
        };

        for &dep in added {
            if let Some(node) = self.register_node(dep) {
                acc.add_edge(owner_node, node);
            }
        }
        for &dep in removed {
            if let Some(node) = self.node_of(dep) {
                acc.remove_edge(owner_node, node);
            }
        }
    }

    /// Settle `id` first if the running cycle has not reached it yet.
    pub(crate) fn pull(&self, id: AtomId) -> Result<()> {
        self.fallback.pull(self, id)?;
        let accelerated = self.accelerated.borrow().clone();
        match accelerated {
            Some(acc) => acc.pull(self, id),
            None => Ok(()),
        }
    }

    /// Run one propagation cycle from `source` with the applicable strategy.
    pub(crate) fn propagate_once(&self, source: AtomId) -> Result<PropagationStats> {
        let accelerated = self.accelerated.borrow().clone();
        let strategy: &dyn PropagationStrategy = match &accelerated {
            Some(acc) if self.node_of(source).is_some() => &**acc,
            _ => &self.fallback,
        };
        strategy.propagate(self, source)
    }
}
