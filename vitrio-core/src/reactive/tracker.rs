//! Dependency Tracking
//!
//! A derived atom's read function receives a [`Getter`]. Every read made
//! through it:
//!
//! 1. materializes the dependency's cell if it does not exist yet
//!    (recursively, depth-first, so dependencies are always computed before
//!    the atom that reads them),
//! 2. records the dependency in the evaluating atom's dependency list,
//! 3. during a propagation cycle, settles the dependency first if the
//!    cycle reached it but has not re-evaluated it yet.
//!
//! Once the read function returns, the new dependency list *replaces* the
//! old one and the reverse `dependents` edges are diffed to match: atoms no
//! longer read stop notifying this one. The same protocol runs on first
//! materialization and on every re-evaluation, so conditional reads are
//! always captured from the most recent evaluation.
//!
//! # Cycles
//!
//! Each slot carries an `evaluating` flag for the duration of its read
//! function. Reading an atom whose flag is set is a cycle and fails with
//! [`ReactiveError::Cycle`] instead of recursing forever.

use std::cell::RefCell;

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{ReactiveError, Result};

use super::atom::Atom;
use super::cell::{AtomCell, AtomDef, AtomId, ReadFn, Value};
use super::context::ReactiveContext;
use super::runtime::Runtime;

pub(crate) type DepList = SmallVec<[AtomId; 4]>;

/// The tracked getter handed to read functions.
pub struct Getter<'rt> {
    rt: &'rt Runtime,
    owner: AtomId,
    deps: RefCell<DepList>,
}

impl<'rt> Getter<'rt> {
    fn new(rt: &'rt Runtime, owner: AtomId) -> Self {
        Self {
            rt,
            owner,
            deps: RefCell::new(SmallVec::new()),
        }
    }

    /// Read `atom` and record it as a dependency.
    pub fn get<T>(&self, atom: &Atom<T>) -> Result<T>
    where
        T: Clone + 'static,
    {
        let id = atom.id();
        if id == self.owner || self.rt.is_evaluating(id)? {
            return Err(ReactiveError::Cycle(id));
        }

        self.rt.ensure_cell(id)?;

        let mut deps = self.deps.borrow_mut();
        if !deps.contains(&id) {
            deps.push(id);
        }
        drop(deps);

        self.rt.pull(id)?;
        self.rt.read_value(id)
    }

    /// The atom whose read function is running.
    pub fn owner(&self) -> AtomId {
        self.owner
    }

    fn into_deps(self) -> DepList {
        self.deps.into_inner()
    }
}

/// Marks a slot as evaluating for the lifetime of the guard.
struct EvaluationGuard<'rt> {
    rt: &'rt Runtime,
    id: AtomId,
}

impl<'rt> EvaluationGuard<'rt> {
    fn enter(rt: &'rt Runtime, id: AtomId) -> Result<Self> {
        let mut store = rt.store.borrow_mut();
        let slot = store.slot_mut(id)?;
        if slot.evaluating {
            return Err(ReactiveError::Cycle(id));
        }
        slot.evaluating = true;
        Ok(Self { rt, id })
    }
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut store) = self.rt.store.try_borrow_mut() {
            if let Ok(slot) = store.slot_mut(self.id) {
                slot.evaluating = false;
            }
        }
    }
}

impl Runtime {
    pub(crate) fn is_evaluating(&self, id: AtomId) -> Result<bool> {
        Ok(self.store.borrow().slot(id)?.evaluating)
    }

    /// Make sure `id` has a cell, evaluating its read function if needed.
    pub(crate) fn ensure_cell(&self, id: AtomId) -> Result<()> {
        let read = {
            let mut store = self.store.borrow_mut();
            let slot = store.slot_mut(id)?;
            if slot.cell.is_some() {
                return Ok(());
            }
            match &slot.def {
                AtomDef::Source { init } => {
                    slot.cell = Some(AtomCell::new(init.clone()));
                    None
                }
                AtomDef::Derived { read } => Some(read.clone()),
            }
        };

        // Lazy registration with the backend, before any edge can refer to it.
        self.register_node(id);

        let Some(read) = read else {
            trace!(atom = %id, "source cell materialized");
            return Ok(());
        };

        let (value, deps) = self.evaluate(id, &read)?;
        self.store.borrow_mut().slot_mut(id)?.cell = Some(AtomCell::new(value));
        self.link_deps(id, &[], &deps);

        trace!(atom = %id, deps = deps.len(), "derived cell materialized");
        Ok(())
    }

    /// Run a read function under a fresh tracked getter.
    ///
    /// Reads made through the global [`get`](crate::get) inside the read
    /// function do not leak into an enclosing render context.
    pub(crate) fn evaluate(&self, id: AtomId, read: &ReadFn) -> Result<(Value, DepList)> {
        let _guard = EvaluationGuard::enter(self, id)?;
        let _untracked = ReactiveContext::untracked();

        let getter = Getter::new(self, id);
        let value = read(&getter)?;
        Ok((value, getter.into_deps()))
    }

    /// Replace `owner`'s dependency list and fix up the reverse edges.
    pub(crate) fn link_deps(&self, owner: AtomId, old: &[AtomId], new: &[AtomId]) {
        let mut added = DepList::new();
        let mut removed = DepList::new();
        {
            let mut store = self.store.borrow_mut();

            for &dep in old.iter().filter(|d| !new.contains(d)) {
                if let Some(cell) = store.cell_mut(dep) {
                    cell.dependents.shift_remove(&owner);
                }
                removed.push(dep);
            }
            for &dep in new.iter().filter(|d| !old.contains(d)) {
                if let Some(cell) = store.cell_mut(dep) {
                    cell.dependents.insert(owner);
                }
                added.push(dep);
            }
            if let Some(cell) = store.cell_mut(owner) {
                cell.deps = new.iter().copied().collect();
            }
        }

        if !added.is_empty() || !removed.is_empty() {
            self.mirror_edges(owner, &added, &removed);
        }
    }

    /// Re-evaluate a derived atom in place.
    ///
    /// Returns whether its value changed. On change the new value is stored
    /// and the cell's subscribers are handed to the scheduler.
    pub(crate) fn recompute(&self, id: AtomId) -> Result<bool> {
        let (read, old_deps) = {
            let store = self.store.borrow();
            let slot = store.slot(id)?;
            let (Some(read), Some(cell)) = (slot.read_fn(), slot.cell.as_ref()) else {
                return Ok(false);
            };
            (read, cell.deps.clone())
        };

        let (value, deps) = self.evaluate(id, &read)?;
        self.link_deps(id, &old_deps, &deps);

        let callbacks = {
            let mut store = self.store.borrow_mut();
            let slot = store.slot_mut(id)?;
            let eq = slot.eq.clone();
            let Some(cell) = slot.cell.as_mut() else {
                return Ok(false);
            };
            if eq(&*cell.value, &*value) {
                trace!(atom = %id, "recomputed, unchanged");
                return Ok(false);
            }
            cell.value = value;
            cell.callbacks()
        };

        trace!(atom = %id, subscribers = callbacks.len(), "recomputed, changed");
        self.scheduler.enqueue(callbacks);
        Ok(true)
    }
}
