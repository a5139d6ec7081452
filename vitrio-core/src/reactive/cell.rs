//! Cell Store
//!
//! Every atom is an index into a per-thread arena of slots. A slot holds
//! the atom's definition (initial value or read function) and, once the
//! atom has been touched, its [`AtomCell`]: the runtime record with the
//! current value, subscribers and dependency edges.
//!
//! # Memory Layout
//!
//! Values are type-erased behind `Rc<dyn Any>` so that a single arena can
//! hold atoms of every type. Typed [`Atom`](super::Atom) handles downcast
//! on the way out. Edges are stored as arena indices, never as pointers,
//! so the graph has no ownership cycles.
//!
//! Cells are created at most once per atom and never destroyed.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use crate::error::{ReactiveError, Result};
use crate::graph::NodeId;

use super::subscriber::{Callback, CallbackId};
use super::tracker::Getter;

/// Identity of an atom within its thread's runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u32);

impl AtomId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type Value = Rc<dyn Any>;
pub(crate) type ReadFn = Rc<dyn Fn(&Getter<'_>) -> Result<Value>>;
pub(crate) type EqFn = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// Equality for type-erased values backed by `T: PartialEq`.
pub(crate) fn eq_fn<T, F>(eq: F) -> EqFn
where
    T: 'static,
    F: Fn(&T, &T) -> bool + 'static,
{
    Rc::new(move |a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => eq(a, b),
        _ => false,
    })
}

/// How an atom obtains its value.
pub(crate) enum AtomDef {
    /// Holds an initial value; changed only by writes.
    Source { init: Value },

    /// Computed from other atoms; never written directly.
    Derived { read: ReadFn },
}

/// One subscriber of a cell.
///
/// A callback can be subscribed both by hand ([`subscribe`](crate::subscribe))
/// and by a render context reading the atom. The two registrations have
/// independent lifetimes; the entry goes away when neither remains. Manual
/// registrations are counted, so each [`Subscription`](crate::Subscription)
/// guard releases only its own.
#[derive(Debug, Clone)]
pub(crate) struct SubscriberEntry {
    pub callback: Callback,
    pub manual: u32,
    pub tracked: bool,
}

/// Per-propagation bookkeeping, stamped with the cycle's epoch.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Mark {
    /// Epoch of the last propagation that reached this cell.
    pub epoch: u64,

    /// Affected dependencies still to be processed in that propagation.
    pub pending: u32,

    /// Whether an affected dependency changed in that propagation.
    pub dirty: bool,

    /// Whether that propagation has already brought this cell up to date.
    pub done: bool,
}

/// Runtime record of a materialized atom.
pub(crate) struct AtomCell {
    /// Last computed or assigned value.
    pub value: Value,

    /// Consumers to notify on change, in registration order.
    pub subscribers: IndexMap<CallbackId, SubscriberEntry>,

    /// Atoms read by the last evaluation (derived atoms only).
    pub deps: SmallVec<[AtomId; 4]>,

    /// Atoms whose last evaluation read this one.
    pub dependents: IndexSet<AtomId>,

    pub mark: Mark,
}

impl AtomCell {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            subscribers: IndexMap::new(),
            deps: SmallVec::new(),
            dependents: IndexSet::new(),
            mark: Mark::default(),
        }
    }

    /// Register `callback` through a render context.
    pub fn track(&mut self, callback: Callback) {
        self.subscribers
            .entry(callback.id())
            .or_insert_with(|| SubscriberEntry {
                callback,
                manual: 0,
                tracked: false,
            })
            .tracked = true;
    }

    /// Register `callback` as a manual listener.
    pub fn listen(&mut self, callback: Callback) {
        self.subscribers
            .entry(callback.id())
            .or_insert_with(|| SubscriberEntry {
                callback,
                manual: 0,
                tracked: false,
            })
            .manual += 1;
    }

    /// Drop the render-context registration of `id`.
    pub fn untrack(&mut self, id: CallbackId) {
        if let Some(entry) = self.subscribers.get_mut(&id) {
            entry.tracked = false;
            if entry.manual == 0 {
                self.subscribers.shift_remove(&id);
            }
        }
    }

    /// Drop one manual registration of `id`.
    pub fn unlisten(&mut self, id: CallbackId) {
        if let Some(entry) = self.subscribers.get_mut(&id) {
            entry.manual = entry.manual.saturating_sub(1);
            if entry.manual == 0 && !entry.tracked {
                self.subscribers.shift_remove(&id);
            }
        }
    }

    /// Snapshot of the callbacks to notify.
    pub fn callbacks(&self) -> Vec<Callback> {
        self.subscribers
            .values()
            .map(|entry| entry.callback.clone())
            .collect()
    }
}

/// An arena slot.
pub(crate) struct Slot {
    pub def: AtomDef,
    pub eq: EqFn,
    pub cell: Option<AtomCell>,

    /// Identity in the acceleration backend; assigned once per backend.
    pub accelerated_id: Option<NodeId>,

    /// Set while the read function runs; re-entry is a cycle.
    pub evaluating: bool,
}

impl Slot {
    pub fn is_derived(&self) -> bool {
        matches!(self.def, AtomDef::Derived { .. })
    }

    /// Read function, for derived atoms.
    pub fn read_fn(&self) -> Option<ReadFn> {
        match &self.def {
            AtomDef::Derived { read } => Some(read.clone()),
            AtomDef::Source { .. } => None,
        }
    }
}

/// The arena of atom slots owned by a runtime.
#[derive(Default)]
pub(crate) struct CellStore {
    slots: Vec<Slot>,
}

impl CellStore {
    /// Allocate a slot. The cell materializes later.
    pub fn insert(&mut self, def: AtomDef, eq: EqFn) -> AtomId {
        let id = AtomId(self.slots.len() as u32);
        self.slots.push(Slot {
            def,
            eq,
            cell: None,
            accelerated_id: None,
            evaluating: false,
        });
        id
    }

    pub fn slot(&self, id: AtomId) -> Result<&Slot> {
        self.slots
            .get(id.index())
            .ok_or(ReactiveError::UnknownAtom(id))
    }

    pub fn slot_mut(&mut self, id: AtomId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.index())
            .ok_or(ReactiveError::UnknownAtom(id))
    }

    pub fn cell(&self, id: AtomId) -> Option<&AtomCell> {
        self.slots.get(id.index())?.cell.as_ref()
    }

    pub fn cell_mut(&mut self, id: AtomId) -> Option<&mut AtomCell> {
        self.slots.get_mut(id.index())?.cell.as_mut()
    }

    /// Number of atoms ever created.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// All materialized cells, in creation order.
    pub fn cells(&self) -> impl Iterator<Item = (AtomId, &AtomCell)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| Some((AtomId(i as u32), slot.cell.as_ref()?)))
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = (AtomId, &mut Slot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| (AtomId(i as u32), slot))
    }
}
