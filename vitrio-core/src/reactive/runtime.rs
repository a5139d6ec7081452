//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects atoms, consumers
//! and the scheduler. It owns the cell store and decides how a write is
//! propagated.
//!
//! # How It Works
//!
//! 1. Creating an atom allocates a slot; the cell materializes lazily.
//!
//! 2. When a consumer reads an atom inside a render context, the runtime
//!    records the atom in the consumer's dependency record and the consumer
//!    in the atom's subscribers.
//!
//! 3. When a source atom's value changes, the runtime:
//!    a. Stores the new value
//!    b. Hands the atom's subscribers to the scheduler
//!    c. Propagates to derived atoms with the active strategy
//!    d. Drains writes that were deferred while it was propagating
//!
//! # Thread Safety
//!
//! There is one runtime per thread, reached through [`Runtime::with`]. Atom
//! handles are `!Send`, so a handle always refers to the runtime of the
//! thread that created it. No locking is involved.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use indexmap::IndexSet;
use serde::Serialize;
use tracing::{debug, debug_span, trace, warn};

use crate::config::{BackendKind, EngineConfig};
use crate::error::{ReactiveError, Result};
use crate::graph::{BackendError, FlatGraph, PropagationBackend};

use super::atom::Atom;
use super::cell::{AtomDef, AtomId, CellStore, EqFn, Value};
use super::context::ReactiveContext;
use super::propagate::{Accelerated, Fallback};
use super::scheduler::Scheduler;
use super::subscriber::{Callback, CallbackId, Subscription};

thread_local! {
    static RUNTIME: Runtime = Runtime::new(EngineConfig::default());
}

/// What a render context recorded during its last invocation.
#[derive(Default)]
struct ConsumerRecord {
    deps: IndexSet<AtomId>,
    cleanups: Vec<Box<dyn FnOnce()>>,
}

/// The per-thread reactive runtime.
pub struct Runtime {
    pub(crate) store: RefCell<CellStore>,
    consumers: RefCell<HashMap<CallbackId, ConsumerRecord>>,
    pub(crate) scheduler: Scheduler,
    pub(crate) fallback: Fallback,
    pub(crate) accelerated: RefCell<Option<Rc<Accelerated>>>,

    /// Set while a propagation cycle is running.
    propagating: Cell<bool>,

    /// Writes made during propagation, propagated after the current cycle.
    deferred: RefCell<VecDeque<AtomId>>,

    max_flush_rounds: Cell<usize>,
}

/// Restores the `propagating` flag when a cycle ends, even on panic.
struct PropagationGuard<'rt> {
    rt: &'rt Runtime,
}

impl<'rt> PropagationGuard<'rt> {
    fn enter(rt: &'rt Runtime) -> Self {
        rt.propagating.set(true);
        Self { rt }
    }
}

impl Drop for PropagationGuard<'_> {
    fn drop(&mut self) {
        self.rt.propagating.set(false);
    }
}

impl Runtime {
    fn new(config: EngineConfig) -> Self {
        Self {
            store: RefCell::new(CellStore::default()),
            consumers: RefCell::new(HashMap::new()),
            scheduler: Scheduler::new(config.flush),
            fallback: Fallback::default(),
            accelerated: RefCell::new(None),
            propagating: Cell::new(false),
            deferred: RefCell::new(VecDeque::new()),
            max_flush_rounds: Cell::new(config.max_flush_rounds),
        }
    }

    /// Run `f` against this thread's runtime.
    pub fn with<R>(f: impl FnOnce(&Runtime) -> R) -> R {
        RUNTIME.with(f)
    }

    /// Like [`with`](Self::with), but returns `None` once the runtime has
    /// been torn down at thread exit.
    pub fn try_with<R>(f: impl FnOnce(&Runtime) -> R) -> Option<R> {
        RUNTIME.try_with(f).ok()
    }

    // -------------------------------------------------------------------------
    // Atoms
    // -------------------------------------------------------------------------

    pub(crate) fn create_atom(&self, def: AtomDef, eq: EqFn) -> AtomId {
        let id = self.store.borrow_mut().insert(def, eq);
        trace!(atom = %id, "atom created");
        id
    }

    pub(crate) fn is_derived(&self, id: AtomId) -> Result<bool> {
        Ok(self.store.borrow().slot(id)?.is_derived())
    }

    /// Current value of a materialized cell.
    pub(crate) fn read_value<T>(&self, id: AtomId) -> Result<T>
    where
        T: Clone + 'static,
    {
        let value = self.cell_value(id)?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or(ReactiveError::TypeMismatch(id))
    }

    fn cell_value(&self, id: AtomId) -> Result<Value> {
        self.store
            .borrow()
            .cell(id)
            .map(|cell| cell.value.clone())
            .ok_or(ReactiveError::UnknownAtom(id))
    }

    /// Read an atom, subscribing the current render context if there is one.
    pub fn get<T>(&self, atom: &Atom<T>) -> Result<T>
    where
        T: Clone + 'static,
    {
        let id = atom.id();
        self.ensure_cell(id)?;
        self.pull(id)?;

        if let Some(callback) = ReactiveContext::current() {
            let callback_id = callback.id();
            if let Some(cell) = self.store.borrow_mut().cell_mut(id) {
                cell.track(callback);
            }
            self.consumers
                .borrow_mut()
                .entry(callback_id)
                .or_default()
                .deps
                .insert(id);
        }

        self.read_value(id)
    }

    /// Write a source atom.
    pub fn set<T>(&self, atom: &Atom<T>, value: T) -> Result<()>
    where
        T: 'static,
    {
        self.write(atom.id(), Rc::new(value))
    }

    /// Write a source atom with a function of its current value.
    pub fn update<T, F>(&self, atom: &Atom<T>, f: F) -> Result<()>
    where
        T: 'static,
        F: FnOnce(&T) -> T,
    {
        let id = atom.id();
        self.check_writable(id)?;
        self.ensure_cell(id)?;

        let current = self.cell_value(id)?;
        let prev = current
            .downcast_ref::<T>()
            .ok_or(ReactiveError::TypeMismatch(id))?;
        let next = f(prev);
        self.write(id, Rc::new(next))
    }

    fn check_writable(&self, id: AtomId) -> Result<()> {
        if self.is_derived(id)? {
            return Err(ReactiveError::ReadOnlyAtom(id));
        }
        Ok(())
    }

    fn write(&self, id: AtomId, value: Value) -> Result<()> {
        self.check_writable(id)?;
        self.ensure_cell(id)?;

        let callbacks = {
            let mut store = self.store.borrow_mut();
            let slot = store.slot_mut(id)?;
            let eq = slot.eq.clone();
            let cell = slot.cell.as_mut().ok_or(ReactiveError::UnknownAtom(id))?;
            if eq(&*cell.value, &*value) {
                trace!(atom = %id, "write skipped, value unchanged");
                return Ok(());
            }
            cell.value = value;
            cell.callbacks()
        };

        // Value first, then subscribers, then dependents.
        self.scheduler.enqueue(callbacks);

        if self.propagating.get() {
            trace!(atom = %id, "write during propagation deferred");
            self.deferred.borrow_mut().push_back(id);
            return Ok(());
        }
        self.propagate_from(id)
    }

    /// Propagate from `source`, then from every write deferred meanwhile.
    ///
    /// A failing cycle does not stop the deferred ones; the first error is
    /// returned once the queue is empty.
    fn propagate_from(&self, source: AtomId) -> Result<()> {
        let _guard = PropagationGuard::enter(self);
        let mut first_error = None;
        let mut next = Some(source);

        while let Some(id) = next {
            if let Err(err) = self.propagate_once(id) {
                warn!(atom = %id, error = %err, "propagation aborted");
                first_error.get_or_insert(err);
            }
            next = self.deferred.borrow_mut().pop_front();
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Add `callback` as a manual listener of `atom`.
    ///
    /// Subscribing the same callback twice notifies it once per change, and
    /// it stays subscribed until both guards are dropped.
    pub fn subscribe<T>(&self, atom: &Atom<T>, callback: Callback) -> Result<Subscription> {
        let id = atom.id();
        self.ensure_cell(id)?;

        let callback_id = callback.id();
        if let Some(cell) = self.store.borrow_mut().cell_mut(id) {
            cell.listen(callback);
        }
        trace!(atom = %id, callback = callback_id.raw(), "subscribed");
        Ok(Subscription::new(id, callback_id))
    }

    pub(crate) fn unsubscribe(&self, atom: AtomId, callback: CallbackId) {
        if let Some(cell) = self.store.borrow_mut().cell_mut(atom) {
            cell.unlisten(callback);
        }
    }

    // -------------------------------------------------------------------------
    // Render contexts
    // -------------------------------------------------------------------------

    /// Invoke `callback` as a tracked consumer.
    ///
    /// The dependencies and cleanups of its previous invocation are released
    /// first, so after the call it is subscribed to exactly the atoms it
    /// read this time.
    pub fn with_render_context(&self, callback: &Callback) {
        self.release_consumer(callback.id());

        let _ctx = ReactiveContext::enter(callback.clone());
        callback.invoke();
    }

    /// Tear a consumer down. Safe to call repeatedly or for unknown
    /// callbacks.
    pub fn dispose_effect(&self, callback: &Callback) {
        let released = self.release_consumer(callback.id());
        let cancelled = self.scheduler.cancel(callback.id());
        debug!(
            callback = callback.id().raw(),
            released, cancelled, "consumer disposed"
        );
    }

    /// Unsubscribe a consumer from its recorded dependencies and run its
    /// cleanups. Returns whether anything was recorded.
    fn release_consumer(&self, id: CallbackId) -> bool {
        let Some(record) = self.consumers.borrow_mut().remove(&id) else {
            return false;
        };

        {
            let mut store = self.store.borrow_mut();
            for &dep in &record.deps {
                if let Some(cell) = store.cell_mut(dep) {
                    cell.untrack(id);
                }
            }
        }

        for cleanup in record.cleanups {
            cleanup();
        }
        true
    }

    /// Register a teardown closure with the current render context.
    pub(crate) fn on_cleanup(&self, cleanup: Box<dyn FnOnce()>) -> bool {
        let Some(callback) = ReactiveContext::current() else {
            debug!("on_cleanup called outside a render context; closure dropped");
            return false;
        };
        self.consumers
            .borrow_mut()
            .entry(callback.id())
            .or_default()
            .cleanups
            .push(cleanup);
        true
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Run every pending consumer once. Returns how many ran.
    pub fn flush(&self) -> usize {
        let pending = self.scheduler.take_pending();
        if pending.is_empty() {
            return 0;
        }

        let span = debug_span!("flush", callbacks = pending.len());
        let _enter = span.enter();
        for callback in pending.values() {
            self.with_render_context(callback);
        }
        pending.len()
    }

    /// Flush until no notifications are pending.
    ///
    /// Consumers that write during a flush schedule further rounds. Fails
    /// with [`ReactiveError::FlushLimit`] if the configured number of rounds
    /// is not enough.
    pub fn settle(&self) -> Result<usize> {
        let max_rounds = self.max_flush_rounds.get();
        let mut total = 0;
        for _ in 0..max_rounds {
            if self.scheduler.is_empty() {
                return Ok(total);
            }
            total += self.flush();
        }
        if self.scheduler.is_empty() {
            Ok(total)
        } else {
            Err(ReactiveError::FlushLimit(max_rounds))
        }
    }

    /// Run `f` as an explicit batch scope.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _batch = self.scheduler.enter_batch();
        let span = debug_span!("batch", depth = self.scheduler.batch_depth());
        let _enter = span.enter();
        f()
    }

    /// Check if a `batch` scope is open.
    pub fn in_batch(&self) -> bool {
        self.scheduler.batch_depth() > 0
    }

    /// Number of consumers waiting for the next flush.
    pub fn pending_notifications(&self) -> usize {
        self.scheduler.len()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.scheduler.is_flush_scheduled()
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Apply a configuration.
    ///
    /// A backend that cannot be created is logged and the fallback strategy
    /// stays in place; only a reconfiguration attempted during propagation
    /// is an error.
    pub fn configure(&self, config: &EngineConfig) -> Result<()> {
        if self.propagating.get() {
            return Err(BackendError::Unavailable(
                "cannot reconfigure during propagation".into(),
            )
            .into());
        }

        self.scheduler.set_mode(config.flush);
        self.max_flush_rounds.set(config.max_flush_rounds.max(1));

        match config.backend {
            BackendKind::None => self.remove_backend(),
            BackendKind::Flat => {
                let capacity = config.update_buffer_capacity;
                if let Err(err) = FlatGraph::with_capacity(capacity)
                    .map_err(ReactiveError::from)
                    .and_then(|graph| self.install_backend(Box::new(graph)))
                {
                    warn!(error = %err, "acceleration backend unavailable, using fallback propagation");
                }
            }
        }

        debug!(?config, "engine configured");
        Ok(())
    }

    /// Install an acceleration backend, replacing any previous one.
    ///
    /// Every materialized cell gets a node and every known edge is mirrored,
    /// so the backend starts out with the whole graph.
    pub fn install_backend(&self, backend: Box<dyn PropagationBackend>) -> Result<()> {
        if self.propagating.get() {
            return Err(BackendError::Unavailable(
                "cannot replace the backend during propagation".into(),
            )
            .into());
        }

        let acc = Rc::new(Accelerated::new(backend)?);
        let mut edges = 0;
        {
            let mut store = self.store.borrow_mut();
            for (id, slot) in store.slots_mut() {
                slot.accelerated_id = slot.cell.as_ref().map(|_| acc.create_node(id));
            }

            let store = &*store;
            for (id, cell) in store.cells() {
                let Some(owner) = store.slot(id).ok().and_then(|s| s.accelerated_id) else {
                    continue;
                };
                for &dep in &cell.deps {
                    if let Some(node) = store.slot(dep).ok().and_then(|s| s.accelerated_id) {
                        acc.add_edge(owner, node);
                        edges += 1;
                    }
                }
            }
        }

        debug!(nodes = acc.node_count(), edges, "acceleration backend installed");
        *self.accelerated.borrow_mut() = Some(acc);
        Ok(())
    }

    /// Go back to fallback propagation.
    pub fn remove_backend(&self) {
        if self.accelerated.borrow_mut().take().is_none() {
            return;
        }
        for (_, slot) in self.store.borrow_mut().slots_mut() {
            slot.accelerated_id = None;
        }
        debug!("acceleration backend removed");
    }

    pub fn has_backend(&self) -> bool {
        self.accelerated.borrow().is_some()
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Describe the cell behind `atom`, if it has materialized.
    pub fn atom_info<T>(&self, atom: &Atom<T>) -> Option<CellInfo> {
        self.cell_info(atom.id())
    }

    fn cell_info(&self, id: AtomId) -> Option<CellInfo> {
        let store = self.store.borrow();
        let slot = store.slot(id).ok()?;
        let cell = slot.cell.as_ref()?;
        Some(CellInfo {
            atom: id.raw(),
            derived: slot.is_derived(),
            deps: cell.deps.iter().map(|d| d.raw()).collect(),
            dependents: cell.dependents.iter().map(|d| d.raw()).collect(),
            subscribers: cell.subscribers.len(),
            node: slot.accelerated_id.map(|n| n.raw()),
        })
    }

    /// Snapshot of every materialized cell.
    pub fn graph_snapshot(&self) -> GraphSnapshot {
        let (atoms, ids): (usize, Vec<AtomId>) = {
            let store = self.store.borrow();
            (store.len(), store.cells().map(|(id, _)| id).collect())
        };
        GraphSnapshot {
            atoms,
            backend: self.has_backend(),
            pending: self.pending_notifications(),
            cells: ids.into_iter().filter_map(|id| self.cell_info(id)).collect(),
        }
    }
}

/// Debug view of one materialized cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellInfo {
    pub atom: u32,
    pub derived: bool,
    pub deps: Vec<u32>,
    pub dependents: Vec<u32>,
    pub subscribers: usize,

    /// Backend node id, when a backend is installed.
    pub node: Option<u32>,
}

/// Debug view of a runtime's graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    /// Atoms created, materialized or not.
    pub atoms: usize,
    pub backend: bool,
    pub pending: usize,
    pub cells: Vec<CellInfo>,
}

impl GraphSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// -----------------------------------------------------------------------------
// Free functions over the current thread's runtime
// -----------------------------------------------------------------------------

/// Invoke `callback` as a tracked consumer. See [`Runtime::with_render_context`].
pub fn with_render_context(callback: &Callback) {
    Runtime::with(|rt| rt.with_render_context(callback))
}

/// Tear a consumer down. See [`Runtime::dispose_effect`].
pub fn dispose_effect(callback: &Callback) {
    Runtime::with(|rt| rt.dispose_effect(callback))
}

/// Run `f` as an explicit batch scope and return its result.
///
/// Writes inside still only enqueue notifications; the one flush that
/// follows runs each affected consumer once.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Runtime::with(|rt| rt.batch(f))
}

/// Run every pending consumer once.
pub fn flush() -> usize {
    Runtime::with(|rt| rt.flush())
}

/// Flush until nothing is pending.
pub fn settle() -> Result<usize> {
    Runtime::with(|rt| rt.settle())
}

/// Apply `config` to this thread's runtime.
pub fn configure(config: EngineConfig) -> Result<()> {
    Runtime::with(|rt| rt.configure(&config))
}

pub fn atom_info<T>(atom: &Atom<T>) -> Option<CellInfo> {
    Runtime::with(|rt| rt.atom_info(atom))
}

pub fn graph_snapshot() -> GraphSnapshot {
    Runtime::with(|rt| rt.graph_snapshot())
}

pub fn pending_notifications() -> usize {
    Runtime::with(|rt| rt.pending_notifications())
}

pub fn is_flush_scheduled() -> bool {
    Runtime::with(|rt| rt.is_flush_scheduled())
}
