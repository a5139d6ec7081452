//! Reactive Primitives
//!
//! This module implements the reactive engine: atoms, derivations,
//! consumers and the scheduler that notifies them.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An atom is the identity of a reactive value. Source atoms hold state and
//! are written with `set`; derived atoms compute their value from other
//! atoms through a read function, and are recomputed synchronously inside
//! the `set` that invalidated them.
//!
//! ## Consumers
//!
//! A consumer is a [`Callback`] run inside a render context. Every atom it
//! reads subscribes it; when one of those atoms changes, it is enqueued and
//! re-run on the next flush, with its subscriptions rebuilt from scratch.
//! [`Effect`] is a consumer that owns its callback.
//!
//! ## Scheduling
//!
//! Writes never run consumers directly. Notifications collect in a pending
//! set that is flushed once, so a burst of writes runs each affected
//! consumer exactly once.
//!
//! # Implementation Notes
//!
//! All state lives in a thread-local [`Runtime`]: an arena of cells
//! indexed by [`AtomId`], plus a thread-local stack of render contexts.
//! Derived values are kept up to date by push-based propagation, either
//! in process or through an acceleration backend (see [`crate::graph`]).

mod atom;
mod cell;
mod context;
mod effect;
mod propagate;
mod runtime;
mod scheduler;
mod subscriber;
mod tracker;

pub use atom::{
    create_derived, create_derived_with, create_source, create_source_with, get, set, subscribe,
    update, use_atom, Atom,
};
pub use cell::AtomId;
pub use context::ReactiveContext;
pub use effect::{create_effect, on_cleanup, untrack, Effect};
pub use propagate::PropagationStats;
pub use runtime::{
    atom_info, batch, configure, dispose_effect, flush, graph_snapshot, is_flush_scheduled,
    pending_notifications, settle, with_render_context, CellInfo, GraphSnapshot, Runtime,
};
pub use scheduler::run_local;
pub use subscriber::{Callback, CallbackId, Subscription};
pub use tracker::Getter;
