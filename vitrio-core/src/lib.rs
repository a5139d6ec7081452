//! Vitrio Core
//!
//! This crate provides the reactive state engine behind the Vitrio UI
//! framework. It implements:
//!
//! - Source and derived atoms with automatic dependency discovery
//! - Glitch-free, push-based change propagation
//! - An optional acceleration backend over a flat, integer-indexed graph
//! - Batched notification of consumers
//!
//! DOM construction, routing and rendering are consumers of this crate and
//! live elsewhere.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Atoms, dependency tracking, consumers and the runtime
//! - `graph`: The acceleration backend boundary and its flat implementation
//! - `config`: Engine configuration
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use vitrio_core::{create_derived, create_effect, create_source, flush, get, set};
//!
//! // Create a source atom
//! let count = create_source(0);
//!
//! // Create a derived value
//! let doubled = create_derived(move |get| Ok(get.get(&count)? * 2));
//!
//! // Create an effect
//! let _effect = create_effect(move || {
//!     println!("Count: {}, Doubled: {}", get(&count).unwrap(), get(&doubled).unwrap());
//! });
//!
//! // Update the source; derived values are current immediately
//! set(&count, 5)?;
//! assert_eq!(get(&doubled)?, 10);
//!
//! // Consumers run on the next flush, prints: "Count: 5, Doubled: 10"
//! flush();
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{BackendKind, EngineConfig, FlushMode};
pub use error::{ReactiveError, Result};
pub use reactive::{
    atom_info, batch, configure, create_derived, create_derived_with, create_effect,
    create_source, create_source_with, dispose_effect, flush, get, graph_snapshot,
    is_flush_scheduled, on_cleanup, pending_notifications, run_local, set, settle, subscribe,
    untrack, update, use_atom, with_render_context, Atom, AtomId, Callback, CallbackId, Effect, Getter, Runtime,
    Subscription,
};
