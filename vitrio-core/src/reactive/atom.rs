//! Atom Handles
//!
//! An [`Atom<T>`] is the identity of a reactive value. It is a small `Copy`
//! handle into the current thread's runtime; the value itself lives in the
//! runtime's cell store.
//!
//! # Kinds
//!
//! - *Source* atoms hold an initial value and change only through
//!   [`set`] and [`update`].
//! - *Derived* atoms hold a read function and are recomputed whenever an
//!   atom they read changes. Writing to one is an error.
//!
//! # Change Detection
//!
//! By default a write or recomputation that produces a value equal (by
//! `PartialEq`) to the current one is a no-op: no propagation and no
//! notification. The `_with` constructors take a custom equality instead,
//! for types without `PartialEq` or where `PartialEq` is too weak (e.g.
//! floats, where `NaN != NaN`).
//!
//! # Example
//!
//! ```rust,ignore
//! let count = create_source(0);
//! let doubled = create_derived(move |get| Ok(get.get(&count)? * 2));
//!
//! assert_eq!(get(&doubled)?, 0);
//! set(&count, 5)?;
//! assert_eq!(get(&doubled)?, 10);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::Result;

use super::cell::{eq_fn, AtomDef, AtomId, ReadFn, Value};
use super::runtime::Runtime;
use super::subscriber::{Callback, Subscription};
use super::tracker::Getter;

/// A typed handle to a reactive value.
///
/// Handles are `!Send`: an atom belongs to the thread that created it.
pub struct Atom<T> {
    id: AtomId,
    _marker: PhantomData<(fn() -> T, Rc<()>)>,
}

impl<T> Atom<T> {
    fn from_id(id: AtomId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the atom's ID.
    pub fn id(&self) -> AtomId {
        self.id
    }

    /// Check if the atom is derived (read-only).
    pub fn is_derived(&self) -> bool {
        Runtime::with(|rt| rt.is_derived(self.id)).unwrap_or(false)
    }
}

impl<T> Atom<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a source atom.
    pub fn source(initial: T) -> Self {
        Self::source_with(initial, <T as PartialEq>::eq)
    }

    /// Create a derived atom.
    pub fn derived<F>(read: F) -> Self
    where
        F: Fn(&Getter<'_>) -> Result<T> + 'static,
    {
        Self::derived_with(read, <T as PartialEq>::eq)
    }
}

impl<T> Atom<T>
where
    T: Clone + 'static,
{
    /// Create a source atom with a custom change test.
    ///
    /// `eq(old, new)` returning `true` makes a write a no-op.
    pub fn source_with<E>(initial: T, eq: E) -> Self
    where
        E: Fn(&T, &T) -> bool + 'static,
    {
        let init: Value = Rc::new(initial);
        let id = Runtime::with(|rt| rt.create_atom(AtomDef::Source { init }, eq_fn(eq)));
        Self::from_id(id)
    }

    /// Create a derived atom with a custom change test.
    pub fn derived_with<F, E>(read: F, eq: E) -> Self
    where
        F: Fn(&Getter<'_>) -> Result<T> + 'static,
        E: Fn(&T, &T) -> bool + 'static,
    {
        let read: ReadFn = Rc::new(move |get: &Getter<'_>| -> Result<Value> {
            let value: Value = Rc::new(read(get)?);
            Ok(value)
        });
        let id = Runtime::with(|rt| rt.create_atom(AtomDef::Derived { read }, eq_fn(eq)));
        Self::from_id(id)
    }

    /// Get the current value.
    ///
    /// If called within a render context, this also subscribes the current
    /// consumer to the atom.
    pub fn get(&self) -> Result<T> {
        Runtime::with(|rt| rt.get(self))
    }

    /// Set a new value.
    pub fn set(&self, value: T) -> Result<()> {
        Runtime::with(|rt| rt.set(self, value))
    }

    /// Set a new value computed from the current one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        Runtime::with(|rt| rt.update(self, f))
    }

    /// Read the value together with a setter for it.
    ///
    /// The read subscribes the current render context like [`get`](Self::get),
    /// so a consumer can both display and write an atom in one call.
    pub fn use_atom(&self) -> Result<(T, impl Fn(T) -> Result<()>)> {
        Ok((self.get()?, self.use_set()))
    }

    /// A setter for this atom, without reading it.
    pub fn use_set(&self) -> impl Fn(T) -> Result<()> {
        let atom = *self;
        move |value: T| atom.set(value)
    }

    /// Call `f` after every flush that follows a change of this atom.
    pub fn subscribe<F>(&self, f: F) -> Result<Subscription>
    where
        F: Fn() + 'static,
    {
        Runtime::with(|rt| rt.subscribe(self, Callback::new(f)))
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Atom<T> {}

impl<T> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Atom<T> {}

impl<T> Hash for Atom<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom").field("id", &self.id).finish()
    }
}

// ----------------------------------------------------------------------------
// Free functions
// ----------------------------------------------------------------------------

/// Create a source atom. See [`Atom::source`].
pub fn create_source<T>(initial: T) -> Atom<T>
where
    T: Clone + PartialEq + 'static,
{
    Atom::source(initial)
}

/// Create a source atom with a custom change test.
pub fn create_source_with<T, E>(initial: T, eq: E) -> Atom<T>
where
    T: Clone + 'static,
    E: Fn(&T, &T) -> bool + 'static,
{
    Atom::source_with(initial, eq)
}

/// Create a derived atom. See [`Atom::derived`].
pub fn create_derived<T, F>(read: F) -> Atom<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn(&Getter<'_>) -> Result<T> + 'static,
{
    Atom::derived(read)
}

/// Create a derived atom with a custom change test.
pub fn create_derived_with<T, F, E>(read: F, eq: E) -> Atom<T>
where
    T: Clone + 'static,
    F: Fn(&Getter<'_>) -> Result<T> + 'static,
    E: Fn(&T, &T) -> bool + 'static,
{
    Atom::derived_with(read, eq)
}

/// Read an atom, materializing it on first access.
///
/// Inside a render context the current consumer is subscribed. Errors from
/// read functions are returned untouched.
pub fn get<T>(atom: &Atom<T>) -> Result<T>
where
    T: Clone + 'static,
{
    Runtime::with(|rt| rt.get(atom))
}

/// Write a source atom.
///
/// Derived atoms depending on it are brought up to date before this
/// returns; subscribers are only enqueued.
pub fn set<T>(atom: &Atom<T>, value: T) -> Result<()>
where
    T: 'static,
{
    Runtime::with(|rt| rt.set(atom, value))
}

/// Write a source atom with a function of its current value.
pub fn update<T, F>(atom: &Atom<T>, f: F) -> Result<()>
where
    T: 'static,
    F: FnOnce(&T) -> T,
{
    Runtime::with(|rt| rt.update(atom, f))
}

/// Read `atom` and get a setter for it. See [`Atom::use_atom`].
pub fn use_atom<T>(atom: &Atom<T>) -> Result<(T, impl Fn(T) -> Result<()>)>
where
    T: Clone + 'static,
{
    atom.use_atom()
}

/// Add `callback` as a manual listener of `atom`.
///
/// The listener is removed when the returned [`Subscription`] is dropped.
pub fn subscribe<T>(atom: &Atom<T>, callback: Callback) -> Result<Subscription> {
    Runtime::with(|rt| rt.subscribe(atom, callback))
}
