//! Subscriber types for the reactive system.
//!
//! A consumer is any callback that wants to hear about changes: a component
//! render function, an effect, or a raw [`subscribe`](crate::subscribe)
//! listener. Closures have no identity of their own, so every consumer is
//! wrapped in a [`Callback`] carrying a unique [`CallbackId`].

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::cell::AtomId;
use super::runtime::Runtime;

/// Unique identifier for a consumer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Generate a new unique callback ID.
    ///
    /// Uses an atomic counter so ids stay unique across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer callback with a stable identity.
///
/// Cloning a `Callback` yields the same consumer: clones compare equal and
/// share subscriptions.
#[derive(Clone)]
pub struct Callback {
    id: CallbackId,
    run: Rc<dyn Fn()>,
}

impl Callback {
    /// Wrap a closure as a new consumer.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + 'static,
    {
        Self {
            id: CallbackId::new(),
            run: Rc::new(run),
        }
    }

    /// Get the callback's unique ID.
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Invoke the callback directly, without a render context.
    pub fn invoke(&self) {
        (self.run)();
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Callback {}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish()
    }
}

/// Handle returned by [`subscribe`](crate::subscribe).
///
/// Dropping this handle removes the listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    atom: AtomId,
    callback: CallbackId,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(atom: AtomId, callback: CallbackId) -> Self {
        Self {
            atom,
            callback,
            active: true,
        }
    }

    /// The atom this subscription listens to.
    pub fn atom(&self) -> AtomId {
        self.atom
    }

    /// Identity of the subscribed callback.
    pub fn callback_id(&self) -> CallbackId {
        self.callback
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        // The runtime may already be gone during thread teardown.
        let (atom, callback) = (self.atom, self.callback);
        let _ = Runtime::try_with(|rt| rt.unsubscribe(atom, callback));
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
