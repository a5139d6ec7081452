//! Render Context
//!
//! The render context tracks which consumer is currently running. When an
//! atom is read through [`get`](crate::get) while a consumer is on top of
//! the stack, that consumer becomes a subscriber of the atom.
//!
//! # Implementation
//!
//! We use a thread-local stack. Entering a consumer pushes a tracking entry;
//! the returned guard pops it when dropped, even if the consumer panics.
//! Nested consumers (a component rendering inside another) simply stack.
//!
//! Derived-atom evaluation and [`untrack`](crate::untrack) push an
//! *untracked* entry, which hides the consumer below it.

use std::cell::RefCell;

use super::subscriber::{Callback, CallbackId};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the render context stack.
#[derive(Debug, Clone)]
enum ContextEntry {
    /// A consumer is running; reads subscribe it.
    Tracking(Callback),

    /// Reads register nothing.
    Untracked,
}

impl ContextEntry {
    fn callback_id(&self) -> Option<CallbackId> {
        match self {
            ContextEntry::Tracking(cb) => Some(cb.id()),
            ContextEntry::Untracked => None,
        }
    }
}

/// Guard that pops the context when dropped.
pub struct ReactiveContext {
    callback: Option<CallbackId>,
}

impl ReactiveContext {
    /// Make `callback` the current consumer until the guard is dropped.
    pub fn enter(callback: Callback) -> Self {
        let id = callback.id();
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(ContextEntry::Tracking(callback)));
        Self { callback: Some(id) }
    }

    /// Suspend tracking until the guard is dropped.
    pub fn untracked() -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(ContextEntry::Untracked));
        Self { callback: None }
    }

    /// Check if a consumer is currently tracking reads.
    pub fn is_active() -> bool {
        Self::current().is_some()
    }

    /// Get the current consumer, if any.
    pub fn current() -> Option<Callback> {
        CONTEXT_STACK.with(|stack| match stack.borrow().last() {
            Some(ContextEntry::Tracking(cb)) => Some(cb.clone()),
            _ => None,
        })
    }

    /// Number of entries on the stack.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.callback_id(),
                    self.callback,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.callback,
                    entry.callback_id()
                );
            }
        });
    }
}
