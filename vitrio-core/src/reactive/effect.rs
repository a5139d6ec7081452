//! Effect Implementation
//!
//! An Effect is a side-effecting consumer that re-runs whenever an atom it
//! read on its last run changes.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately inside a
//!    render context to establish initial dependencies.
//!
//! 2. When any dependency changes, the effect is enqueued with the
//!    scheduler and re-runs on the next flush.
//!
//! 3. Each run starts by releasing the previous run's dependencies and
//!    cleanups, so only atoms read this time trigger the next run.
//!
//! # Cleanup
//!
//! [`on_cleanup`] registers a closure with the running consumer. It runs
//! before the consumer's next invocation and when it is disposed, which is
//! where timers or listeners started by the effect get torn down.

use std::cell::Cell;
use std::rc::Rc;

use tracing::trace;

use super::context::ReactiveContext;
use super::runtime::{dispose_effect, with_render_context, Runtime};
use super::subscriber::{Callback, CallbackId};

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let count = create_source(0);
///
/// let effect = create_effect(move || {
///     println!("Count is: {}", get(&count).unwrap());
/// });
///
/// set(&count, 5)?;
/// flush();  // Prints: "Count is: 5"
/// ```
#[derive(Clone)]
pub struct Effect {
    callback: Callback,

    /// Whether the effect has been disposed.
    disposed: Rc<Cell<bool>>,

    /// Number of times the effect has run.
    run_count: Rc<Cell<usize>>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + 'static,
    {
        let effect = Self::new_lazy(run);
        effect.execute();
        effect
    }

    /// Create a new effect without running it immediately.
    pub fn new_lazy<F>(run: F) -> Self
    where
        F: Fn() + 'static,
    {
        let disposed = Rc::new(Cell::new(false));
        let run_count = Rc::new(Cell::new(0));

        let callback = {
            let disposed = disposed.clone();
            let run_count = run_count.clone();
            Callback::new(move || {
                if disposed.get() {
                    return;
                }
                run_count.set(run_count.get() + 1);
                run();
            })
        };

        Self {
            callback,
            disposed,
            run_count,
        }
    }

    pub fn id(&self) -> CallbackId {
        self.callback.id()
    }

    /// The consumer callback the scheduler re-runs.
    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    /// Run the effect now, re-tracking its dependencies.
    pub fn execute(&self) {
        if self.disposed.get() {
            return;
        }
        with_render_context(&self.callback);
    }

    /// Dispose of the effect.
    ///
    /// Its subscriptions are released and its cleanups run; it will not run
    /// again.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        dispose_effect(&self.callback);
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.run_count.get()
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id())
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Create and run an effect.
pub fn create_effect<F>(run: F) -> Effect
where
    F: Fn() + 'static,
{
    Effect::new(run)
}

/// Register `cleanup` with the running consumer.
///
/// Returns `false`, dropping the closure, when no consumer is running.
pub fn on_cleanup<F>(cleanup: F) -> bool
where
    F: FnOnce() + 'static,
{
    Runtime::with(|rt| rt.on_cleanup(Box::new(cleanup)))
}

/// Run `f` without subscribing the current consumer to anything it reads.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _untracked = ReactiveContext::untracked();
    trace!("untracked scope");
    f()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
