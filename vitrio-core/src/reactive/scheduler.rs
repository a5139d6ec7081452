//! Notification Scheduler
//!
//! Writes never run consumers synchronously. Subscribers of every cell that
//! changed are added to a pending set, and the set is flushed later in one
//! go. A flush is requested only when the set goes from empty to non-empty,
//! so any number of writes in the same turn produce a single flush and each
//! consumer runs once per flush, however many of its atoms changed.
//!
//! How the flush actually happens depends on [`FlushMode`]:
//!
//! - `Manual`: the host's event loop calls [`flush`](crate::flush) or
//!   [`settle`](crate::settle).
//! - `LocalTask`: a `tokio` local task is spawned to flush, the closest
//!   thing to a microtask on a single-threaded executor. The task can only
//!   be spawned while a `LocalSet` driven by [`run_local`] is being polled;
//!   anywhere else the engine warns once and the flush is left to the host.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use indexmap::IndexMap;
use tokio::task::LocalSet;
use tracing::{trace, warn};

use crate::config::FlushMode;

use super::runtime::Runtime;
use super::subscriber::{Callback, CallbackId};

thread_local! {
    /// Nesting depth of `run_local` polls on this thread.
    static LOCAL_SET_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn in_local_set() -> bool {
    LOCAL_SET_DEPTH.with(|depth| depth.get() > 0)
}

/// Marks the thread as inside a `LocalSet` while held.
struct LocalSetMarker;

impl LocalSetMarker {
    fn enter() -> Self {
        LOCAL_SET_DEPTH.with(|depth| depth.set(depth.get() + 1));
        LocalSetMarker
    }
}

impl Drop for LocalSetMarker {
    fn drop(&mut self) {
        let _ = LOCAL_SET_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Future returned by [`run_local`].
struct RunLocal<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for RunLocal<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _marker = LocalSetMarker::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Drive `future` on `local`, letting [`FlushMode::LocalTask`] spawn its
/// flush tasks there.
///
/// # Example
///
/// ```rust,ignore
/// let local = tokio::task::LocalSet::new();
/// vitrio_core::run_local(&local, async {
///     vitrio_core::set(&count, 1)?;
///     tokio::task::yield_now().await; // the flush runs here
///     Ok::<_, vitrio_core::ReactiveError>(())
/// })
/// .await?;
/// ```
pub async fn run_local<F: Future>(local: &LocalSet, future: F) -> F::Output {
    RunLocal {
        inner: Box::pin(local.run_until(future)),
    }
    .await
}

pub(crate) struct Scheduler {
    /// Consumers waiting for the next flush, in notification order.
    pending: RefCell<IndexMap<CallbackId, Callback>>,

    /// Whether a flush has been requested and not yet started.
    flush_scheduled: Cell<bool>,

    mode: Cell<FlushMode>,

    /// Nesting depth of `batch` scopes.
    batch_depth: Cell<usize>,
}

impl Scheduler {
    pub fn new(mode: FlushMode) -> Self {
        Self {
            pending: RefCell::new(IndexMap::new()),
            flush_scheduled: Cell::new(false),
            mode: Cell::new(mode),
            batch_depth: Cell::new(0),
        }
    }

    pub fn set_mode(&self, mode: FlushMode) {
        self.mode.set(mode);
    }

    /// Add callbacks to the pending set and request a flush if needed.
    pub fn enqueue(&self, callbacks: Vec<Callback>) {
        if callbacks.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.borrow_mut();
            for callback in callbacks {
                pending.entry(callback.id()).or_insert(callback);
            }
        }
        self.request_flush();
    }

    fn request_flush(&self) {
        if self.flush_scheduled.replace(true) {
            return;
        }

        match self.mode.get() {
            FlushMode::Manual => trace!("flush requested"),
            FlushMode::LocalTask => {
                if tokio::runtime::Handle::try_current().is_err() {
                    warn!("no tokio runtime on this thread; pending notifications wait for a manual flush");
                    return;
                }
                if !in_local_set() {
                    warn!("not inside run_local; pending notifications wait for a manual flush");
                    return;
                }
                tokio::task::spawn_local(async {
                    let _ = Runtime::try_with(|rt| rt.flush());
                });
            }
        }
    }

    /// Take the pending set, leaving it empty.
    ///
    /// Clears the scheduled flag first, so callbacks that write during the
    /// flush request a fresh one.
    pub fn take_pending(&self) -> IndexMap<CallbackId, Callback> {
        self.flush_scheduled.set(false);
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    /// Drop a consumer from the pending set.
    pub fn cancel(&self, id: CallbackId) -> bool {
        self.pending.borrow_mut().shift_remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled.get()
    }

    pub fn batch_depth(&self) -> usize {
        self.batch_depth.get()
    }

    pub fn enter_batch(&self) -> BatchGuard<'_> {
        self.batch_depth.set(self.batch_depth.get() + 1);
        BatchGuard { scheduler: self }
    }
}

/// Keeps the batch depth balanced, even on panic.
pub(crate) struct BatchGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let depth = &self.scheduler.batch_depth;
        depth.set(depth.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn enqueue_deduplicates_and_keeps_order() {
        let scheduler = Scheduler::new(FlushMode::Manual);
        let a = Callback::new(|| {});
        let b = Callback::new(|| {});

        scheduler.enqueue(vec![a.clone(), b.clone()]);
        scheduler.enqueue(vec![a.clone()]);

        assert_eq!(scheduler.len(), 2);
        let pending = scheduler.take_pending();
        assert_eq!(pending.keys().copied().collect::<Vec<_>>(), vec![a.id(), b.id()]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn flush_is_requested_once_until_taken() {
        let scheduler = Scheduler::new(FlushMode::Manual);
        assert!(!scheduler.is_flush_scheduled());

        scheduler.enqueue(vec![Callback::new(|| {})]);
        assert!(scheduler.is_flush_scheduled());

        scheduler.take_pending();
        assert!(!scheduler.is_flush_scheduled());
    }

    #[test]
    fn empty_enqueue_requests_nothing() {
        let scheduler = Scheduler::new(FlushMode::Manual);
        scheduler.enqueue(Vec::new());
        assert!(!scheduler.is_flush_scheduled());
    }

    #[test]
    fn cancel_removes_pending_consumer() {
        let scheduler = Scheduler::new(FlushMode::Manual);
        let cb = Callback::new(|| {});
        scheduler.enqueue(vec![cb.clone()]);

        assert!(scheduler.cancel(cb.id()));
        assert!(!scheduler.cancel(cb.id()));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn local_task_mode_without_runtime_falls_back_to_manual() {
        let scheduler = Scheduler::new(FlushMode::LocalTask);
        let hits = Rc::new(std::cell::Cell::new(0));
        let hits_clone = hits.clone();
        scheduler.enqueue(vec![Callback::new(move || hits_clone.set(hits_clone.get() + 1))]);

        assert!(scheduler.is_flush_scheduled());
        for cb in scheduler.take_pending().values() {
            cb.invoke();
        }
        assert_eq!(hits.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_task_mode_outside_local_set_falls_back_to_manual() {
        let scheduler = Scheduler::new(FlushMode::LocalTask);
        scheduler.enqueue(vec![Callback::new(|| {})]);

        assert!(!in_local_set());
        assert!(scheduler.is_flush_scheduled());
        assert_eq!(scheduler.take_pending().len(), 1);
    }

    #[tokio::test]
    async fn marker_is_set_only_while_the_local_set_is_polled() {
        assert!(!in_local_set());
        let local = LocalSet::new();
        let inside = run_local(&local, async { in_local_set() }).await;
        assert!(inside);
        assert!(!in_local_set());
    }

    #[test]
    fn batch_guard_restores_depth() {
        let scheduler = Scheduler::new(FlushMode::Manual);
        {
            let _outer = scheduler.enter_batch();
            let _inner = scheduler.enter_batch();
            assert_eq!(scheduler.batch_depth(), 2);
        }
        assert_eq!(scheduler.batch_depth(), 0);
    }
}
