//! Integration Tests for the Reactive Engine
//!
//! These tests verify that atoms, propagation, consumers and the scheduler
//! work together, with and without the acceleration backend.
//!
//! Every test runs on its own thread, so each starts with a fresh runtime.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use proptest::prelude::*;
use vitrio_core::graph::{LinearMemory, NodeId, PropagationBackend};
use vitrio_core::{
    atom_info, batch, configure, create_derived, create_effect, create_source,
    create_source_with, dispose_effect, flush, get, is_flush_scheduled, on_cleanup,
    pending_notifications, run_local, set, subscribe, update, with_render_context, Atom, BackendKind,
    Callback, EngineConfig, FlushMode, ReactiveError, Runtime,
};

fn counter() -> (Callback, Rc<Cell<usize>>) {
    let hits = Rc::new(Cell::new(0));
    let hits_clone = hits.clone();
    (Callback::new(move || hits_clone.set(hits_clone.get() + 1)), hits)
}

fn use_flat_backend() {
    configure(EngineConfig::default().with_backend(BackendKind::Flat)).unwrap();
    assert!(Runtime::with(|rt| rt.has_backend()));
}

/// Derived atom that counts its own evaluations.
fn counted<T, F>(runs: &Rc<Cell<usize>>, read: F) -> Atom<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn(&vitrio_core::Getter<'_>) -> vitrio_core::Result<T> + 'static,
{
    let runs = runs.clone();
    create_derived(move |get| {
        runs.set(runs.get() + 1);
        read(get)
    })
}

// ----------------------------------------------------------------------------
// Atoms and propagation
// ----------------------------------------------------------------------------

#[test]
fn count_doubled_scenario() {
    let runs = Rc::new(Cell::new(0));
    let count = create_source(0);
    let doubled = counted(&runs, move |get| Ok(get.get(&count)? * 2));

    assert_eq!(get(&doubled).unwrap(), 0);
    set(&count, 5).unwrap();
    assert_eq!(get(&doubled).unwrap(), 10);
    assert_eq!(runs.get(), 2);

    // Same value again: nothing is recomputed.
    set(&count, 5).unwrap();
    assert_eq!(get(&doubled).unwrap(), 10);
    assert_eq!(runs.get(), 2);
}

#[test]
fn equal_write_recomputes_and_notifies_nothing() {
    let runs = Rc::new(Cell::new(0));
    let a = create_source(String::from("x"));
    let upper = counted(&runs, move |get| Ok(get.get(&a)?.to_uppercase()));
    assert_eq!(get(&upper).unwrap(), "X");

    let (cb, hits) = counter();
    let _sub = subscribe(&upper, cb).unwrap();

    set(&a, String::from("x")).unwrap();
    assert_eq!(runs.get(), 1);
    assert_eq!(pending_notifications(), 0);
    assert!(!is_flush_scheduled());
    flush();
    assert_eq!(hits.get(), 0);
}

fn diamond_runs_sink_once() {
    let runs = Rc::new(Cell::new(0));
    let a = create_source(1);
    let b = create_derived(move |get| Ok(get.get(&a)? + 1));
    let c = create_derived(move |get| Ok(get.get(&a)? * 2));
    let d = counted(&runs, move |get| Ok(get.get(&b)? + get.get(&c)?));

    assert_eq!(get(&d).unwrap(), 4);
    set(&a, 5).unwrap();

    // b = 6 and c = 10, both from the same a.
    assert_eq!(get(&d).unwrap(), 16);
    assert_eq!(runs.get(), 2);
}

#[test]
fn diamond_consistency_fallback() {
    diamond_runs_sink_once();
}

#[test]
fn diamond_consistency_accelerated() {
    use_flat_backend();
    diamond_runs_sink_once();
}

fn untaken_branch_is_ignored() {
    let runs = Rc::new(Cell::new(0));
    let use_x = create_source(true);
    let x = create_source(1);
    let y = create_source(100);
    let pick = counted(&runs, move |get| {
        if get.get(&use_x)? {
            get.get(&x)
        } else {
            get.get(&y)
        }
    });

    assert_eq!(get(&pick).unwrap(), 1);
    set(&y, 200).unwrap();
    assert_eq!(runs.get(), 1, "y is not read yet");

    set(&use_x, false).unwrap();
    assert_eq!(get(&pick).unwrap(), 200);
    assert_eq!(runs.get(), 2);

    set(&x, 2).unwrap();
    assert_eq!(runs.get(), 2, "x is no longer read");
    set(&y, 300).unwrap();
    assert_eq!(get(&pick).unwrap(), 300);
    assert_eq!(runs.get(), 3);
}

#[test]
fn dynamic_dependencies_fallback() {
    untaken_branch_is_ignored();
}

#[test]
fn dynamic_dependencies_accelerated() {
    use_flat_backend();
    untaken_branch_is_ignored();
}

/// `d` switches to the deep end of a chain in the same write that updates
/// the chain.
fn branch_into_a_deeper_chain() {
    let s = create_source(0);
    let x1 = create_derived(move |get| Ok(get.get(&s)? + 1));
    let x2 = create_derived(move |get| Ok(get.get(&x1)? + 1));
    let x3 = create_derived(move |get| Ok(get.get(&x2)? + 1));
    let x = create_derived(move |get| Ok(get.get(&x3)? + 1));
    let flag = create_derived(move |get| Ok(get.get(&s)? > 0));
    let d = create_derived(move |get| if get.get(&flag)? { get.get(&x) } else { Ok(0) });

    assert_eq!(get(&x).unwrap(), 4);
    assert_eq!(get(&d).unwrap(), 0);

    set(&s, 5).unwrap();
    assert_eq!(get(&x).unwrap(), 9);
    assert_eq!(get(&d).unwrap(), get(&x).unwrap());

    set(&s, 7).unwrap();
    assert_eq!(get(&d).unwrap(), 11);
    set(&s, 0).unwrap();
    assert_eq!(get(&d).unwrap(), 0);
}

#[test]
fn new_branch_reads_current_values_fallback() {
    branch_into_a_deeper_chain();
}

#[test]
fn new_branch_reads_current_values_accelerated() {
    use_flat_backend();
    branch_into_a_deeper_chain();
}

#[test]
fn writing_a_derived_atom_is_an_error() {
    let a = create_source(1);
    let b = create_derived(move |get| Ok(get.get(&a)? + 1));

    let err = set(&b, 10).unwrap_err();
    assert!(matches!(err, ReactiveError::ReadOnlyAtom(id) if id == b.id()));
    assert_eq!(get(&b).unwrap(), 2);
}

#[test]
fn read_errors_abort_the_cycle_but_keep_the_write() {
    let a = create_source(1);
    let checked = create_derived(move |get| {
        let v = get.get(&a)?;
        if v > 5 {
            Err(ReactiveError::user(format!("{v} is out of range")))
        } else {
            Ok(v)
        }
    });
    assert_eq!(get(&checked).unwrap(), 1);

    let err = set(&a, 10).unwrap_err();
    assert_eq!(err.to_string(), "read function failed: 10 is out of range");
    assert_eq!(get(&a).unwrap(), 10);

    set(&a, 3).unwrap();
    assert_eq!(get(&checked).unwrap(), 3);
}

#[test]
fn cyclic_derivation_is_reported() {
    let late: Rc<Cell<Option<Atom<i32>>>> = Rc::new(Cell::new(None));
    let handle = late.clone();
    let first = create_derived(move |get| match handle.get() {
        Some(other) => get.get(&other),
        None => Ok(0),
    });
    let second = create_derived(move |get| get.get(&first));
    late.set(Some(second));

    assert!(matches!(get(&second), Err(ReactiveError::Cycle(_))));
}

#[test]
fn nan_over_nan_is_a_noop_with_bitwise_equality() {
    let x = create_source_with(f64::NAN, |a: &f64, b: &f64| a.to_bits() == b.to_bits());
    let (cb, hits) = counter();
    let _sub = subscribe(&x, cb).unwrap();

    set(&x, f64::NAN).unwrap();
    flush();
    assert_eq!(hits.get(), 0);

    set(&x, 0.5).unwrap();
    flush();
    assert_eq!(hits.get(), 1);
}

#[test]
fn write_from_a_read_function_is_deferred() {
    let a = create_source(1);
    let b = create_source(0);
    let mirror = create_derived(move |get| {
        let v = get.get(&a)?;
        set(&b, v * 10)?;
        Ok(v)
    });
    let from_b = create_derived(move |get| Ok(get.get(&b)? + 1));

    assert_eq!(get(&from_b).unwrap(), 1);
    assert_eq!(get(&mirror).unwrap(), 1);
    assert_eq!(get(&from_b).unwrap(), 11);

    set(&a, 2).unwrap();
    assert_eq!(get(&mirror).unwrap(), 2);
    assert_eq!(get(&b).unwrap(), 20);
    assert_eq!(get(&from_b).unwrap(), 21);
}

// ----------------------------------------------------------------------------
// Scheduling and consumers
// ----------------------------------------------------------------------------

#[test]
fn batch_coalesces_notifications() {
    let a = create_source(0);
    let doubled = create_derived(move |get| Ok(get.get(&a)? * 2));
    let (cb_a, hits_a) = counter();
    let (cb_d, hits_d) = counter();
    let _sa = subscribe(&a, cb_a).unwrap();
    let _sd = subscribe(&doubled, cb_d).unwrap();

    let returned = batch(|| {
        set(&a, 1).unwrap();
        set(&a, 2).unwrap();
        update(&a, |v| v + 1).unwrap();
        "done"
    });
    assert_eq!(returned, "done");
    assert_eq!(get(&doubled).unwrap(), 6);

    assert_eq!(hits_a.get(), 0);
    assert_eq!(hits_d.get(), 0);
    assert_eq!(flush(), 2);
    assert_eq!(hits_a.get(), 1);
    assert_eq!(hits_d.get(), 1);
}

#[test]
fn consumer_reading_two_changed_atoms_runs_once() {
    let a = create_source(0);
    let b = create_source(0);
    let runs = Rc::new(Cell::new(0));
    let runs_clone = runs.clone();
    let consumer = Callback::new(move || {
        runs_clone.set(runs_clone.get() + 1);
        get(&a).unwrap();
        get(&b).unwrap();
    });

    with_render_context(&consumer);
    set(&a, 1).unwrap();
    set(&b, 1).unwrap();
    flush();
    assert_eq!(runs.get(), 2);
}

#[test]
fn disposed_consumer_is_never_notified() {
    let a = create_source(0);
    let (inner, hits) = counter();
    let consumer = Callback::new(move || {
        get(&a).unwrap();
        inner.invoke();
    });

    with_render_context(&consumer);
    assert_eq!(hits.get(), 1);

    dispose_effect(&consumer);
    for v in 1..4 {
        set(&a, v).unwrap();
        flush();
    }
    assert_eq!(hits.get(), 1);
    assert_eq!(atom_info(&a).unwrap().subscribers, 0);
}

#[test]
fn superseded_render_context_drops_stale_atoms() {
    let show_detail = create_source(true);
    let detail = create_source("a");
    let log = Rc::new(RefCell::new(Vec::new()));
    let log_clone = log.clone();

    let view = Callback::new(move || {
        if get(&show_detail).unwrap() {
            log_clone.borrow_mut().push(get(&detail).unwrap());
        } else {
            log_clone.borrow_mut().push("hidden");
        }
    });
    with_render_context(&view);

    set(&show_detail, false).unwrap();
    flush();
    set(&detail, "b").unwrap();
    flush();

    assert_eq!(*log.borrow(), vec!["a", "hidden"]);
}

#[test]
fn nested_render_contexts_track_independently() {
    let outer_src = create_source(0);
    let inner_src = create_source(0);
    let (inner_hits_cb, inner_hits) = counter();
    let inner = Callback::new(move || {
        get(&inner_src).unwrap();
        inner_hits_cb.invoke();
    });
    let inner_for_outer = inner.clone();
    let (outer_hits_cb, outer_hits) = counter();
    let outer = Callback::new(move || {
        get(&outer_src).unwrap();
        with_render_context(&inner_for_outer);
        outer_hits_cb.invoke();
    });

    with_render_context(&outer);
    assert_eq!((outer_hits.get(), inner_hits.get()), (1, 1));

    // Only the inner consumer read inner_src.
    set(&inner_src, 1).unwrap();
    flush();
    assert_eq!((outer_hits.get(), inner_hits.get()), (1, 2));

    set(&outer_src, 1).unwrap();
    flush();
    assert_eq!((outer_hits.get(), inner_hits.get()), (2, 3));
}

#[test]
fn effects_clean_up_and_stop_after_dispose() {
    let count = create_source(0);
    let active = Rc::new(Cell::new(0));
    let active_clone = active.clone();

    let effect = create_effect(move || {
        get(&count).unwrap();
        active_clone.set(active_clone.get() + 1);
        let active = active_clone.clone();
        on_cleanup(move || active.set(active.get() - 1));
    });
    assert_eq!(active.get(), 1);

    set(&count, 1).unwrap();
    flush();
    assert_eq!(active.get(), 1, "previous run was cleaned up");
    assert_eq!(effect.run_count(), 2);

    effect.dispose();
    assert_eq!(active.get(), 0);
    set(&count, 2).unwrap();
    flush();
    assert_eq!(effect.run_count(), 2);
}

#[tokio::test]
async fn local_task_flushes_on_the_executor() {
    let local = tokio::task::LocalSet::new();
    run_local(&local, async {
        configure(EngineConfig::default().with_flush(FlushMode::LocalTask)).unwrap();

        let a = create_source(0);
        let (cb, hits) = counter();
        let _sub = subscribe(&a, cb).unwrap();

        set(&a, 1).unwrap();
        set(&a, 2).unwrap();
        assert!(is_flush_scheduled());
        assert_eq!(hits.get(), 0);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hits.get(), 1);
        assert!(!is_flush_scheduled());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn local_task_mode_on_a_multi_thread_runtime_does_not_panic() {
    configure(EngineConfig::default().with_flush(FlushMode::LocalTask)).unwrap();

    let a = create_source(0);
    let (cb, hits) = counter();
    let _sub = subscribe(&a, cb).unwrap();

    set(&a, 1).unwrap();
    assert!(is_flush_scheduled());

    // No local set to spawn on: the host flushes.
    assert_eq!(flush(), 1);
    assert_eq!(hits.get(), 1);
}

#[tokio::test]
async fn local_task_mode_outside_run_local_does_not_panic() {
    configure(EngineConfig::default().with_flush(FlushMode::LocalTask)).unwrap();

    let a = create_source(0);
    let (cb, hits) = counter();
    let _sub = subscribe(&a, cb).unwrap();

    set(&a, 1).unwrap();
    tokio::task::yield_now().await;
    assert_eq!(hits.get(), 0);
    assert_eq!(flush(), 1);
    assert_eq!(hits.get(), 1);
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

struct MisplacedBuffer {
    memory: LinearMemory,
}

impl PropagationBackend for MisplacedBuffer {
    fn create_node(&mut self) -> NodeId {
        NodeId::from(0)
    }
    fn add_edge(&mut self, _: NodeId, _: NodeId) {}
    fn propagate(&mut self, _: NodeId) -> usize {
        0
    }
    fn update_buffer_ptr(&self) -> usize {
        self.memory.len() - 4
    }
    fn update_buffer_capacity(&self) -> usize {
        8
    }
    fn memory(&self) -> &LinearMemory {
        &self.memory
    }
}

#[test]
fn rejected_backend_leaves_fallback_working() {
    let a = create_source(1);
    let b = create_derived(move |get| Ok(get.get(&a)? + 1));
    get(&b).unwrap();

    let backend = MisplacedBuffer {
        memory: LinearMemory::new(1),
    };
    let result = Runtime::with(|rt| rt.install_backend(Box::new(backend)));
    assert!(matches!(result, Err(ReactiveError::Backend(_))));
    assert!(!Runtime::with(|rt| rt.has_backend()));

    set(&a, 2).unwrap();
    assert_eq!(get(&b).unwrap(), 3);
}

#[test]
fn backend_installed_mid_session_takes_over() {
    let a = create_source(1);
    let b = create_derived(move |get| Ok(get.get(&a)? * 3));
    assert_eq!(get(&b).unwrap(), 3);

    use_flat_backend();
    let snapshot = vitrio_core::graph_snapshot();
    assert!(snapshot.backend);
    assert!(snapshot.cells.iter().all(|cell| cell.node.is_some()));

    set(&a, 2).unwrap();
    assert_eq!(get(&b).unwrap(), 6);
}

// ----------------------------------------------------------------------------
// Fallback / accelerated equivalence
// ----------------------------------------------------------------------------

/// Final values, per write the set of notified atoms, and the values of an
/// identical graph built from scratch with the final source values.
type Trace = (Vec<i64>, Vec<BTreeSet<usize>>, Vec<i64>);

/// Three sources followed by the derived atoms of a fixed graph.
///
/// `d2` picks between two branches of equal depth. `pick` switches between
/// a source and the end of a three-step chain on the sign of `s0`, so a
/// single write can both update the chain and make `pick` start reading it.
/// `d4` clamps, which stops propagation on unchanged values.
fn build_graph(init: [i64; 3]) -> Vec<Atom<i64>> {
    let s0 = create_source(init[0]);
    let s1 = create_source(init[1]);
    let s2 = create_source(init[2]);
    let d0 = create_derived(move |get| Ok(get.get(&s0)? + get.get(&s1)?));
    let d1 = create_derived(move |get| Ok(get.get(&s1)? * 2));
    let d2 = create_derived(move |get| {
        if get.get(&s2)? > 0 {
            get.get(&d0)
        } else {
            get.get(&d1)
        }
    });
    let d3 = create_derived(move |get| Ok(get.get(&d0)? + get.get(&d2)?));
    let d4 = create_derived(move |get| Ok(get.get(&d3)?.clamp(-50, 50) / 10));

    let c1 = create_derived(move |get| Ok(get.get(&s0)? + 1));
    let c2 = create_derived(move |get| Ok(get.get(&c1)? * 2));
    let c3 = create_derived(move |get| Ok(get.get(&c2)? - get.get(&s1)?));
    let gate = create_derived(move |get| Ok(i64::from(get.get(&s0)? > 0)));
    let pick = create_derived(move |get| {
        if get.get(&gate)? == 1 {
            get.get(&c3)
        } else {
            get.get(&s2)
        }
    });
    let tail = create_derived(move |get| Ok(get.get(&pick)? + get.get(&d4)?));

    vec![s0, s1, s2, d0, d1, d2, d3, d4, c1, c2, c3, gate, pick, tail]
}

/// Replay `writes` against [`build_graph`] on the calling thread's runtime.
fn replay(writes: &[(usize, i64)], accelerated: bool) -> Trace {
    if accelerated {
        use_flat_backend();
    }

    let atoms = build_graph([0; 3]);
    let sources = [atoms[0], atoms[1], atoms[2]];

    let notified = Rc::new(RefCell::new(BTreeSet::new()));
    let _subs: Vec<_> = atoms
        .iter()
        .enumerate()
        .map(|(i, atom)| {
            let notified = notified.clone();
            subscribe(atom, Callback::new(move || {
                notified.borrow_mut().insert(i);
            }))
            .unwrap()
        })
        .collect();
    for atom in &atoms {
        get(atom).unwrap();
    }

    let mut log = Vec::new();
    for &(which, value) in writes {
        set(&sources[which % sources.len()], value).unwrap();
        flush();
        log.push(std::mem::take(&mut *notified.borrow_mut()));
    }

    let values: Vec<i64> = atoms.iter().map(|atom| get(atom).unwrap()).collect();

    // Nothing cached: every cell of the copy is computed on first read.
    let fresh = build_graph([values[0], values[1], values[2]]);
    let expected = fresh.iter().map(|atom| get(atom).unwrap()).collect();
    (values, log, expected)
}

fn replay_on_fresh_thread(writes: Vec<(usize, i64)>, accelerated: bool) -> Trace {
    std::thread::spawn(move || replay(&writes, accelerated))
        .join()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn strategies_agree_with_each_other_and_with_fresh_graphs(
        writes in prop::collection::vec((0usize..3, -40i64..40), 1..24)
    ) {
        let fallback = replay_on_fresh_thread(writes.clone(), false);
        let accelerated = replay_on_fresh_thread(writes, true);
        prop_assert_eq!(&fallback.0, &fallback.2, "fallback left a stale value");
        prop_assert_eq!(&accelerated.0, &accelerated.2, "accelerated left a stale value");
        prop_assert_eq!(fallback, accelerated);
    }
}
