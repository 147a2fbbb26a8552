//! End-to-end collection scenarios: roots, garbage, cycles, finalizers, weak
//! and permanent objects, and several mutator threads.

use std::collections::HashSet;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cms_gc::{
    CollectorPhase, Color, FinalizerHooks, GcConfig, GcRuntime, NodeRef, ObjHeader, ObjRef,
    RootSet, TypeInfo,
};
use parking_lot::Mutex;

const FIRST: usize = size_of::<ObjHeader>();
const SECOND: usize = FIRST + 8;
const PAIR_REFS: &[usize] = &[FIRST, SECOND];
const REFERRED: usize = FIRST;
const WEAK_REFS: &[usize] = &[REFERRED];

fn flagged(_: ObjRef) {}

static PAIR: TypeInfo = TypeInfo::object("Pair", SECOND + 8).with_references(PAIR_REFS);
static FINALIZED_PAIR: TypeInfo = TypeInfo::object("FinalizedPair", SECOND + 8)
    .with_references(PAIR_REFS)
    .with_finalizer(flagged);
static REFS: TypeInfo = TypeInfo::reference_array("Array<Any>");
static BYTES: TypeInfo = TypeInfo::array("ByteArray", 1);
static WEAK: TypeInfo = TypeInfo::object("WeakReference", REFERRED + 8).with_weak_references(WEAK_REFS);

/// A `PAIR` instance outside the heap.
#[allow(dead_code)]
#[repr(C)]
struct StaticPair {
    header: ObjHeader,
    first: Option<ObjRef>,
    second: Option<ObjRef>,
}

fn permanent_pair() -> ObjRef {
    let pair = Box::leak(Box::new(StaticPair {
        header: ObjHeader::permanent(&PAIR),
        first: None,
        second: None,
    }));
    unsafe { ObjRef::from_raw(NonNull::from(pair).cast()) }
}

/// Finalizes objects whose type declares a finalizer, recording the order.
#[derive(Default)]
struct Finalizers {
    finalized: Mutex<Vec<ObjRef>>,
}

impl FinalizerHooks for Finalizers {
    fn has_finalizer(&self, object: ObjRef) -> bool {
        unsafe { object.type_info() }.has_finalizer()
    }

    fn run_finalizer(&self, object: ObjRef) {
        self.finalized.lock().push(object);
    }
}

struct Fixture {
    roots: Arc<RootSet>,
    finalizers: Arc<Finalizers>,
    runtime: GcRuntime,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(GcConfig::manual())
    }

    fn with_config(config: GcConfig) -> Self {
        let roots = Arc::new(RootSet::new());
        let finalizers = Arc::new(Finalizers::default());
        let runtime = GcRuntime::with_hooks(config, roots.clone(), finalizers.clone());
        Self {
            roots,
            finalizers,
            runtime,
        }
    }

    fn alive(&self) -> HashSet<ObjRef> {
        self.runtime.alive_objects().into_iter().collect()
    }

    fn finalized(&self) -> Vec<ObjRef> {
        self.finalizers.finalized.lock().clone()
    }
}

fn color(object: ObjRef) -> Color {
    unsafe { NodeRef::from_object(object) }.gc_object_data().color()
}

#[test]
fn test_root_set_survives_and_turns_white() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let object = mutator.create_object(&PAIR);
    let array = mutator.create_array(&BYTES, 3);
    fixture.roots.add(object);
    fixture.roots.add(array.as_obj());

    mutator.schedule_and_wait_full_gc();

    assert_eq!(fixture.alive(), HashSet::from([object, array.as_obj()]));
    assert_eq!(color(object), Color::White);
    assert_eq!(color(array.as_obj()), Color::White);
}

#[test]
fn test_free_objects() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    mutator.create_object(&PAIR);
    mutator.create_array(&BYTES, 10);
    mutator.publish();
    assert_eq!(fixture.runtime.alive_objects().len(), 2);

    mutator.schedule_and_wait_full_gc();

    assert!(fixture.alive().is_empty());
    let metrics = fixture.runtime.last_gc_metrics();
    assert_eq!(metrics.epoch, 1);
    assert_eq!(metrics.objects_swept, 2);
    assert_eq!(metrics.objects_surviving, 0);
}

#[test]
fn test_free_objects_with_finalizers() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let first = mutator.create_object(&FINALIZED_PAIR);
    mutator.create_object(&PAIR);
    let second = mutator.create_object(&FINALIZED_PAIR);

    mutator.schedule_and_wait_full_gc_with_finalizers();

    assert!(fixture.alive().is_empty());
    assert_eq!(fixture.finalized(), vec![first, second]);
    assert_eq!(fixture.runtime.state().finalized_epoch(), 1);
    assert_eq!(fixture.runtime.metrics().total_objects_finalized(), 2);
}

#[test]
fn test_finalizers_run_once() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let doomed = mutator.create_object(&FINALIZED_PAIR);
    mutator.schedule_and_wait_full_gc_with_finalizers();
    mutator.schedule_and_wait_full_gc_with_finalizers();

    assert_eq!(fixture.finalized(), vec![doomed]);
}

#[test]
fn test_objects_reachable_from_roots_survive() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let root = mutator.create_object(&PAIR);
    let left = mutator.create_object(&PAIR);
    let array = mutator.create_array(&REFS, 2);
    let in_array = mutator.create_object(&FINALIZED_PAIR);
    let garbage = mutator.create_object(&PAIR);
    unsafe {
        root.set_field(FIRST, Some(left));
        root.set_field(SECOND, Some(array.as_obj()));
        array.set(1, Some(in_array));
        garbage.set_field(FIRST, Some(root));
    }
    fixture.roots.add(root);

    mutator.schedule_and_wait_full_gc_with_finalizers();

    assert_eq!(
        fixture.alive(),
        HashSet::from([root, left, array.as_obj(), in_array])
    );
    assert!(fixture.finalized().is_empty());
    assert_eq!(fixture.runtime.last_gc_metrics().objects_marked, 4);
}

#[test]
fn test_unreachable_cycles_are_collected() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let kept_a = mutator.create_object(&PAIR);
    let kept_b = mutator.create_object(&PAIR);
    let lost_a = mutator.create_object(&FINALIZED_PAIR);
    let lost_b = mutator.create_object(&PAIR);
    unsafe {
        kept_a.set_field(FIRST, Some(kept_b));
        kept_b.set_field(FIRST, Some(kept_a));
        lost_a.set_field(FIRST, Some(lost_b));
        lost_b.set_field(FIRST, Some(lost_a));
    }
    fixture.roots.add(kept_b);

    mutator.schedule_and_wait_full_gc_with_finalizers();

    assert_eq!(fixture.alive(), HashSet::from([kept_a, kept_b]));
    assert_eq!(fixture.finalized(), vec![lost_a]);
}

#[test]
fn test_run_gc_twice() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let root = mutator.create_object(&PAIR);
    let child = mutator.create_object(&PAIR);
    unsafe { root.set_field(FIRST, Some(child)) };
    fixture.roots.add(root);

    mutator.schedule_and_wait_full_gc();
    assert_eq!(fixture.alive(), HashSet::from([root, child]));

    unsafe { root.set_field(FIRST, None) };
    mutator.schedule_and_wait_full_gc();

    assert_eq!(fixture.alive(), HashSet::from([root]));
    assert_eq!(fixture.runtime.last_gc_metrics().epoch, 2);
    assert_eq!(fixture.runtime.metrics().total_collections(), 2);
    assert_eq!(fixture.runtime.metrics().total_objects_swept(), 1);
}

#[test]
fn test_root_removed_between_cycles() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let object = mutator.create_object(&FINALIZED_PAIR);
    fixture.roots.add(object);
    mutator.schedule_and_wait_full_gc_with_finalizers();
    assert!(fixture.finalized().is_empty());

    assert!(fixture.roots.remove(object));
    mutator.schedule_and_wait_full_gc_with_finalizers();
    assert_eq!(fixture.finalized(), vec![object]);
    assert!(fixture.alive().is_empty());
}

#[test]
fn test_multiple_mutators() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 400;

    let fixture = Fixture::new();
    let rooted = Mutex::new(HashSet::new());

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let mut mutator = fixture.runtime.attach_thread();
                for i in 0..PER_THREAD {
                    mutator.safepoint_function_prologue();
                    let object = mutator.create_object(&PAIR);
                    if i % 10 == 0 {
                        fixture.roots.add(object);
                        rooted.lock().insert(object);
                    }
                    if i % 100 == 99 {
                        mutator.schedule_and_wait_full_gc();
                    }
                    mutator.safepoint_loop_body();
                }
            });
        }
    });

    fixture.runtime.collect();

    let rooted = rooted.into_inner();
    assert_eq!(rooted.len(), THREADS * PER_THREAD / 10);
    assert_eq!(fixture.alive(), rooted);
    assert_eq!(fixture.runtime.mutator_count(), 0);
}

#[test]
fn test_concurrent_requests_share_cycles() {
    const THREADS: usize = 6;

    let fixture = Fixture::new();
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let mut mutator = fixture.runtime.attach_thread();
                mutator.create_object(&PAIR);
                mutator.schedule_and_wait_full_gc();
            });
        }
    });

    let collections = fixture.runtime.metrics().total_collections();
    assert!(collections >= 1 && collections <= THREADS, "{collections} collections");
    fixture.runtime.collect();
    assert!(fixture.alive().is_empty());
}

#[test]
fn test_detached_thread_allocations_are_collected() {
    let fixture = Fixture::new();
    let kept = thread::scope(|s| {
        s.spawn(|| {
            let mut mutator = fixture.runtime.attach_thread();
            let kept = mutator.create_object(&PAIR);
            fixture.roots.add(kept);
            mutator.create_object(&PAIR);
            kept
        })
        .join()
        .unwrap()
    });

    // Dropping the handle published both objects.
    assert_eq!(fixture.runtime.alive_objects().len(), 2);
    fixture.runtime.collect();
    assert_eq!(fixture.alive(), HashSet::from([kept]));
}

#[test]
fn test_native_thread_does_not_block_collection() {
    let fixture = Fixture::new();
    let mut idle = fixture.runtime.attach_thread();
    let garbage = idle.create_object(&PAIR);

    // `idle` never polls; it is blocked waiting, so the cycle proceeds.
    thread::scope(|s| {
        s.spawn(|| {
            let mut worker = fixture.runtime.attach_thread();
            worker.create_object(&PAIR);
            worker.schedule_and_wait_full_gc();
        });
        idle.schedule_and_wait_full_gc();
    });

    assert!(!fixture.alive().contains(&garbage));
    drop(idle);
}

#[test]
#[cfg(feature = "test-util")]
fn test_finalizer_thread_restarts_after_stop() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let first = mutator.create_object(&FINALIZED_PAIR);
    mutator.schedule_and_wait_full_gc_with_finalizers();
    assert!(fixture.runtime.is_finalizer_thread_running());
    mutator.stop_finalizer_thread_for_tests();
    assert!(!fixture.runtime.is_finalizer_thread_running());

    let second = mutator.create_object(&FINALIZED_PAIR);
    mutator.schedule_and_wait_full_gc_with_finalizers();
    assert_eq!(fixture.finalized(), vec![first, second]);
    assert_eq!(fixture.runtime.state().finalized_epoch(), 2);
}

#[test]
fn test_phase_returns_to_idle() {
    let fixture = Fixture::new();
    assert_eq!(fixture.runtime.phase(), CollectorPhase::Idle);
    fixture.runtime.collect();
    assert_eq!(fixture.runtime.phase(), CollectorPhase::Idle);
    assert_eq!(fixture.runtime.state().finished_epoch(), 1);
}

#[test]
fn test_free_object_with_free_weak() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let object = mutator.create_object(&PAIR);
    let weak = mutator.create_object(&WEAK);
    unsafe { weak.set_field(REFERRED, Some(object)) };

    mutator.schedule_and_wait_full_gc();

    assert!(fixture.alive().is_empty());
    assert_eq!(fixture.runtime.last_gc_metrics().weak_references_cleared, 0);
}

#[test]
fn test_free_object_with_held_weak() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let object = mutator.create_object(&PAIR);
    let weak = mutator.create_object(&WEAK);
    let holder = mutator.create_object(&PAIR);
    unsafe {
        weak.set_field(REFERRED, Some(object));
        holder.set_field(FIRST, Some(weak));
    }
    fixture.roots.add(holder);

    mutator.schedule_and_wait_full_gc();

    assert_eq!(fixture.alive(), HashSet::from([weak, holder]));
    assert_eq!(color(weak), Color::White);
    assert_eq!(unsafe { weak.field(REFERRED) }, None);
    assert_eq!(fixture.runtime.last_gc_metrics().weak_references_cleared, 1);
}

#[test]
fn test_weak_to_reachable_object_is_kept() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let object = mutator.create_object(&PAIR);
    let weak = mutator.create_object(&WEAK);
    unsafe { weak.set_field(REFERRED, Some(object)) };
    fixture.roots.add(weak);
    fixture.roots.add(object);

    mutator.schedule_and_wait_full_gc();

    assert_eq!(fixture.alive(), HashSet::from([object, weak]));
    assert_eq!(unsafe { weak.field(REFERRED) }, Some(object));
}

#[test]
fn test_weak_cleared_before_mutators_resume() {
    const THREADS: usize = 4;

    let fixture = Fixture::new();
    let mut owner = fixture.runtime.attach_thread();
    let object = owner.create_object(&FINALIZED_PAIR);
    let weak = owner.create_object(&WEAK);
    unsafe { weak.set_field(REFERRED, Some(object)) };
    fixture.roots.add(weak);
    owner.publish();

    let attached = Barrier::new(THREADS + 1);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let mut mutator = fixture.runtime.attach_thread();
                attached.wait();
                while fixture.runtime.state().finished_epoch() == 0 {
                    mutator.safepoint_loop_body();
                    std::hint::spin_loop();
                }
                assert_eq!(unsafe { weak.field(REFERRED) }, None);
            });
        }
        attached.wait();
        owner.schedule_and_wait_full_gc_with_finalizers();
    });

    assert_eq!(fixture.alive(), HashSet::from([weak]));
    assert_eq!(fixture.finalized(), vec![object]);
}

#[test]
fn test_permanent_objects() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();

    let permanent_root = permanent_pair();
    let permanent_object = permanent_pair();
    let heap_root = mutator.create_object(&PAIR);
    unsafe {
        permanent_root.set_field(FIRST, Some(permanent_object));
        heap_root.set_field(FIRST, Some(permanent_root));
    }
    fixture.roots.add(permanent_root);
    fixture.roots.add(heap_root);

    mutator.schedule_and_wait_full_gc();

    assert_eq!(fixture.alive(), HashSet::from([heap_root]));
    assert_eq!(color(heap_root), Color::White);
    assert_eq!(fixture.runtime.last_gc_metrics().objects_marked, 1);
    assert_eq!(
        unsafe { permanent_root.field(FIRST) },
        Some(permanent_object)
    );
}

#[test]
fn test_unbounded_regular_interval() {
    let mut config = GcConfig::new();
    config.set_regular_gc_interval(Some(Duration::MAX));
    let fixture = Fixture::with_config(config);

    fixture.runtime.collect();

    assert_eq!(fixture.runtime.state().finished_epoch(), 1);
}

#[test]
fn test_regular_interval_collects_without_requests() {
    let mut config = GcConfig::new();
    config.set_regular_gc_interval(Some(Duration::from_millis(5)));
    let fixture = Fixture::with_config(config);

    for _ in 0..2_000 {
        if fixture.runtime.metrics().total_collections() > 0 {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("the GC thread never collected on its own");
}

#[test]
#[cfg(feature = "test-util")]
fn test_clear_for_tests_skips_finalizers() {
    let fixture = Fixture::new();
    let mut mutator = fixture.runtime.attach_thread();
    mutator.create_object(&FINALIZED_PAIR);
    mutator.publish();
    mutator.create_object(&FINALIZED_PAIR);

    mutator.clear_for_tests();
    fixture.runtime.clear_for_tests();
    mutator.schedule_and_wait_full_gc_with_finalizers();

    assert!(fixture.alive().is_empty());
    assert!(fixture.finalized().is_empty());
}
