//! Concurrent mark and sweep coordinator.
//!
//! One GC thread per [`GcRuntime`] runs every cycle:
//!
//! 1. raise the suspension flag and wait until every mutator is parked or
//!    outside managed code,
//! 2. publish every mutator's allocation queue,
//! 3. mark from the roots of the [`ObjectGraph`], then clear weak slots
//!    whose target stayed white,
//! 4. resume mutators,
//! 5. sweep the heap: black objects turn white and stay, white objects are
//!    freed or, if they need finalization, moved to the finalizer thread.
//!
//! Sweep holds the heap lock for the whole pass, so mutators that publish
//! meanwhile wait for it; their fresh white objects are never swept by the
//! cycle that did not see them marked.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::alloc::{AlignedAllocator, ByteAllocator};
use crate::config::GcConfig;
use crate::factory::{FactoryIterable, FinalizerQueue, ObjectFactory};
use crate::gc::finalizer::{FinalizerHooks, FinalizerProcessor, TypeFinalizers};
use crate::gc::mark::{self, ObjectGraph};
use crate::gc::safepoint::ThreadRegistry;
use crate::gc::state::{CollectorPhase, Epoch, GcStateHolder, ScheduledWait};
use crate::metrics::{GcHistory, GcMetrics, GlobalMetrics, PhaseTimer};
use crate::mutator::MutatorThread;
use crate::object::{Color, ObjRef};
#[cfg(feature = "tracing")]
use crate::tracing::internal::{self as trace, GcPhase};

/// State shared by the runtime handle, the GC thread and every mutator.
pub(crate) struct GcShared<A: ByteAllocator> {
    pub(crate) config: GcConfig,
    pub(crate) factory: ObjectFactory<A>,
    pub(crate) state: Arc<GcStateHolder>,
    pub(crate) threads: ThreadRegistry<A>,
    pub(crate) finalizer: FinalizerProcessor<A>,
    pub(crate) graph: Arc<dyn ObjectGraph>,
    pub(crate) hooks: Arc<dyn FinalizerHooks>,
    pub(crate) metrics: Arc<GlobalMetrics>,
    pub(crate) history: GcHistory,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepStats {
    pub(crate) swept: usize,
    pub(crate) finalizable: usize,
    pub(crate) surviving: usize,
}

/// A heap with its collector.
///
/// Threads that allocate attach with [`GcRuntime::attach_thread`]. Dropping
/// the runtime stops the GC thread and drains the finalizer thread; every
/// [`MutatorThread`] must be dropped first.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use cms_gc::{GcConfig, GcRuntime, ObjHeader, RootSet, TypeInfo};
///
/// static BOX: TypeInfo = TypeInfo::object("Box", std::mem::size_of::<ObjHeader>() + 8);
///
/// let roots = Arc::new(RootSet::new());
/// let runtime = GcRuntime::new(GcConfig::manual(), roots.clone());
/// let mut mutator = runtime.attach_thread();
///
/// let kept = mutator.create_object(&BOX);
/// roots.add(kept);
/// mutator.create_object(&BOX);
///
/// mutator.schedule_and_wait_full_gc();
/// assert_eq!(runtime.object_factory().len(), 1);
/// ```
pub struct GcRuntime<A: ByteAllocator = AlignedAllocator> {
    shared: Arc<GcShared<A>>,
    gc_thread: Option<JoinHandle<()>>,
}

impl GcRuntime<AlignedAllocator> {
    /// Creates a runtime over the platform allocator, running the finalizers
    /// declared on [`TypeInfo`](crate::TypeInfo).
    #[must_use]
    pub fn new(config: GcConfig, graph: Arc<dyn ObjectGraph>) -> Self {
        Self::with_hooks(config, graph, Arc::new(TypeFinalizers))
    }
}

impl<A: ByteAllocator> GcRuntime<A> {
    /// Creates a runtime with a custom finalizer registry.
    ///
    /// # Panics
    ///
    /// Panics if the GC thread cannot be spawned.
    #[must_use]
    pub fn with_hooks(
        config: GcConfig,
        graph: Arc<dyn ObjectGraph>,
        hooks: Arc<dyn FinalizerHooks>,
    ) -> Self {
        let state = Arc::new(GcStateHolder::new());
        let metrics = Arc::new(GlobalMetrics::new());
        let finalizer = {
            let state = Arc::clone(&state);
            let metrics = Arc::clone(&metrics);
            FinalizerProcessor::with_counter(
                Arc::clone(&hooks),
                Box::new(move |epoch| state.finalized(epoch)),
                Box::new(move |count| metrics.record_finalized(count)),
            )
        };
        let shared = Arc::new(GcShared {
            config,
            factory: ObjectFactory::new(),
            state,
            threads: ThreadRegistry::new(),
            finalizer,
            graph,
            hooks,
            metrics,
            history: GcHistory::new(),
        });

        let gc_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("cms-gc".into())
                .spawn(move || gc_thread_loop(&shared))
                .unwrap_or_else(|err| panic!("failed to spawn the GC thread: {err}"))
        };

        Self {
            shared,
            gc_thread: Some(gc_thread),
        }
    }

    /// Attaches the calling thread as a mutator. Waits if the world is
    /// currently stopped.
    #[must_use]
    pub fn attach_thread(&self) -> MutatorThread<A> {
        MutatorThread::attach(Arc::clone(&self.shared))
    }

    /// Requests a cycle without waiting for it. Returns its epoch.
    pub fn request_gc(&self) -> Epoch {
        self.shared.state.schedule()
    }

    /// Requests a cycle and waits until it has swept.
    ///
    /// Meant for threads that are not attached: an attached thread must use
    /// [`MutatorThread::schedule_and_wait_full_gc`], or the collector waits for
    /// it forever.
    pub fn collect(&self) {
        let epoch = self.shared.state.schedule();
        self.shared.state.wait_epoch_finished(epoch);
    }

    /// Like [`GcRuntime::collect`], also waiting for the cycle's finalizers.
    pub fn collect_with_finalizers(&self) {
        let epoch = self.shared.state.schedule();
        self.shared.state.wait_epoch_finalized(epoch);
    }

    /// Current collector phase.
    #[must_use]
    pub fn phase(&self) -> CollectorPhase {
        self.shared.state.phase()
    }

    /// Epoch bookkeeping.
    #[must_use]
    pub fn state(&self) -> &GcStateHolder {
        &self.shared.state
    }

    /// The heap.
    #[must_use]
    pub fn object_factory(&self) -> &ObjectFactory<A> {
        &self.shared.factory
    }

    /// Published objects, in heap order.
    #[must_use]
    pub fn alive_objects(&self) -> Vec<ObjRef> {
        self.shared
            .factory
            .lock_for_iter()
            .iter()
            .map(|node| node.as_obj())
            .collect()
    }

    /// Configuration the runtime was created with.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    /// Number of attached mutator threads.
    #[must_use]
    pub fn mutator_count(&self) -> usize {
        self.shared.threads.len()
    }

    /// Statistics of the most recent cycle.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        self.shared.history.last()
    }

    /// Statistics of the recent cycles.
    #[must_use]
    pub fn history(&self) -> &GcHistory {
        &self.shared.history
    }

    /// Cumulative statistics.
    #[must_use]
    pub fn metrics(&self) -> &GlobalMetrics {
        &self.shared.metrics
    }

    /// Returns `true` while the finalizer thread exists.
    #[must_use]
    pub fn is_finalizer_thread_running(&self) -> bool {
        self.shared.finalizer.is_running()
    }

    /// Drains and stops the finalizer thread.
    #[cfg(any(test, feature = "test-util"))]
    pub fn stop_finalizer_thread_for_tests(&self) {
        self.shared.finalizer.stop_finalizer_thread();
    }

    /// Frees every published object without finalization.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_for_tests(&self) {
        self.shared.factory.clear_for_tests();
    }
}

impl<A: ByteAllocator> Drop for GcRuntime<A> {
    fn drop(&mut self) {
        self.shared.state.shutdown();
        if let Some(handle) = self.gc_thread.take() {
            if let Err(payload) = handle.join() {
                if !thread::panicking() {
                    std::panic::resume_unwind(payload);
                }
            }
        }
        self.shared.finalizer.stop_finalizer_thread();
    }
}

fn gc_thread_loop<A: ByteAllocator>(shared: &GcShared<A>) {
    loop {
        let epoch = match shared.config.effective_regular_interval() {
            Some(interval) => match shared.state.wait_scheduled_for(interval) {
                ScheduledWait::Scheduled(epoch) => epoch,
                ScheduledWait::TimedOut => shared.state.schedule(),
                ScheduledWait::Shutdown => break,
            },
            None => match shared.state.wait_scheduled() {
                Some(epoch) => epoch,
                None => break,
            },
        };
        perform_full_gc(shared, epoch);
    }
}

/// Runs cycle `epoch` to the end of sweep and hands its garbage to the
/// finalizer thread. Returns `false` if the world could not be stopped.
pub(crate) fn perform_full_gc<A: ByteAllocator>(shared: &GcShared<A>, epoch: Epoch) -> bool {
    #[cfg(feature = "tracing")]
    let _span = trace::trace_gc_cycle(epoch);

    let cycle_start = Instant::now();
    let mut timer = PhaseTimer::new();

    if !shared.threads.request_suspension() {
        #[cfg(feature = "tracing")]
        tracing::debug!(epoch, "suspension already requested, skipping cycle");
        return false;
    }
    shared.state.start(epoch);

    timer.start();
    let mutator_threads = {
        #[cfg(feature = "tracing")]
        let _phase = trace::trace_phase(GcPhase::Suspend);
        shared.threads.wait_for_suspension()
    };
    timer.end_suspend();

    timer.start();
    let mark_stats = {
        #[cfg(feature = "tracing")]
        let _phase = trace::trace_phase(GcPhase::Mark);
        // SAFETY: every mutator is parked or in native code.
        unsafe { shared.threads.publish_all() };
        #[cfg(feature = "tracing")]
        trace::log_phase_start(GcPhase::Mark, shared.factory.len());
        // SAFETY: the world is stopped and every queue is published.
        let stats = unsafe { mark::mark(&*shared.graph) };
        #[cfg(feature = "tracing")]
        trace::log_phase_end(GcPhase::Mark, stats.objects_marked);
        stats
    };
    timer.end_mark();

    // Objects published after this point were allocated after marking and
    // must not be swept, so the heap is locked before anyone resumes.
    let mut heap = shared.factory.lock_for_iter();
    shared.threads.resume_threads();
    shared.state.begin_sweep(epoch);

    timer.start();
    let (finalizer_queue, sweep_stats) = {
        #[cfg(feature = "tracing")]
        let _phase = trace::trace_phase(GcPhase::Sweep);
        let result = sweep(&mut heap, &*shared.hooks);
        #[cfg(feature = "tracing")]
        trace::log_phase_end(GcPhase::Sweep, result.1.swept + result.1.finalizable);
        result
    };
    drop(heap);
    timer.end_sweep();

    let metrics = GcMetrics {
        epoch,
        duration: cycle_start.elapsed(),
        pause_duration: timer.pause(),
        suspend_duration: timer.suspend,
        mark_duration: timer.mark,
        sweep_duration: timer.sweep,
        objects_marked: mark_stats.objects_marked,
        weak_references_cleared: mark_stats.weak_references_cleared,
        objects_swept: sweep_stats.swept,
        objects_finalizable: sweep_stats.finalizable,
        objects_surviving: sweep_stats.surviving,
        mutator_threads,
    };
    shared.metrics.record_cycle(&metrics);
    shared.history.push(metrics);

    shared.state.finish(epoch);
    shared.finalizer.schedule_tasks(finalizer_queue, epoch);
    true
}

/// Frees white objects, moves white objects needing finalization into the
/// returned queue, and turns black objects white again.
pub(crate) fn sweep<A: ByteAllocator>(
    heap: &mut FactoryIterable<'_, A>,
    hooks: &dyn FinalizerHooks,
) -> (FinalizerQueue<A>, SweepStats) {
    let mut finalizer_queue = FinalizerQueue::new();
    let mut stats = SweepStats::default();

    let mut cursor = heap.cursor();
    while let Some(node) = cursor.current() {
        let gc_data = node.gc_object_data();
        if gc_data.color() == Color::Black {
            gc_data.set_color(Color::White);
            stats.surviving += 1;
            cursor.advance();
        } else if hooks.has_finalizer(node.as_obj()) {
            stats.finalizable += 1;
            cursor.move_and_advance(&mut finalizer_queue);
        } else {
            stats.swept += 1;
            cursor.erase_and_advance();
        }
    }

    (finalizer_queue, stats)
}
