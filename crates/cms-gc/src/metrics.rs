//! GC metrics and statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics from one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcMetrics {
    /// Epoch of the cycle.
    pub epoch: u64,
    /// Wall time from the suspension request to the end of sweep.
    pub duration: Duration,
    /// Time mutators were stopped (suspend + mark).
    pub pause_duration: Duration,
    /// Time spent waiting for mutators to reach a safepoint.
    pub suspend_duration: Duration,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Number of objects marked black.
    pub objects_marked: usize,
    /// Number of weak slots cleared because their target died.
    pub weak_references_cleared: usize,
    /// Number of objects freed directly by the sweeper.
    pub objects_swept: usize,
    /// Number of objects handed to the finalizer thread.
    pub objects_finalizable: usize,
    /// Number of objects surviving the cycle.
    pub objects_surviving: usize,
    /// Number of attached mutator threads when the cycle stopped the world.
    pub mutator_threads: usize,
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            epoch: 0,
            duration: Duration::ZERO,
            pause_duration: Duration::ZERO,
            suspend_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            objects_marked: 0,
            weak_references_cleared: 0,
            objects_swept: 0,
            objects_finalizable: 0,
            objects_surviving: 0,
            mutator_threads: 0,
        }
    }

    /// Objects reclaimed by the cycle, finalized or not.
    #[must_use]
    pub const fn objects_reclaimed(&self) -> usize {
        self.objects_swept + self.objects_finalizable
    }
}

/// Captures phase durations of a cycle.
///
/// ```
/// use cms_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... wait for safepoints ...
/// timer.end_suspend();
/// timer.start();
/// // ... mark ...
/// timer.end_mark();
/// assert!(timer.pause() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Suspension phase time.
    pub suspend: Duration,
    /// Mark phase time.
    pub mark: Duration,
    /// Sweep phase time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            suspend: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the suspension phase and record its duration.
    pub fn end_suspend(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.suspend = start.elapsed();
        }
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    /// End the sweep phase and record its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }

    /// Time mutators were stopped.
    #[must_use]
    pub fn pause(&self) -> Duration {
        self.suspend + self.mark
    }
}

/// Cumulative statistics of one runtime.
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    objects_swept: AtomicUsize,
    objects_finalized: AtomicUsize,
    pause_ns: AtomicU64,
    oom_collections: AtomicUsize,
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            objects_swept: AtomicUsize::new(0),
            objects_finalized: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            oom_collections: AtomicUsize::new(0),
        }
    }

    /// Returns the total number of collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects freed by the sweeper.
    #[inline]
    #[must_use]
    pub fn total_objects_swept(&self) -> usize {
        self.objects_swept.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects whose finalizer ran.
    #[inline]
    #[must_use]
    pub fn total_objects_finalized(&self) -> usize {
        self.objects_finalized.load(Ordering::Relaxed)
    }

    /// Returns the total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Returns how many collections were requested by allocation failure.
    #[inline]
    #[must_use]
    pub fn total_oom_collections(&self) -> usize {
        self.oom_collections.load(Ordering::Relaxed)
    }

    pub(crate) fn record_cycle(&self, metrics: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.objects_swept
            .fetch_add(metrics.objects_swept, Ordering::Relaxed);
        let pause_ns = u64::try_from(metrics.pause_duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(pause_ns, Ordering::Relaxed);
    }

    pub(crate) fn record_finalized(&self, count: usize) {
        self.objects_finalized.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_oom(&self) {
        self.oom_collections.fetch_add(1, Ordering::Relaxed);
    }
}

/// Ring buffer size for GC history.
const HISTORY_SIZE: usize = 64;

/// The most recent cycles of a runtime, oldest first.
#[derive(Debug, Default)]
pub struct GcHistory {
    entries: Mutex<VecDeque<GcMetrics>>,
}

impl GcHistory {
    /// Create an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, metrics: GcMetrics) {
        let mut entries = self.entries.lock();
        if entries.len() == HISTORY_SIZE {
            entries.pop_front();
        }
        entries.push_back(metrics);
    }

    /// The most recent cycle, or zeroed metrics if none ran yet.
    #[must_use]
    pub fn last(&self) -> GcMetrics {
        self.entries.lock().back().copied().unwrap_or_default()
    }

    /// Snapshot of up to the last 64 cycles.
    #[must_use]
    pub fn recent(&self) -> Vec<GcMetrics> {
        self.entries.lock().iter().copied().collect()
    }

    /// Average pause over the recorded cycles.
    #[must_use]
    pub fn average_pause(&self) -> Duration {
        let entries = self.entries.lock();
        let count = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        if count == 0 {
            return Duration::ZERO;
        }
        entries.iter().map(|m| m.pause_duration).sum::<Duration>() / count
    }
}
