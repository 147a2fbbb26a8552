//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collection cycles and the finalizer thread.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    /// Phases of one collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Waiting for every mutator to reach a safepoint.
        Suspend,
        /// Tracing the object graph while mutators are stopped.
        Mark,
        /// Reclaiming white nodes concurrently with mutators.
        Sweep,
    }

    /// Create a span for an entire collection cycle.
    pub fn trace_gc_cycle(epoch: u64) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_cycle", epoch).entered()
    }

    /// Create a span for one phase of a cycle.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: GcPhase, objects: usize) {
        tracing::debug!(phase = ?phase, objects, "phase_start");
    }

    /// Log the end of a phase.
    pub fn log_phase_end(phase: GcPhase, objects: usize) {
        tracing::debug!(phase = ?phase, objects, "phase_end");
    }

    /// Log a finalizer batch completing an epoch.
    pub fn log_finalizers_done(epoch: u64, finalized: usize) {
        tracing::debug!(epoch, finalized, "finalizers_done");
    }

    /// Log the finalizer thread starting or stopping.
    pub fn log_finalizer_thread(running: bool) {
        tracing::debug!(running, "finalizer_thread");
    }

    /// Log an allocation failure that is about to abort the process.
    pub fn log_oom(size: usize) {
        tracing::error!(size, "out_of_memory");
    }

    /// Log an allocation failure that triggers a collection before retrying.
    pub fn log_oom_retry(size: usize) {
        tracing::warn!(size, "allocation_failed_collecting");
    }
}
