//! Epoch bookkeeping shared by mutators, the GC thread and the finalizer thread.
//!
//! A cycle is identified by its epoch. Requesting a cycle yields the epoch that
//! will satisfy the request; waiting on that epoch returns once the cycle (and,
//! optionally, its finalizers) has completed. Only the collector advances
//! `started`, `finished` and `finalized`.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Identifier of one collection cycle. Epoch 0 is "no cycle yet".
pub type Epoch = u64;

/// Coarse collector phase, derived from the epoch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    /// No cycle requested or running.
    Idle,
    /// A cycle was requested and the GC thread has not picked it up yet.
    Requested,
    /// Mutators are being stopped or the object graph is being traced.
    Marking,
    /// Mutators run again while the heap is swept.
    Sweeping,
}

/// Outcome of a bounded wait for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduledWait {
    Scheduled(Epoch),
    TimedOut,
    Shutdown,
}

#[derive(Debug, Default)]
struct Epochs {
    scheduled: Epoch,
    started: Epoch,
    finished: Epoch,
    finalized: Epoch,
    sweeping: bool,
    shutdown: bool,
}

impl Epochs {
    const fn pending(&self) -> Option<Epoch> {
        if self.scheduled > self.started {
            Some(self.scheduled)
        } else {
            None
        }
    }
}

/// Process-wide collector state of one runtime.
#[derive(Debug, Default)]
pub struct GcStateHolder {
    epochs: Mutex<Epochs>,
    cond: Condvar,
}

impl GcStateHolder {
    /// Creates the state of a runtime that has not collected yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a cycle and returns the epoch that satisfies the request.
    ///
    /// A request made while a cycle is pending joins it. A request made while
    /// a cycle is running schedules the next one, shared by every request
    /// arriving before the GC thread starts it.
    pub(crate) fn schedule(&self) -> Epoch {
        let mut epochs = self.epochs.lock();
        if epochs.scheduled <= epochs.started {
            epochs.scheduled = epochs.started + 1;
            self.cond.notify_all();
        }
        epochs.scheduled
    }

    pub(crate) fn start(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        debug_assert!(epoch > epochs.started, "epoch {epoch} started twice");
        epochs.started = epoch;
        epochs.sweeping = false;
        self.cond.notify_all();
    }

    pub(crate) fn begin_sweep(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        debug_assert_eq!(epochs.started, epoch);
        epochs.sweeping = true;
    }

    pub(crate) fn finish(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        debug_assert_eq!(epochs.started, epoch);
        epochs.finished = epoch;
        epochs.sweeping = false;
        self.cond.notify_all();
    }

    pub(crate) fn finalized(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        epochs.finalized = epochs.finalized.max(epoch);
        self.cond.notify_all();
    }

    /// Wakes every waiter; further waits return immediately.
    pub(crate) fn shutdown(&self) {
        let mut epochs = self.epochs.lock();
        epochs.shutdown = true;
        self.cond.notify_all();
    }

    /// Blocks until `epoch` has been swept, or shutdown.
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        while epochs.finished < epoch && !epochs.shutdown {
            self.cond.wait(&mut epochs);
        }
    }

    /// Blocks until the finalizers of `epoch` have run, or shutdown.
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        while epochs.finalized < epoch && !epochs.shutdown {
            self.cond.wait(&mut epochs);
        }
    }

    /// Blocks until a cycle is requested. Returns `None` on shutdown.
    pub(crate) fn wait_scheduled(&self) -> Option<Epoch> {
        let mut epochs = self.epochs.lock();
        loop {
            if epochs.shutdown {
                return None;
            }
            if let Some(epoch) = epochs.pending() {
                return Some(epoch);
            }
            self.cond.wait(&mut epochs);
        }
    }

    /// Like [`GcStateHolder::wait_scheduled`], giving up after `timeout`.
    /// A timeout too large to express as a deadline waits without one.
    pub(crate) fn wait_scheduled_for(&self, timeout: Duration) -> ScheduledWait {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self
                .wait_scheduled()
                .map_or(ScheduledWait::Shutdown, ScheduledWait::Scheduled);
        };
        let mut epochs = self.epochs.lock();
        loop {
            if epochs.shutdown {
                return ScheduledWait::Shutdown;
            }
            if let Some(epoch) = epochs.pending() {
                return ScheduledWait::Scheduled(epoch);
            }
            if self.cond.wait_until(&mut epochs, deadline).timed_out() {
                return match epochs.pending() {
                    Some(epoch) if !epochs.shutdown => ScheduledWait::Scheduled(epoch),
                    _ if epochs.shutdown => ScheduledWait::Shutdown,
                    _ => ScheduledWait::TimedOut,
                };
            }
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CollectorPhase {
        let epochs = self.epochs.lock();
        if epochs.started > epochs.finished {
            if epochs.sweeping {
                CollectorPhase::Sweeping
            } else {
                CollectorPhase::Marking
            }
        } else if epochs.pending().is_some() {
            CollectorPhase::Requested
        } else {
            CollectorPhase::Idle
        }
    }

    /// Latest epoch requested.
    #[must_use]
    pub fn scheduled_epoch(&self) -> Epoch {
        self.epochs.lock().scheduled
    }

    /// Latest epoch whose sweep completed.
    #[must_use]
    pub fn finished_epoch(&self) -> Epoch {
        self.epochs.lock().finished
    }

    /// Latest epoch whose finalizers completed.
    #[must_use]
    pub fn finalized_epoch(&self) -> Epoch {
        self.epochs.lock().finalized
    }

    /// Returns `true` once the runtime is shutting down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.epochs.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_schedule_coalesces_pending_requests() {
        let state = GcStateHolder::new();
        assert_eq!(state.phase(), CollectorPhase::Idle);
        assert_eq!(state.schedule(), 1);
        assert_eq!(state.schedule(), 1);
        assert_eq!(state.phase(), CollectorPhase::Requested);
        assert_eq!(state.wait_scheduled(), Some(1));
    }

    #[test]
    fn test_request_during_cycle_schedules_next() {
        let state = GcStateHolder::new();
        let epoch = state.schedule();
        state.start(epoch);
        assert_eq!(state.phase(), CollectorPhase::Marking);

        assert_eq!(state.schedule(), 2);
        assert_eq!(state.schedule(), 2);

        state.begin_sweep(epoch);
        assert_eq!(state.phase(), CollectorPhase::Sweeping);
        state.finish(epoch);
        assert_eq!(state.phase(), CollectorPhase::Requested);
        assert_eq!(state.finished_epoch(), 1);
    }

    #[test]
    fn test_wait_epoch_finished() {
        let state = Arc::new(GcStateHolder::new());
        let epoch = state.schedule();

        let collector = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let epoch = state.wait_scheduled().unwrap();
                state.start(epoch);
                state.finish(epoch);
                state.finalized(epoch);
            })
        };

        state.wait_epoch_finished(epoch);
        state.wait_epoch_finalized(epoch);
        collector.join().unwrap();
        assert_eq!(state.finalized_epoch(), epoch);
    }

    #[test]
    fn test_finalized_is_monotonic() {
        let state = GcStateHolder::new();
        state.finalized(3);
        state.finalized(2);
        assert_eq!(state.finalized_epoch(), 3);
    }

    #[test]
    fn test_wait_scheduled_times_out() {
        let state = GcStateHolder::new();
        assert_eq!(
            state.wait_scheduled_for(Duration::from_millis(5)),
            ScheduledWait::TimedOut
        );
    }

    #[test]
    fn test_wait_scheduled_with_unbounded_timeout() {
        let state = Arc::new(GcStateHolder::new());
        let epoch = state.schedule();
        assert_eq!(
            state.wait_scheduled_for(Duration::MAX),
            ScheduledWait::Scheduled(epoch)
        );
        state.start(epoch);
        state.finish(epoch);

        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_scheduled_for(Duration::MAX))
        };
        state.shutdown();
        assert_eq!(waiter.join().unwrap(), ScheduledWait::Shutdown);
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let state = Arc::new(GcStateHolder::new());
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                state.wait_epoch_finished(10);
                state.wait_scheduled()
            })
        };
        state.shutdown();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(state.is_shutdown());
        assert_eq!(
            state.wait_scheduled_for(Duration::from_secs(1)),
            ScheduledWait::Shutdown
        );
    }
}
